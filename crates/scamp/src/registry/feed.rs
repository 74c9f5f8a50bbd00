//! Streaming parser for the discovery cache feed.
//!
//! The feed is a sequence of records, each shaped
//!
//! ```text
//! SLOP* SEP LINE(class-records) NL BLOCK(certificate) NL BLOCK(signature) (NL | SEP)
//! ```
//!
//! where `SEP` is a line holding exactly `%%%` and a block is a run of
//! non-blank lines. Anything before a separator is ignored, so announcers
//! can append to the file without coordinating on record boundaries.

use std::io::{self, BufRead};

use thiserror::Error;

/// Line marking the start of a record.
pub const SEPARATOR: &str = "%%%";

/// The three raw sections of one announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRecord {
    pub class_records: String,
    pub certificate: String,
    pub signature: String,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to read feed: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: expected blank line after class records")]
    MissingBlankLine { line: usize },

    #[error("line {line}: record has an empty {block} block")]
    EmptyBlock { line: usize, block: &'static str },
}

/// Iterates the records of a feed.
///
/// Stops after the first error. Reaching end of input before a separator, or
/// finding a blank line (or end of input) where the class records should be,
/// ends the feed cleanly.
pub struct FeedReader<R> {
    lines: io::Lines<R>,
    /// A line read ahead that belongs to the next record.
    pending: Option<String>,
    line_no: usize,
    done: bool,
}

impl<R: BufRead> FeedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            pending: None,
            line_no: 0,
            done: false,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>, FeedError> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }
        match self.lines.next() {
            Some(line) => {
                self.line_no += 1;
                let mut line = line?;
                if line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }

    /// Collect non-blank lines until a blank line or end of input. When
    /// `stop_at_separator` is set a separator also ends the block and is
    /// kept for the next record.
    fn read_block(
        &mut self,
        block: &'static str,
        stop_at_separator: bool,
    ) -> Result<String, FeedError> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line()? {
            if line.is_empty() {
                break;
            }
            if stop_at_separator && line == SEPARATOR {
                self.pending = Some(line);
                break;
            }
            lines.push(line);
        }
        if lines.is_empty() {
            return Err(FeedError::EmptyBlock {
                line: self.line_no,
                block,
            });
        }
        Ok(lines.join("\n"))
    }

    fn read_record(&mut self) -> Result<Option<FeedRecord>, FeedError> {
        loop {
            match self.next_line()? {
                None => return Ok(None),
                Some(line) if line == SEPARATOR => break,
                Some(_) => continue,
            }
        }

        let class_records = match self.next_line()? {
            None => return Ok(None),
            Some(line) if line.is_empty() => return Ok(None),
            Some(line) => line,
        };

        if let Some(line) = self.next_line()? {
            if !line.is_empty() {
                return Err(FeedError::MissingBlankLine { line: self.line_no });
            }
        }

        let certificate = self.read_block("certificate", false)?;
        let signature = self.read_block("signature", true)?;

        Ok(Some(FeedRecord {
            class_records,
            certificate,
            signature,
        }))
    }
}

impl<R: BufRead> Iterator for FeedReader<R> {
    type Item = Result<FeedRecord, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
