//! Discovery registry.
//!
//! Loads the discovery cache feed into two indexes: proxies by identity and
//! proxies by action key. A refresh reparses the whole feed into fresh
//! indexes and swaps them in, so readers see either the old view or the new
//! one, never a mix.

pub mod feed;
pub mod proxy;
pub mod validate;

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use feed::{FeedError, FeedReader};
use proxy::{RecordError, ServiceProxy};
use validate::RecordValidator;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot read discovery cache {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("discovery cache {0} is not a regular file")]
    NotAFile(PathBuf),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("no instances found for `{0}`")]
    NoInstances(String),

    #[error("no proxy tracked with ident `{0}`")]
    NotTracked(String),
}

/// Key used to query the action index: `sector:action~version#envelope`.
///
/// Records are stored under class-qualified names, so `action` has to be
/// given as `Class.action` to match anything.
pub fn lookup_key(sector: &str, action: &str, version: u32, envelope: &str) -> String {
    format!("{sector}:{action}~{version}#{envelope}")
}

#[derive(Default)]
struct Indexes {
    ident: HashMap<String, Arc<ServiceProxy>>,
    action: HashMap<String, Vec<Arc<ServiceProxy>>>,
}

impl Indexes {
    fn store(&mut self, proxy: Arc<ServiceProxy>) {
        if let Some(old) = self.ident.insert(proxy.ident.clone(), proxy.clone()) {
            self.purge(&old);
        }
        for key in proxy.action_keys() {
            self.action.entry(key).or_default().push(proxy.clone());
        }
    }

    fn remove(&mut self, ident: &str) -> Option<Arc<ServiceProxy>> {
        let old = self.ident.remove(ident)?;
        self.purge(&old);
        Some(old)
    }

    /// Drop every action-index entry for `old`'s identity.
    fn purge(&mut self, old: &ServiceProxy) {
        for key in old.action_keys() {
            if let Some(bucket) = self.action.get_mut(&key) {
                bucket.retain(|p| p.ident != old.ident);
                if bucket.is_empty() {
                    self.action.remove(&key);
                }
            }
        }
    }
}

struct State {
    indexes: Indexes,
    verify_records: bool,
}

/// In-memory view of the discovery cache.
pub struct Registry {
    path: PathBuf,
    validator: Arc<dyn RecordValidator>,
    state: Mutex<State>,
    /// Serializes whole refreshes; readers only take `state`.
    refresh_lock: Mutex<()>,
}

impl Registry {
    /// Open the cache at `path` with record verification on and load it.
    pub fn new(
        path: impl Into<PathBuf>,
        validator: Arc<dyn RecordValidator>,
    ) -> Result<Self, RegistryError> {
        Self::open(path, validator, true)
    }

    pub fn open(
        path: impl Into<PathBuf>,
        validator: Arc<dyn RecordValidator>,
        verify_records: bool,
    ) -> Result<Self, RegistryError> {
        let registry = Self {
            path: path.into(),
            validator,
            state: Mutex::new(State {
                indexes: Indexes::default(),
                verify_records,
            }),
            refresh_lock: Mutex::new(()),
        };
        registry.refresh()?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reparse the feed and replace both indexes.
    ///
    /// A record that fails to parse aborts the refresh and the previous
    /// indexes stay in place. A record that fails validation is skipped.
    pub fn refresh(&self) -> Result<(), RegistryError> {
        let _refreshing = self.refresh_lock.lock();
        let span = scamp_tracing::registry_refresh_span!(self.path.display());
        let _enter = span.enter();

        let io_err = |source: std::io::Error| RegistryError::Io {
            path: self.path.clone(),
            source,
        };
        let metadata = std::fs::metadata(&self.path).map_err(io_err)?;
        if !metadata.is_file() {
            return Err(RegistryError::NotAFile(self.path.clone()));
        }
        let file = File::open(&self.path).map_err(io_err)?;

        let verify = self.state.lock().verify_records;
        let mut fresh = Indexes::default();
        let mut records = 0usize;
        let mut rejected = 0usize;

        for record in FeedReader::new(BufReader::new(file)) {
            let proxy = ServiceProxy::from_feed_record(record?)?;
            records += 1;

            if verify {
                if let Err(e) = self.validator.validate(&proxy) {
                    rejected += 1;
                    tracing::warn!(
                        ident = %proxy.ident,
                        sector = %proxy.sector,
                        error = %e,
                        "Discovery record failed validation, skipping"
                    );
                    if fresh.remove(&proxy.ident).is_none() {
                        tracing::debug!(ident = %proxy.ident, "No earlier record to evict");
                    }
                    continue;
                }
            }

            fresh.store(Arc::new(proxy));
        }

        span.record("records", records);
        span.record("rejected", rejected);

        let tracked = fresh.ident.len();
        self.state.lock().indexes = fresh;

        tracing::debug!(records, rejected, tracked, "Discovery cache reloaded");
        Ok(())
    }

    /// Proxies serving `action` at `version` over `envelope` in `sector`.
    pub fn search_by_action(
        &self,
        sector: &str,
        action: &str,
        version: u32,
        envelope: &str,
    ) -> Result<Vec<Arc<ServiceProxy>>, RegistryError> {
        let key = lookup_key(sector, action, version, envelope);
        let state = self.state.lock();
        match state.indexes.action.get(&key) {
            Some(bucket) if !bucket.is_empty() => Ok(bucket.clone()),
            _ => Err(RegistryError::NoInstances(key)),
        }
    }

    pub fn retrieve(&self, ident: &str) -> Option<Arc<ServiceProxy>> {
        self.state.lock().indexes.ident.get(ident).cloned()
    }

    /// Insert or replace a proxy by identity and index all its actions.
    pub fn store(&self, proxy: ServiceProxy) {
        self.state.lock().indexes.store(Arc::new(proxy));
    }

    pub fn remove(&self, ident: &str) -> Result<Arc<ServiceProxy>, RegistryError> {
        self.state
            .lock()
            .indexes
            .remove(ident)
            .ok_or_else(|| RegistryError::NotTracked(ident.to_string()))
    }

    pub fn len(&self) -> usize {
        self.state.lock().indexes.ident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every tracked proxy, ordered by ident.
    pub fn all(&self) -> Vec<Arc<ServiceProxy>> {
        let mut proxies: Vec<_> = self.state.lock().indexes.ident.values().cloned().collect();
        proxies.sort_by(|a, b| a.ident.cmp(&b.ident));
        proxies
    }

    /// Takes effect on the next refresh.
    pub fn set_verify_records(&self, verify: bool) {
        self.state.lock().verify_records = verify;
    }

    pub fn verify_records(&self) -> bool {
        self.state.lock().verify_records
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registry")
            .field("path", &self.path)
            .field("tracked", &state.indexes.ident.len())
            .field("action_keys", &state.indexes.action.len())
            .field("verify_records", &state.verify_records)
            .finish()
    }
}
