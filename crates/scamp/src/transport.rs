//! Transport seam: an established connection and the dialer that makes one.
//!
//! TLS dialing and wire framing live behind [`Connector`]. The core sees a
//! [`Connection`] as an outbound queue drained by the transport's writer
//! (which serializes concurrent writes) and an inbound stream of decoded
//! messages that ends when the peer goes away.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::Message;

/// Errors raised while dialing or writing to a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("request id {0} already has an outstanding reply")]
    DuplicateRequestId(u64),

    #[error("failed to connect to `{connspec}`: {reason}")]
    Connect { connspec: String, reason: String },

    #[error("unsupported connspec `{0}`")]
    UnsupportedConnspec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether dialing again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Connect { .. } | TransportError::Io(_))
    }
}

/// One established, message-oriented connection.
#[derive(Debug)]
pub struct Connection {
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<Message>, inbound: mpsc::Receiver<Message>) -> Self {
        Self { outbound, inbound }
    }

    /// Two in-memory connections wired back to back. Whatever one side
    /// sends, the other receives.
    pub fn pair(capacity: usize) -> (Connection, Connection) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Connection::new(a_tx, b_rx), Connection::new(b_tx, a_rx))
    }

    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next decoded inbound message, or `None` once the peer has hung up.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    pub(crate) fn into_parts(self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        (self.outbound, self.inbound)
    }
}

/// Boxed future returned by [`Connector::connect`].
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + 'a>>;

/// Dials a proxy's advertised connspec (e.g. `beepish+tls://10.0.0.5:30100`).
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, connspec: &'a str) -> ConnectFuture<'a>;
}
