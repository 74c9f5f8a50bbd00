//! Live clients keyed by connspec.
//!
//! The dispatcher asks for a client per matched proxy. Instances that share
//! a connspec share a client; a client whose connection has ended is
//! replaced by a fresh dial.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::Client;
use crate::registry::proxy::ServiceProxy;
use crate::retry::{Attempt, RetryError, RetryPolicy};
use crate::transport::{Connector, TransportError};

pub struct ClientPool {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ClientPool {
    pub fn new(connector: impl Connector, retry: RetryPolicy) -> Self {
        Self {
            connector: Arc::new(connector),
            retry,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for `proxy`, dialing if there is no live one.
    pub async fn get(&self, proxy: &ServiceProxy) -> Result<Arc<Client>, TransportError> {
        self.get_connspec(&proxy.connspec).await
    }

    pub async fn get_connspec(&self, connspec: &str) -> Result<Arc<Client>, TransportError> {
        if let Some(client) = self.cached(connspec) {
            return Ok(client);
        }

        let connection = self
            .retry
            .run_async(|attempt| async move {
                self.connector.connect(connspec).await.map_err(|e| {
                    if e.is_retryable() {
                        tracing::warn!(connspec = %connspec, attempt, error = %e, "Connect failed, retrying");
                        Attempt::Retry(e)
                    } else {
                        Attempt::Fatal(e)
                    }
                })
            })
            .await
            .map_err(RetryError::into_inner)?;

        let client = Client::new(connection);
        tracing::debug!(connspec = %connspec, connection_id = %client.id(), "Dialed service instance");

        // A concurrent caller may have dialed the same connspec meanwhile.
        let mut clients = self.clients.lock();
        if let Some(existing) = clients.get(connspec).filter(|c| !c.is_closed()) {
            let existing = existing.clone();
            drop(clients);
            client.close();
            return Ok(existing);
        }
        clients.insert(connspec.to_string(), client.clone());
        Ok(client)
    }

    fn cached(&self, connspec: &str) -> Option<Arc<Client>> {
        let mut clients = self.clients.lock();
        match clients.get(connspec) {
            Some(client) if !client.is_closed() => Some(client.clone()),
            Some(_) => {
                tracing::debug!(connspec = %connspec, "Dropping closed client");
                clients.remove(connspec);
                None
            }
            None => None,
        }
    }

    /// Register an already-connected client, replacing any previous one.
    pub fn insert(&self, connspec: impl Into<String>, client: Arc<Client>) {
        if let Some(old) = self.clients.lock().insert(connspec.into(), client) {
            old.close();
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every client.
    pub fn close_all(&self) {
        let clients = std::mem::take(&mut *self.clients.lock());
        for client in clients.values() {
            client.close();
        }
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("clients", &self.len())
            .field("retry", &self.retry)
            .finish()
    }
}
