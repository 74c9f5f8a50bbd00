//! Load-balanced request dispatch.
//!
//! For each request: refresh the registry, find every instance serving the
//! action, get a client for each, try them least-loaded first, then wait
//! for the reply under a deadline.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::Instrument;

use crate::client::Client;
use crate::message::{Envelope, Message};
use crate::pool::ClientPool;
use crate::registry::{Registry, RegistryError};
use crate::stats::{DispatchStats, StatsSnapshot};
use crate::transport::TransportError;

/// How long to wait for a reply once a request is on the wire.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported envelope type `{0}`")]
    UnsupportedEnvelope(Envelope),

    #[error("registry refresh failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("registry refresh task failed: {0}")]
    RefreshTask(#[from] tokio::task::JoinError),

    #[error("could not find {key}")]
    NotFound { key: String },

    #[error("no reachable instance for {key}")]
    NoReachableInstances { key: String },

    #[error("request to {key} failed on all {attempts} instances: {source}")]
    SendFailed {
        key: String,
        attempts: usize,
        #[source]
        source: TransportError,
    },

    #[error("connection closed before reply to request {request_id}")]
    ConnectionClosed { request_id: u64 },

    #[error("request {request_id} timed out after {timeout:?}")]
    Timeout { request_id: u64, timeout: Duration },

    #[error("no default dispatcher has been initialized")]
    NotInitialized,
}

/// Routes requests to discovered service instances.
pub struct Dispatcher {
    registry: Arc<Registry>,
    pool: ClientPool,
    timeout: Duration,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, pool: ClientPool, timeout: Duration) -> Self {
        Self {
            registry,
            pool,
            timeout,
            stats: DispatchStats::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Send `message` to an instance serving `sector:action~version` and
    /// wait for its reply.
    ///
    /// `action` is matched against class-qualified names (`User.get`).
    pub async fn request(
        &self,
        sector: &str,
        action: &str,
        version: u32,
        message: Message,
    ) -> Result<Message, DispatchError> {
        let span = scamp_tracing::dispatch_request_span!(sector, action, version);
        self.dispatch(sector, action, version, message)
            .instrument(span)
            .await
    }

    async fn dispatch(
        &self,
        sector: &str,
        action: &str,
        version: u32,
        mut message: Message,
    ) -> Result<Message, DispatchError> {
        let envelope = message
            .envelope
            .dispatch_tag()
            .ok_or(DispatchError::UnsupportedEnvelope(message.envelope))?;
        self.stats.inc_requests();

        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || registry.refresh()).await??;

        let proxies = self
            .registry
            .search_by_action(sector, action, version, envelope)
            .map_err(|e| match e {
                RegistryError::NoInstances(key) => DispatchError::NotFound { key },
                other => DispatchError::Registry(other),
            })?;
        let key = crate::registry::lookup_key(sector, action, version, envelope);

        message.set_action(action);
        message.set_version(version);

        let mut clients = Vec::with_capacity(proxies.len());
        for proxy in &proxies {
            match self.pool.get(proxy).await {
                Ok(client) => clients.push(client),
                Err(e) => {
                    tracing::warn!(
                        ident = %proxy.ident,
                        connspec = %proxy.connspec,
                        error = %e,
                        "Skipping unreachable instance"
                    );
                }
            }
        }
        let span = tracing::Span::current();
        span.record("candidates", clients.len());
        if clients.is_empty() {
            return Err(DispatchError::NoReachableInstances { key });
        }

        order_by_load(&mut clients);

        let mut last_error = None;
        let mut attempts = 0;
        let mut sent = None;
        for client in &clients {
            attempts += 1;
            match client.request(message.clone()).await {
                Ok(handle) => {
                    sent = Some((client, handle));
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = %client.id(), error = %e, "Send failed, trying next instance");
                    last_error = Some(e);
                }
            }
        }
        let failures = if sent.is_some() { attempts - 1 } else { attempts };
        self.stats.add_send_failures(failures as u64);

        let Some((client, handle)) = sent else {
            return Err(DispatchError::SendFailed {
                key,
                attempts,
                source: last_error.unwrap_or(TransportError::Closed),
            });
        };

        let request_id = handle.request_id();
        span.record("request_id", request_id);
        let started = tokio::time::Instant::now();

        let outcome = tokio::time::timeout(self.timeout, handle).await;
        span.record("latency_ms", started.elapsed().as_millis() as u64);

        match outcome {
            Ok(Ok(reply)) => {
                self.stats.inc_replies();
                tracing::debug!(request_id, "Reply received");
                Ok(reply)
            }
            Ok(Err(_)) => {
                self.stats.inc_connection_closed();
                tracing::warn!(request_id, connection_id = %client.id(), "Connection closed while waiting for reply");
                Err(DispatchError::ConnectionClosed { request_id })
            }
            Err(_) => {
                self.stats.inc_timeouts();
                client.cancel(request_id);
                tracing::warn!(request_id, timeout = ?self.timeout, "Request timed out");
                Err(DispatchError::Timeout {
                    request_id,
                    timeout: self.timeout,
                })
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Shuffle so ties are broken randomly, then stable-sort by outstanding
/// requests, fewest first.
///
/// Each load is read once before sorting; concurrent sends may change it
/// mid-sort.
fn order_by_load(clients: &mut [Arc<Client>]) {
    clients.shuffle(&mut rand::thread_rng());
    clients.sort_by_cached_key(|c| c.outstanding());
}
