//! scamp: discovery-driven, load-balanced RPC client for SCAMP service meshes.
//!
//! A [`Registry`] loads the signed discovery cache; a [`Dispatcher`] picks the
//! least-loaded live instance for an action and sends the request over a
//! multiplexed [`Client`].

pub mod cert;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod global;
pub mod message;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod stats;
pub mod ticket;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{Client, ReplyHandle};
pub use config::ScampConfig;
pub use dispatch::{DispatchError, Dispatcher, DEFAULT_TIMEOUT};
pub use message::{Envelope, Message, MessageType};
pub use pool::ClientPool;
pub use registry::proxy::ServiceProxy;
pub use registry::{Registry, RegistryError};
pub use retry::{Attempt, RetryError, RetryPolicy};
pub use transport::{Connection, Connector, TransportError};
