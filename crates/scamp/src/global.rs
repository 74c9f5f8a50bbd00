//! Process-wide default dispatcher for callers that don't thread one
//! through. The library itself never reads it.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::dispatch::{DispatchError, Dispatcher};
use crate::message::Message;

static DEFAULT: RwLock<Option<Arc<Dispatcher>>> = parking_lot::const_rwlock(None);

/// Install `dispatcher` as the default, returning the one it replaces.
pub fn init(dispatcher: Arc<Dispatcher>) -> Option<Arc<Dispatcher>> {
    DEFAULT.write().replace(dispatcher)
}

/// Remove the default and close its clients.
pub fn shutdown() {
    if let Some(dispatcher) = DEFAULT.write().take() {
        dispatcher.pool().close_all();
        tracing::debug!("Default dispatcher shut down");
    }
}

pub fn dispatcher() -> Result<Arc<Dispatcher>, DispatchError> {
    DEFAULT.read().clone().ok_or(DispatchError::NotInitialized)
}

/// [`Dispatcher::request`] on the default dispatcher.
pub async fn make_json_request(
    sector: &str,
    action: &str,
    version: u32,
    message: Message,
) -> Result<Message, DispatchError> {
    dispatcher()?.request(sector, action, version, message).await
}
