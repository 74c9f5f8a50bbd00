//! Span builder helpers for SCAMP client instrumentation.

/// Create a span for one load-balanced dispatch.
///
/// Fields recorded later by the dispatcher:
/// - `candidates`: number of proxies that yielded a usable client
/// - `request_id`: correlation id stamped by the chosen client
/// - `latency_ms`: time from send to reply (or timeout)
#[macro_export]
macro_rules! dispatch_request_span {
    ($sector:expr, $action:expr, $version:expr) => {
        tracing::info_span!(
            "dispatch_request",
            sector = %$sector,
            action = %$action,
            version = $version,
            candidates = tracing::field::Empty,
            request_id = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a span covering one registry refresh.
#[macro_export]
macro_rules! registry_refresh_span {
    ($path:expr) => {
        tracing::debug_span!(
            "registry_refresh",
            path = %$path,
            records = tracing::field::Empty,
            rejected = tracing::field::Empty,
        )
    };
}

/// Create a span for a single client send.
#[macro_export]
macro_rules! client_send_span {
    ($connection_id:expr, $message_type:expr) => {
        tracing::trace_span!(
            "client_send",
            connection_id = %$connection_id,
            message_type = ?$message_type,
            request_id = tracing::field::Empty,
        )
    };
}
