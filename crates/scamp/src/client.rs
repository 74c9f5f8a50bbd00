//! Connection multiplexer.
//!
//! A [`Client`] owns one [`Connection`] and lets many callers keep requests
//! in flight on it at once. A single routing task reads the inbound stream
//! and splits it: requests from the peer go to the local handler, replies go
//! to whichever caller registered the matching correlation id.
//!
//! ```text
//!   caller ──send──► register waiter ──► outbound ─────► peer
//!                          ▲
//!   caller ◄──oneshot──────┤ reply (by request_id)
//!                          │
//!   handler ◄──requests────┴─ routing task ◄─ inbound ◄── peer
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::message::{Message, MessageType};
use crate::transport::{Connection, TransportError};

/// Inbound requests buffered for the local handler before the routing task
/// stalls (and with it, reads from the peer).
const INBOUND_REQUEST_BUFFER: usize = 1;

/// State shared between the client handle and its routing task.
struct Shared {
    open_replies: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    closed: AtomicBool,
}

impl Shared {
    /// Drop every waiter; their handles resolve to [`TransportError::Closed`].
    fn abandon_waiters(&self) -> usize {
        let abandoned = std::mem::take(&mut *self.open_replies.lock());
        abandoned.len()
    }
}

/// Multiplexes concurrent requests over one connection.
pub struct Client {
    id: Uuid,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    requests: Mutex<Option<mpsc::Receiver<Message>>>,
    shared: Arc<Shared>,
    next_request_id: AtomicU64,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Bind to an established connection and start routing its inbound
    /// messages. Must be called from within a tokio runtime.
    pub fn new(connection: Connection) -> Arc<Self> {
        let id = Uuid::new_v4();
        let (outbound, inbound) = connection.into_parts();
        let (requests_tx, requests_rx) = mpsc::channel(INBOUND_REQUEST_BUFFER);
        let shared = Arc::new(Shared {
            open_replies: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let span = tracing::debug_span!("client_router", connection_id = %id);
        let router = tokio::spawn(route(shared.clone(), inbound, requests_tx).instrument(span));

        tracing::debug!(connection_id = %id, "Client allocated");

        Arc::new(Self {
            id,
            outbound: Mutex::new(Some(outbound)),
            requests: Mutex::new(Some(requests_rx)),
            shared,
            next_request_id: AtomicU64::new(1),
            router: Mutex::new(Some(router)),
        })
    }

    /// Connection id used in log fields.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Send a message to the peer.
    ///
    /// A request is stamped with a fresh correlation id and its reply waiter
    /// is registered before the write, so a fast reply cannot outrun the
    /// registration. Returns the handle to await. Replies and other
    /// non-request messages register nothing and return `None`.
    ///
    /// On a failed write nothing stays registered.
    pub async fn send(&self, mut message: Message) -> Result<Option<ReplyHandle>, TransportError> {
        let span = scamp_tracing::client_send_span!(self.id, message.message_type);
        async {
            let sender = self.outbound.lock().clone().ok_or(TransportError::Closed)?;

            if !message.is_request() {
                tracing::trace!("Sending non-request message, no reply expected");
                return sender
                    .send(message)
                    .await
                    .map(|()| None)
                    .map_err(|_| TransportError::Closed);
            }

            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            message.request_id = request_id;
            tracing::Span::current().record("request_id", request_id);

            let receiver = self.register(request_id)?;
            // The router sets `closed` before it drains the map, so a
            // registration that lands after the drain is caught here.
            if self.is_closed() {
                self.cancel(request_id);
                return Err(TransportError::Closed);
            }

            if sender.send(message).await.is_err() {
                self.cancel(request_id);
                return Err(TransportError::Closed);
            }

            tracing::trace!("Request sent, waiting for reply");
            Ok(Some(ReplyHandle {
                request_id,
                receiver,
                shared: Arc::downgrade(&self.shared),
                settled: false,
            }))
        }
        .instrument(span)
        .await
    }

    /// Send `message` as a request and return the handle for its reply.
    pub async fn request(&self, mut message: Message) -> Result<ReplyHandle, TransportError> {
        message.message_type = MessageType::Request;
        self.send(message).await?.ok_or(TransportError::Closed)
    }

    fn register(&self, request_id: u64) -> Result<oneshot::Receiver<Message>, TransportError> {
        let mut open = self.shared.open_replies.lock();
        if open.contains_key(&request_id) {
            return Err(TransportError::DuplicateRequestId(request_id));
        }
        let (tx, rx) = oneshot::channel();
        open.insert(request_id, tx);
        Ok(rx)
    }

    /// Forget the waiter for `request_id`. A reply arriving later is dropped
    /// as unmatched. Returns whether a registration existed.
    pub fn cancel(&self, request_id: u64) -> bool {
        self.shared.open_replies.lock().remove(&request_id).is_some()
    }

    /// Number of requests sent on this client still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.shared.open_replies.lock().len()
    }

    /// True once the inbound stream has ended or [`close`](Self::close) ran.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Take the stream of requests the peer sends to us. Only the first
    /// call gets it.
    pub fn take_requests(&self) -> Option<mpsc::Receiver<Message>> {
        self.requests.lock().take()
    }

    /// Tear down the connection. Pending waiters resolve to
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.outbound.lock().take();
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        let abandoned = self.shared.abandon_waiters();
        tracing::debug!(connection_id = %self.id, abandoned, "Client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(router) = self.router.get_mut().take() {
            router.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("outstanding", &self.outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Routing loop: runs until the inbound stream ends.
async fn route(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<Message>,
    requests: mpsc::Sender<Message>,
) {
    while let Some(message) = inbound.recv().await {
        match message.message_type {
            MessageType::Request => {
                let request_id = message.request_id;
                // Awaiting here stalls reads from the peer until the local
                // handler catches up.
                if requests.send(message).await.is_err() {
                    tracing::warn!(request_id, "No request handler attached, dropping inbound request");
                }
            }
            MessageType::Reply => {
                let request_id = message.request_id;
                let waiter = shared.open_replies.lock().remove(&request_id);
                match waiter {
                    Some(tx) => {
                        if tx.send(message).is_err() {
                            tracing::debug!(request_id, "Caller stopped waiting before the reply arrived");
                        }
                    }
                    None => {
                        tracing::warn!(request_id, "Got an unexpected reply, no waiter registered. Skipping.");
                    }
                }
            }
            MessageType::Unknown => {
                tracing::error!(
                    request_id = message.request_id,
                    "Could not handle message, it's neither request nor reply. Skipping."
                );
            }
        }
    }

    shared.closed.store(true, Ordering::Release);
    let abandoned = shared.abandon_waiters();
    tracing::debug!(abandoned, "Inbound stream ended");
}

/// Resolves to the reply for one request.
///
/// Dropping the handle before it resolves forgets the registration, so an
/// abandoned request stops counting toward [`Client::outstanding`].
pub struct ReplyHandle {
    request_id: u64,
    receiver: oneshot::Receiver<Message>,
    shared: Weak<Shared>,
    settled: bool,
}

impl ReplyHandle {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl Future for ReplyHandle {
    type Output = Result<Message, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(outcome) => outcome,
            Poll::Pending => return Poll::Pending,
        };
        self.settled = true;
        Poll::Ready(outcome.map_err(|_| TransportError::Closed))
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            if shared.open_replies.lock().remove(&self.request_id).is_some() {
                tracing::debug!(request_id = self.request_id, "Reply handle dropped before the reply arrived");
            }
        }
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("request_id", &self.request_id)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Envelope;
    use std::time::Duration;

    fn request(body: &str) -> Message {
        Message::request(Envelope::Json, body.to_string())
    }

    #[tokio::test]
    async fn test_reverse_order_replies_reach_their_callers() {
        const N: usize = 8;
        let (conn, mut peer) = Connection::pair(N * 2);
        let client = Client::new(conn);

        let mut callers = Vec::new();
        for i in 0..N {
            let client = client.clone();
            callers.push(tokio::spawn(async move {
                let handle = client.send(request(&format!("req-{i}"))).await.unwrap().unwrap();
                let reply = handle.await.unwrap();
                (i, reply)
            }));
        }

        let mut received = Vec::new();
        for _ in 0..N {
            received.push(peer.recv().await.unwrap());
        }
        for req in received.iter().rev() {
            let body = format!("reply-to-{}", String::from_utf8_lossy(&req.body));
            peer.send(Message::reply_to(req, body)).await.unwrap();
        }

        for caller in callers {
            let (i, reply) = caller.await.unwrap();
            assert_eq!(&reply.body[..], format!("reply-to-req-{i}").as_bytes());
        }
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped() {
        let (conn, mut peer) = Connection::pair(8);
        let client = Client::new(conn);

        let handle = client.send(request("a")).await.unwrap().unwrap();
        let sent = peer.recv().await.unwrap();

        let mut stray = Message::reply_to(&sent, "stray");
        stray.request_id = 9_999;
        peer.send(stray).await.unwrap();
        peer.send(Message::reply_to(&sent, "real")).await.unwrap();

        let reply = handle.await.unwrap();
        assert_eq!(&reply.body[..], b"real");
        assert!(!client.is_closed());
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unknown_message_type_does_not_stop_routing() {
        let (conn, mut peer) = Connection::pair(8);
        let client = Client::new(conn);

        let handle = client.send(request("a")).await.unwrap().unwrap();
        let sent = peer.recv().await.unwrap();

        let mut odd = Message::reply_to(&sent, "odd");
        odd.message_type = MessageType::Unknown;
        peer.send(odd).await.unwrap();
        peer.send(Message::reply_to(&sent, "ok")).await.unwrap();

        assert_eq!(&handle.await.unwrap().body[..], b"ok");
    }

    #[tokio::test]
    async fn test_inbound_requests_go_to_handler() {
        let (conn, peer) = Connection::pair(8);
        let client = Client::new(conn);
        let mut requests = client.take_requests().unwrap();
        assert!(client.take_requests().is_none());

        let mut incoming = request("from-peer");
        incoming.request_id = 7;
        peer.send(incoming).await.unwrap();

        let got = requests.recv().await.unwrap();
        assert_eq!(got.request_id, 7);
        assert_eq!(&got.body[..], b"from-peer");
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_sending_reply_registers_no_waiter() {
        let (conn, mut peer) = Connection::pair(8);
        let client = Client::new(conn);

        let mut incoming = request("q");
        incoming.request_id = 3;
        let handle = client.send(Message::reply_to(&incoming, "a")).await.unwrap();
        assert!(handle.is_none());
        assert_eq!(client.outstanding(), 0);
        assert_eq!(peer.recv().await.unwrap().request_id, 3);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_no_registration() {
        let (conn, peer) = Connection::pair(8);
        let client = Client::new(conn);
        drop(peer);

        let err = client.send(request("a")).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_pending_waiter_sees_peer_hangup() {
        let (conn, mut peer) = Connection::pair(8);
        let client = Client::new(conn);

        let handle = client.send(request("a")).await.unwrap().unwrap();
        peer.recv().await.unwrap();
        drop(peer);

        assert!(matches!(handle.await, Err(TransportError::Closed)));
        assert!(client.is_closed());
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cancel_then_late_reply_is_ignored() {
        let (conn, mut peer) = Connection::pair(8);
        let client = Client::new(conn);

        let first = client.send(request("slow")).await.unwrap().unwrap();
        let slow = peer.recv().await.unwrap();
        assert_eq!(client.outstanding(), 1);
        assert!(client.cancel(first.request_id()));
        assert!(!client.cancel(first.request_id()));
        assert_eq!(client.outstanding(), 0);

        let second = client.send(request("fast")).await.unwrap().unwrap();
        let fast = peer.recv().await.unwrap();
        assert_ne!(slow.request_id, fast.request_id);

        peer.send(Message::reply_to(&slow, "late")).await.unwrap();
        peer.send(Message::reply_to(&fast, "on-time")).await.unwrap();
        assert_eq!(&second.await.unwrap().body[..], b"on-time");
    }

    #[tokio::test]
    async fn test_dropped_handle_forgets_registration() {
        let (conn, mut peer) = Connection::pair(8);
        let client = Client::new(conn);

        let kept = client.send(request("kept")).await.unwrap().unwrap();
        let dropped = client.send(request("dropped")).await.unwrap().unwrap();
        let kept_req = peer.recv().await.unwrap();
        let dropped_req = peer.recv().await.unwrap();
        assert_eq!(client.outstanding(), 2);

        drop(dropped);
        assert_eq!(client.outstanding(), 1);

        peer.send(Message::reply_to(&dropped_req, "late")).await.unwrap();
        peer.send(Message::reply_to(&kept_req, "ok")).await.unwrap();
        assert_eq!(&kept.await.unwrap().body[..], b"ok");
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waits_do_not_count_as_load() {
        let (conn, _peer) = Connection::pair(8);
        let client = Client::new(conn);

        for _ in 0..3 {
            let handle = client.send(request("ignored")).await.unwrap().unwrap();
            let waited = tokio::time::timeout(Duration::from_millis(200), handle).await;
            assert!(waited.is_err());
        }
        assert_eq!(client.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_future_sends() {
        let (conn, _peer) = Connection::pair(8);
        let client = Client::new(conn);

        let handle = client.send(request("a")).await.unwrap().unwrap();
        client.close();

        assert!(matches!(handle.await, Err(TransportError::Closed)));
        assert!(client.is_closed());
        assert!(matches!(
            client.send(request("b")).await,
            Err(TransportError::Closed)
        ));
    }
}
