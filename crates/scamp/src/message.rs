//! The slice of the SCAMP message model the client core depends on.
//!
//! Framing and encoding belong to the transport; the core only reads the
//! type tag, correlation id and envelope, and stamps action/version.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Whether a message opens an exchange or answers one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Reply,
    /// Anything the transport decoded but could not classify.
    #[serde(other)]
    Unknown,
}

/// Payload encoding kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
    Json,
    JsonStore,
    ExtDirect,
}

impl Envelope {
    /// Protocol tag used in action-index keys, for the envelopes the
    /// dispatcher can route. `None` for envelopes it rejects.
    pub fn dispatch_tag(self) -> Option<&'static str> {
        match self {
            Envelope::Json => Some("json"),
            Envelope::JsonStore => Some("jsonstore"),
            Envelope::ExtDirect => None,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Envelope::Json => "json",
            Envelope::JsonStore => "jsonstore",
            Envelope::ExtDirect => "extdirect",
        };
        f.write_str(name)
    }
}

/// A decoded SCAMP message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    /// Correlation id. Assigned by [`Client::send`](crate::client::Client::send)
    /// for requests and echoed by the peer in its reply.
    pub request_id: u64,
    pub envelope: Envelope,
    pub action: String,
    pub version: u32,
    pub ticket: Option<String>,
    pub client_id: Option<u64>,
    /// Error text carried by a failed reply.
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub body: Bytes,
}

impl Message {
    pub fn request(envelope: Envelope, body: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Request, envelope, body)
    }

    /// Build the reply to `request`, carrying over its correlation id.
    pub fn reply_to(request: &Message, body: impl Into<Bytes>) -> Self {
        let mut reply = Self::new(MessageType::Reply, request.envelope, body);
        reply.request_id = request.request_id;
        reply.action = request.action.clone();
        reply.version = request.version;
        reply
    }

    fn new(message_type: MessageType, envelope: Envelope, body: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            request_id: 0,
            envelope,
            action: String::new(),
            version: 1,
            ticket: None,
            client_id: None,
            error: None,
            error_code: None,
            body: body.into(),
        }
    }

    pub fn set_action(&mut self, action: impl Into<String>) {
        self.action = action.into();
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Request
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.error_code.is_some()
    }
}
