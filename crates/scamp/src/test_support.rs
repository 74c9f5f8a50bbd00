//! Builders for discovery feeds used across unit tests.

use std::io::Write;

use serde_json::{json, Value};
use tempfile::NamedTempFile;

use crate::message::Message;
use crate::registry::feed::FeedRecord;
use crate::registry::proxy::ServiceProxy;
use crate::transport::{ConnectFuture, Connection, Connector, TransportError};

/// Certificate whose DER body is the bytes `abc`.
pub const ABC_CERT: &str = "-----BEGIN CERTIFICATE-----\nYWJj\n-----END CERTIFICATE-----";
pub const ABC_FINGERPRINT: &str = "A9:99:3E:36:47:06:81:6A:BA:3E:25:71:78:50:C2:6C:9C:D0:D8:9D";

pub fn class_record(ident: &str, sector: &str, connspec: &str, protocols: &[&str], classes: Value) -> Value {
    json!([3, ident, sector, 1, 5000, connspec, protocols, classes, 1700000000.0])
}

/// One `%%%`-delimited feed entry signed with the `abc` certificate.
pub fn feed_entry(record: &Value) -> String {
    format!("%%%\n{record}\n\n{ABC_CERT}\n\nc2lnbmF0dXJl\n\n")
}

pub fn feed(records: &[Value]) -> String {
    records.iter().map(feed_entry).collect()
}

pub fn write_feed(records: &[Value]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(feed(records).as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

pub fn rewrite_feed(file: &NamedTempFile, contents: &str) {
    std::fs::write(file.path(), contents).unwrap();
}

pub fn proxy(record: Value) -> ServiceProxy {
    ServiceProxy::from_feed_record(FeedRecord {
        class_records: record.to_string(),
        certificate: ABC_CERT.to_string(),
        signature: "c2lnbmF0dXJl".to_string(),
    })
    .unwrap()
}

/// `accounts` instance exposing `User.get~1` over `json`.
pub fn accounts_record(ident: &str, connspec: &str) -> Value {
    class_record(ident, "accounts", connspec, &["json"], json!([["User", ["get", 1]]]))
}

/// Connector driven by a closure, for scripting dial outcomes.
pub struct FnConnector<F>(pub F);

impl<F> Connector for FnConnector<F>
where
    F: Fn(&str) -> Result<Connection, TransportError> + Send + Sync + 'static,
{
    fn connect<'a>(&'a self, connspec: &'a str) -> ConnectFuture<'a> {
        let result = (self.0)(connspec);
        Box::pin(async move { result })
    }
}

pub fn fn_connector<F>(f: F) -> FnConnector<F>
where
    F: Fn(&str) -> Result<Connection, TransportError> + Send + Sync + 'static,
{
    FnConnector(f)
}

/// Spawn a peer that answers every request with its own body.
pub fn echo_peer(mut peer: Connection) {
    tokio::spawn(async move {
        while let Some(message) = peer.recv().await {
            if message.is_request() {
                let reply = Message::reply_to(&message, message.body.clone());
                if peer.send(reply).await.is_err() {
                    break;
                }
            }
        }
    });
}

pub fn echo_connection() -> Connection {
    let (connection, peer) = Connection::pair(16);
    echo_peer(peer);
    connection
}
