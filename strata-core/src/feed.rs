//! Change-feed transport contract.
//!
//! A transport delivers row-level change notifications for a channel into an
//! mpsc sink, interleaved with connection status updates. The realtime sync
//! engine owns the reconnect policy; transports only report what happened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::SubscriptionError;

/// Row operation reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub const ALL: [ChangeOperation; 3] = [
        ChangeOperation::Insert,
        ChangeOperation::Update,
        ChangeOperation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }
}

/// One row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub new: Option<Map<String, Value>>,
    #[serde(default)]
    pub old: Option<Map<String, Value>>,
}

impl ChangeNotification {
    pub fn new(table: impl Into<String>, operation: ChangeOperation) -> Self {
        Self {
            table: table.into(),
            operation,
            new: None,
            old: None,
        }
    }

    pub fn with_new(mut self, row: Map<String, Value>) -> Self {
        self.new = Some(row);
        self
    }

    pub fn with_old(mut self, row: Map<String, Value>) -> Self {
        self.old = Some(row);
        self
    }

    /// The row image: new for inserts and updates, old for deletes.
    pub fn record(&self) -> Option<&Map<String, Value>> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// A field of the row image rendered as an id string.
    ///
    /// Strings are returned as-is, numbers in decimal; anything else
    /// (including empty strings) is treated as absent.
    pub fn field(&self, name: &str) -> Option<String> {
        match self.record()?.get(name)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Connection status reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Error(String),
    Closed,
}

/// What a transport pushes into the subscription sink.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Change(ChangeNotification),
    Status(ChannelStatus),
}

/// External change-feed transport.
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    /// Start delivering changes for `tables` x `operations` on `channel`.
    ///
    /// Returning `Ok` means the request was accepted; the transport then
    /// reports `Status(Subscribed)` or `Status(Error)` through the sink.
    async fn subscribe(
        &self,
        channel: &str,
        tables: &[String],
        operations: &[ChangeOperation],
        sink: mpsc::Sender<TransportMessage>,
    ) -> Result<(), SubscriptionError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), SubscriptionError>;
}
