//! The wire/durable message model (§3 of the design spec).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Time-sortable unique message id, backed by a ULID.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Ulid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(MessageId)
    }
}

/// A message in flight between actors, exactly as the wire/storage envelope describes it (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub src: String,
    pub dst: String,
    pub dst_node: Option<String>,
    /// The node that originally admitted this message (set on submit). Lets the node that
    /// finally handles a `require_ack` message sent over `/notify` address its ack back to
    /// whichever node sent it, without a dedicated correlation table.
    #[serde(default)]
    pub src_node: Option<String>,
    pub content: serde_json::Value,
    #[serde(default)]
    pub is_ask: bool,
    #[serde(default)]
    pub require_ack: bool,
    pub parent_id: Option<MessageId>,
    pub expire_at: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
    /// Assigned by storage on `begin`; not part of the wire envelope until then.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence: Option<u64>,
}

impl Message {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, content: serde_json::Value) -> Self {
        Message {
            id: MessageId::new(),
            src: src.into(),
            dst: dst.into(),
            dst_node: None,
            src_node: None,
            content,
            is_ask: false,
            require_ack: false,
            parent_id: None,
            expire_at: None,
            retry_count: 0,
            sequence: None,
        }
    }

    /// The module portion of `dst`, used for registry routing (everything before the first '.').
    pub fn dst_module(&self) -> &str {
        self.dst.split('.').next().unwrap_or(&self.dst)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expire_at, Some(at) if at < now)
    }
}

/// Durable status of a stored message (§4.2 state machine).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Outbox,
    Inbox,
    Executing,
    Done,
    Error,
    Expired,
    /// Terminal state for an outbox message once the peer has acked it.
    Acked,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Done | Status::Error | Status::Expired | Status::Acked
        )
    }
}

/// Per-message bookkeeping kept alongside the message body in storage's in-memory index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageState {
    pub status: Status,
    pub retry_count: u32,
    pub last_send_at: Option<i64>,
    pub ack_at: Option<i64>,
    pub created_at: i64,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
}

impl MessageState {
    pub fn new(status: Status, now: i64) -> Self {
        MessageState {
            status,
            retry_count: 0,
            last_send_at: None,
            ack_at: None,
            created_at: now,
            result: None,
            error: None,
        }
    }
}

/// Redacted error surfaced to ask callers and persisted in ERROR records; never carries a stack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub actor: String,
}

/// One entry in a `/notify` request body (§6: "list of envelopes for tell/hope/ack"): either a
/// message being delivered, or an ack for a `require_ack` message this node previously sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyItem {
    Deliver(Message),
    Ack { id: MessageId },
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}
