//! Crate-wide error taxonomy.
//!
//! Recoverable errors ([`Error::Transport`], [`Error::AckTimeout`]) stay inside the component
//! that produced them and feed a retry loop. Terminal errors are durably written to storage
//! before they are ever surfaced to a caller (see `docs` on [`crate::executor`]).

use crate::message::MessageId;
use thiserror::Error;

/// The single error type returned by public crate APIs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("message {id} rejected by schema for actor {actor}: {message}")]
    Schema {
        id: MessageId,
        actor: String,
        message: String,
    },

    #[error("handler for actor {actor} failed on message {id}: {message}")]
    Handler {
        id: MessageId,
        actor: String,
        message: String,
    },

    #[error("no owner registered for module {module}")]
    Routing { module: String },

    #[error("storage is at capacity ({pending}/{cap} pending messages)")]
    StorageFull { pending: usize, cap: usize },

    #[error("unknown message id {0}")]
    UnknownId(MessageId),

    #[error("transport error delivering {id} to {inbox}: {message}")]
    Transport {
        id: MessageId,
        inbox: String,
        message: String,
    },

    #[error("ack timeout waiting for {0}")]
    AckTimeout(MessageId),

    #[error("retry budget exhausted for {0}")]
    RetryExhausted(MessageId),

    #[error("ask {0} timed out waiting for a reply")]
    Timeout(MessageId),

    #[error("write-ahead log is corrupt: {0}")]
    CorruptLog(String),

    #[error("registry update would create duplicate owners for module {module}")]
    DuplicateModuleOwner { module: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Adapts an arbitrary error into [`Error::Other`], mirroring the teacher crate's
    /// `Error::other` escape hatch for `reqwest`/io failures that don't fit the taxonomy.
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        Error::Other(err.into())
    }

    /// Stable machine-readable kind, used to build the `{kind, message, actor, id}` envelope
    /// that crosses the wire in `/ask` error responses (stacks are never serialized, per design).
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Schema { .. } => "schema_error",
            Error::Handler { .. } => "handler_error",
            Error::Routing { .. } => "routing_error",
            Error::StorageFull { .. } => "storage_full",
            Error::UnknownId(_) => "unknown_id",
            Error::Transport { .. } => "transport_error",
            Error::AckTimeout(_) => "ack_timeout",
            Error::RetryExhausted(_) => "retry_exhausted",
            Error::Timeout(_) => "timeout",
            Error::CorruptLog(_) => "corrupt_log",
            Error::DuplicateModuleOwner { .. } => "duplicate_module_owner",
            Error::Other(_) => "internal_error",
        }
    }

    /// `true` for errors that should feed a retry loop instead of terminating the message.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::AckTimeout(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
