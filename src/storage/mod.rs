//! Durable storage (§4.2): a write-ahead log of [`record::Record`]s plus the in-memory
//! [`index::Index`] rebuilt from it, behind two interchangeable backends.

mod checksum_index;
mod index;
pub mod local;
pub mod memory;
pub mod record;

pub use checksum_index::ChecksumIndex;
pub use index::OutboxSnapshot;
pub use local::LocalStorage;
pub use memory::MemoryStorage;

use crate::error::{Error, Result};
use crate::message::{ErrorInfo, Message, MessageId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Point-in-time counters exposed for monitoring and backpressure decisions (§4.2, §6 `/health`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub pending: usize,
    pub done: usize,
    pub outbox: usize,
    pub total: usize,
}

/// The durable operations every backend must support (§4.2). All methods are `&self`;
/// backends serialize writers internally (I1).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Loads the durable log (if any) into the in-memory index. Called once at startup.
    async fn load(&self) -> Result<()>;

    /// Admits a new message, writing a `BEGIN` record and indexing it as `INBOX`. Rejects the
    /// write with [`Error::StorageFull`] once `pending >= max_pending` (§4.2 backpressure, I4).
    async fn begin(&self, message: Message) -> Result<()>;

    /// Admits a message for a synchronous ask (§4.4 `handle_ask`): writes the same `BEGIN`
    /// record as [`Storage::begin`], but indexes it directly as `EXECUTING` so the periodic
    /// dispatch loop never also hands it to a worker pool.
    async fn begin_reserved(&self, message: Message) -> Result<()>;

    /// Marks `id` as `OUTBOX`, writing a `SEND` record (§4.2).
    async fn send(&self, id: MessageId) -> Result<()>;

    /// Marks `id` as `ACKED`, writing an `ACK` record. Idempotent (O3).
    async fn ack(&self, id: MessageId) -> Result<()>;

    /// Marks `id` terminal with a successful result, writing a `DONE` record.
    async fn done(&self, id: MessageId, result: Option<serde_json::Value>) -> Result<()>;

    /// Marks `id` terminal with a failure, writing an `ERROR` record.
    async fn error(&self, id: MessageId, info: ErrorInfo) -> Result<()>;

    /// Marks `id` terminal as expired, writing an `EXPIRE` record.
    async fn expire(&self, id: MessageId) -> Result<()>;

    /// Reserves up to `n` `INBOX` messages as `EXECUTING` (non-durable, §4.2) and returns them
    /// in FIFO order for the executor to dispatch.
    async fn take_pending(&self, n: usize) -> Vec<Message>;

    /// Releases an `EXECUTING` reservation back to `INBOX` without a durable write (executor
    /// shutdown, §5).
    async fn release_executing(&self, id: MessageId);

    /// Snapshot of every message currently in `OUTBOX`, for the sender and monitor to scan.
    async fn outbox_iter(&self) -> Vec<OutboxSnapshot>;

    /// Increments the in-memory retry counter for an outbox entry (does not itself write a
    /// record; the following `SEND` or terminal write carries the updated count along).
    async fn bump_retry(&self, id: MessageId);

    /// Ids whose `expire_at` has passed and that are not already terminal.
    async fn find_expired(&self, now: i64) -> Vec<MessageId>;

    /// Looks up one message's current durable state, if it has ever been admitted.
    async fn get(&self, id: MessageId) -> Option<Message>;

    async fn stats(&self) -> StorageStats;

    /// Triggers an out-of-band compaction pass. A no-op for backends with no log to shrink.
    async fn compact_now(&self) -> Result<()>;
}

pub(crate) fn storage_full_check(pending: usize, max_pending: usize) -> Result<()> {
    if pending >= max_pending {
        return Err(Error::StorageFull {
            pending,
            cap: max_pending,
        });
    }
    Ok(())
}
