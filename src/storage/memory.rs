//! In-process-only backend (§4.2 "two backends"): no log, survives only as long as the node.

use crate::error::Result;
use crate::message::{now_unix, ErrorInfo, Message, MessageId};
use crate::storage::index::Index;
use crate::storage::record::Record;
use crate::storage::{storage_full_check, OutboxSnapshot, Storage, StorageStats};
use async_trait::async_trait;
use parking_lot::Mutex;

pub struct MemoryStorage {
    max_pending: usize,
    index: Mutex<Index>,
}

impl MemoryStorage {
    pub fn new(max_pending: usize) -> Self {
        MemoryStorage {
            max_pending,
            index: Mutex::new(Index::default()),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn begin(&self, message: Message) -> Result<()> {
        let mut idx = self.index.lock();
        storage_full_check(idx.pending_size(), self.max_pending)?;
        idx.apply(Record::Begin(message), now_unix())
    }

    async fn begin_reserved(&self, message: Message) -> Result<()> {
        let mut idx = self.index.lock();
        storage_full_check(idx.pending_size(), self.max_pending)?;
        idx.apply_begin_reserved(message, now_unix());
        Ok(())
    }

    async fn send(&self, id: MessageId) -> Result<()> {
        self.index.lock().apply(Record::Send(id), now_unix())
    }

    async fn ack(&self, id: MessageId) -> Result<()> {
        self.index.lock().apply(Record::Ack(id), now_unix())
    }

    async fn done(&self, id: MessageId, result: Option<serde_json::Value>) -> Result<()> {
        self.index.lock().apply(Record::Done(id, result), now_unix())
    }

    async fn error(&self, id: MessageId, info: ErrorInfo) -> Result<()> {
        self.index.lock().apply(Record::Error(id, info), now_unix())
    }

    async fn expire(&self, id: MessageId) -> Result<()> {
        self.index.lock().apply(Record::Expire(id), now_unix())
    }

    async fn take_pending(&self, n: usize) -> Vec<Message> {
        self.index.lock().take_pending(n)
    }

    async fn release_executing(&self, id: MessageId) {
        self.index.lock().release_executing(id)
    }

    async fn outbox_iter(&self) -> Vec<OutboxSnapshot> {
        self.index.lock().outbox_iter()
    }

    async fn bump_retry(&self, id: MessageId) {
        self.index.lock().bump_retry(id)
    }

    async fn find_expired(&self, now: i64) -> Vec<MessageId> {
        self.index.lock().find_expired(now)
    }

    async fn get(&self, id: MessageId) -> Option<Message> {
        self.index.lock().get(id).map(|e| e.message.clone())
    }

    async fn stats(&self) -> StorageStats {
        let idx = self.index.lock();
        StorageStats {
            pending: idx.pending_size(),
            done: idx.done_size(),
            outbox: idx.outbox_iter().len(),
            total: idx.len(),
        }
    }

    async fn compact_now(&self) -> Result<()> {
        // No log to shrink; terminal entries are bounded only by process memory. A future
        // improvement could evict ACKED/DONE entries past a retention window.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;

    #[tokio::test]
    async fn begin_rejects_once_at_capacity() {
        let storage = MemoryStorage::new(1);
        storage
            .begin(Message::new("a", "b.c", serde_json::json!({})))
            .await
            .unwrap();
        let err = storage
            .begin(Message::new("a", "b.c", serde_json::json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage_full");
    }

    #[tokio::test]
    async fn full_lifecycle_through_done() {
        let storage = MemoryStorage::new(100);
        let msg = Message::new("a", "b.c", serde_json::json!({"n": 1}));
        let id = msg.id;
        storage.begin(msg).await.unwrap();
        let taken = storage.take_pending(10).await;
        assert_eq!(taken.len(), 1);
        storage.done(id, Some(serde_json::json!({"ok": true}))).await.unwrap();
        let stats = storage.stats().await;
        assert_eq!(stats.done, 1);
        assert_eq!(stats.pending, 0);
        let got = storage.get(id).await.unwrap();
        assert_eq!(got.id, id);
        let _ = Status::Done;
    }
}
