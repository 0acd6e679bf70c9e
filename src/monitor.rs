//! Message monitor (§4.7): a periodic sweep that expires past-deadline messages and nudges
//! `OUTBOX` entries that have gone quiet past their ack timeout — either back into the sender's
//! eligible set, or to a terminal `RetryExhausted` error once the retry budget is spent.

use crate::message::{now_unix, ErrorInfo};
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Monitor {
    storage: Arc<dyn Storage>,
    ack_timeout: Duration,
    max_retry_count: u32,
}

impl Monitor {
    pub fn new(storage: Arc<dyn Storage>, ack_timeout: Duration, max_retry_count: u32) -> Self {
        Monitor {
            storage,
            ack_timeout,
            max_retry_count,
        }
    }

    pub async fn sweep_once(&self) {
        let now = now_unix();

        for id in self.storage.find_expired(now).await {
            if let Err(e) = self.storage.expire(id).await {
                warn!(error = %e, %id, "failed to persist EXPIRE record");
            }
        }

        for snap in self.storage.outbox_iter().await {
            let Some(last_send_at) = snap.last_send_at else {
                continue;
            };
            if now - last_send_at < self.ack_timeout.as_secs() as i64 {
                continue;
            }
            if snap.retry_count >= self.max_retry_count {
                let actor = self
                    .storage
                    .get(snap.id)
                    .await
                    .map(|m| m.dst)
                    .unwrap_or_default();
                let info = ErrorInfo {
                    kind: "retry_exhausted".to_string(),
                    message: format!("no ack after {} retries", snap.retry_count),
                    actor,
                };
                info!(id = %snap.id, "retry budget exhausted, marking terminal error");
                if let Err(e) = self.storage.error(snap.id, info).await {
                    warn!(error = %e, id = %snap.id, "failed to persist ERROR record");
                }
            } else {
                self.storage.bump_retry(snap.id).await;
                if let Err(e) = self.storage.send(snap.id).await {
                    warn!(error = %e, id = %snap.id, "failed to re-mark stale OUTBOX entry");
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn expires_messages_past_their_deadline() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(100));
        let mut msg = Message::new("a", "b.c", serde_json::json!({}));
        msg.expire_at = Some(now_unix() - 10);
        let id = msg.id;
        storage.begin(msg).await.unwrap();

        let monitor = Monitor::new(storage.clone(), Duration::from_secs(30), 3);
        monitor.sweep_once().await;

        let stats = storage.stats().await;
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.done, 1);
    }

    #[tokio::test]
    async fn marks_retry_exhausted_once_budget_spent() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(100));
        let msg = Message::new("a", "b.c", serde_json::json!({}));
        let id = msg.id;
        storage.begin(msg).await.unwrap();
        storage.send(id).await.unwrap();
        for _ in 0..5 {
            storage.bump_retry(id).await;
        }

        let monitor = Monitor::new(storage.clone(), Duration::from_secs(0), 3);
        monitor.sweep_once().await;

        let stats = storage.stats().await;
        assert_eq!(stats.outbox, 0);
        assert_eq!(stats.done, 1); // terminal (ERROR counts as done_size in our stats)
    }
}
