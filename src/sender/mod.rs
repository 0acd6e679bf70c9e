//! Outbound delivery (§4.5): a fixed pool of worker tasks pulls `OUTBOX` message ids off a
//! round-robin dispatch channel and POSTs them to the owning node's `/notify` endpoint with
//! exponential backoff between retries. Structurally this mirrors the teacher's activity queue
//! (fixed workers, round-robin `UnboundedSender`, an `AtomicUsize` stats block), generalized
//! from ActivityPub deliveries to this mesh's `tell`/`hope` messages.

use crate::message::{now_unix, MessageId, NotifyItem};
use crate::registry::Registry;
use crate::storage::Storage;
use rand::Rng;
use reqwest_middleware::ClientWithMiddleware;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};

#[derive(Default)]
pub struct SenderStats {
    pub delivered: AtomicUsize,
    pub retried: AtomicUsize,
    pub abandoned: AtomicUsize,
}

pub struct Sender {
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    http: ClientWithMiddleware,
    token: Option<String>,
    subpath: String,
    base_backoff: Duration,
    max_backoff: Duration,
    max_retry_count: u32,
    stats: Arc<SenderStats>,
    workers: Vec<UnboundedSender<MessageId>>,
    next_worker: AtomicUsize,
}

/// Exponential backoff with jitter, capped at `max`: `base * 2^retry_count`, then +/- 20% jitter.
fn backoff_for(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << retry_count.min(20));
    let capped = exp.min(max.as_millis());
    let jitter_frac = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis(((capped as f64) * jitter_frac) as u64)
}

impl Sender {
    pub fn new(
        registry: Arc<Registry>,
        storage: Arc<dyn Storage>,
        http: ClientWithMiddleware,
        token: Option<String>,
        subpath: String,
        worker_count: usize,
        base_backoff: Duration,
        max_backoff: Duration,
        max_retry_count: u32,
    ) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel::<MessageId>();
            workers.push(tx);
            receivers.push(rx);
        }

        Arc::new_cyclic(|weak: &Weak<Sender>| {
            for (worker_id, mut rx) in receivers.into_iter().enumerate() {
                let weak = weak.clone();
                tokio::spawn(async move {
                    while let Some(id) = rx.recv().await {
                        let Some(this) = weak.upgrade() else { break };
                        this.deliver_one(id).await;
                    }
                    debug!(worker_id, "sender worker exiting");
                });
            }
            Sender {
                registry,
                storage,
                http,
                token,
                subpath,
                base_backoff,
                max_backoff,
                max_retry_count,
                stats: Arc::new(SenderStats::default()),
                workers,
                next_worker: AtomicUsize::new(0),
            }
        })
    }

    fn dispatch(&self, id: MessageId) {
        if self.workers.is_empty() {
            return;
        }
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let _ = self.workers[idx].send(id);
    }

    /// One outbox scan (§4.5 step 1): finds snapshots whose backoff has elapsed and dispatches
    /// them to a worker.
    pub async fn scan_once(&self) {
        let now = now_unix();
        for snap in self.storage.outbox_iter().await {
            if snap.retry_count > self.max_retry_count {
                continue; // left for the monitor to mark RetryExhausted
            }
            let due = match snap.last_send_at {
                None => true,
                Some(last) => {
                    let backoff = backoff_for(self.base_backoff, self.max_backoff, snap.retry_count);
                    now - last >= backoff.as_secs() as i64
                }
            };
            if due {
                self.dispatch(snap.id);
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = interval.tick() => self.scan_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn deliver_one(&self, id: MessageId) {
        let Some(message) = self.storage.get(id).await else {
            return;
        };
        let Some(node_name) = message.dst_node.clone() else {
            warn!(%id, "outbox message has no resolved destination node");
            return;
        };
        let snapshot = self.registry.snapshot();
        let Some(node) = snapshot.node(&node_name) else {
            warn!(%id, node = %node_name, "outbox message targets an unknown node");
            return;
        };
        let Some(base) = snapshot.choose_url(node) else {
            warn!(%id, node = %node_name, "no reachable network for destination node");
            return;
        };
        let url = format!("{}{}/notify", base.as_str().trim_end_matches('/'), self.subpath);

        let body = vec![NotifyItem::Deliver(message.clone())];
        let mut req = self.http.post(&url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                // A 2xx here only means the peer durably admitted the message (§4.6 `/notify`).
                // `require_ack` messages stay OUTBOX awaiting a genuine inbound ACK from the
                // peer; only a best-effort `hope` is marked done on this response alone.
                let result = if message.require_ack {
                    self.storage.send(id).await
                } else {
                    self.storage.done(id, None).await
                };
                if let Err(e) = result {
                    warn!(error = %e, %id, "failed to persist delivery outcome");
                }
            }
            Ok(resp) => {
                warn!(%id, status = %resp.status(), "peer rejected delivery");
                self.retry_or_abandon(id, message.require_ack).await;
            }
            Err(e) => {
                warn!(error = %e, %id, "delivery attempt failed");
                self.retry_or_abandon(id, message.require_ack).await;
            }
        }
    }

    async fn retry_or_abandon(&self, id: MessageId, require_ack: bool) {
        if require_ack {
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            self.storage.bump_retry(id).await;
            if let Err(e) = self.storage.send(id).await {
                warn!(error = %e, %id, "failed to re-mark OUTBOX after failed delivery");
            }
        } else {
            // Best-effort `hope`: one attempt, then done regardless of outcome.
            self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.storage.done(id, None).await {
                warn!(error = %e, %id, "failed to persist best-effort delivery outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        let small = backoff_for(base, max, 0);
        let large = backoff_for(base, max, 10);
        assert!(small <= max);
        assert!(large <= max + Duration::from_millis(1)); // jitter may round up by <1ms
    }
}
