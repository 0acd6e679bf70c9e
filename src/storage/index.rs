//! The in-memory index every backend maintains from durable records (§4.2 state machine).
//!
//! `EXECUTING` is explicitly a *non-durable* reservation (§4.2: "take_pending ... marking them
//! EXECUTING (non-durable reservation)"), so it never appears in a loaded record stream —
//! recovery naturally reclaims an in-flight message back to `INBOX` simply by never having
//! observed an EXECUTING record to begin with.

use crate::error::{Error, Result};
use crate::message::{Message, MessageId, MessageState, Status};
use crate::storage::record::Record;
use std::collections::{HashMap, VecDeque};

pub(crate) struct Entry {
    pub message: Message,
    pub state: MessageState,
}

#[derive(Default)]
pub(crate) struct Index {
    entries: HashMap<MessageId, Entry>,
    pending_queue: VecDeque<MessageId>,
    outbox: Vec<MessageId>,
}

#[derive(Clone, Debug)]
pub struct OutboxSnapshot {
    pub id: MessageId,
    pub retry_count: u32,
    pub last_send_at: Option<i64>,
}

impl Index {
    pub fn pending_size(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.state.status, Status::Inbox | Status::Executing))
            .count()
    }

    pub fn done_size(&self) -> usize {
        self.entries.values().filter(|e| e.state.status.is_terminal()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: MessageId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().filter(|e| !e.state.status.is_terminal())
    }

    /// Applies one durable record to the index, performing the state transition described in
    /// §4.2. Idempotent for duplicate `ACK`s (O3) and safe to call during both normal
    /// operation and log replay.
    pub fn apply(&mut self, record: Record, now: i64) -> Result<()> {
        match record {
            Record::Begin(msg) => {
                let id = msg.id;
                self.entries.entry(id).or_insert_with(|| Entry {
                    message: msg,
                    state: MessageState::new(Status::Inbox, now),
                });
                if !self.pending_queue.contains(&id) {
                    self.pending_queue.push_back(id);
                }
            }
            Record::Send(id) => {
                let entry = self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?;
                entry.state.status = Status::Outbox;
                entry.state.last_send_at = Some(now);
                self.pending_queue.retain(|x| *x != id);
                if !self.outbox.contains(&id) {
                    self.outbox.push(id);
                }
            }
            Record::Ack(id) => {
                // Idempotent: a duplicate ACK for an already-terminal id is a no-op (O3).
                if let Some(entry) = self.entries.get_mut(&id) {
                    if entry.state.status == Status::Outbox {
                        entry.state.status = Status::Acked;
                        entry.state.ack_at = Some(now);
                    }
                    self.outbox.retain(|x| *x != id);
                } else {
                    return Err(Error::UnknownId(id));
                }
            }
            Record::Done(id, result) => {
                let entry = self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?;
                entry.state.status = Status::Done;
                entry.state.result = result;
                self.pending_queue.retain(|x| *x != id);
            }
            Record::Error(id, info) => {
                let entry = self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?;
                entry.state.status = Status::Error;
                entry.state.error = Some(info);
                self.pending_queue.retain(|x| *x != id);
                self.outbox.retain(|x| *x != id);
            }
            Record::Expire(id) => {
                let entry = self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?;
                entry.state.status = Status::Expired;
                self.pending_queue.retain(|x| *x != id);
                self.outbox.retain(|x| *x != id);
            }
        }
        Ok(())
    }

    /// Indexes a message as already-reserved (`EXECUTING`) without ever placing it on
    /// `pending_queue` (§4.4 `handle_ask`: a synchronous ask is invoked directly, never queued
    /// for the periodic dispatch loop, so it must not be available for `take_pending` to also
    /// hand out).
    pub fn apply_begin_reserved(&mut self, message: Message, now: i64) {
        let id = message.id;
        self.entries.entry(id).or_insert_with(|| Entry {
            message,
            state: MessageState::new(Status::Executing, now),
        });
    }

    /// FIFO `take_pending` (§4.2): reserves up to `n` INBOX messages as EXECUTING without a
    /// durable write.
    pub fn take_pending(&mut self, n: usize) -> Vec<Message> {
        let mut taken = Vec::with_capacity(n);
        let mut remaining = VecDeque::new();
        while let Some(id) = self.pending_queue.pop_front() {
            if taken.len() >= n {
                remaining.push_back(id);
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.state.status == Status::Inbox {
                    entry.state.status = Status::Executing;
                    taken.push(entry.message.clone());
                    continue;
                }
            }
        }
        self.pending_queue = remaining;
        taken
    }

    /// Reclaims an EXECUTING reservation back to INBOX without a durable write, e.g. when a
    /// handler is abandoned past the shutdown grace window (§5) — it will be redispatched,
    /// and on restart it is already back at INBOX in the surviving log.
    pub fn release_executing(&mut self, id: MessageId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.state.status == Status::Executing {
                entry.state.status = Status::Inbox;
                self.pending_queue.push_back(id);
            }
        }
    }

    pub fn outbox_iter(&self) -> Vec<OutboxSnapshot> {
        self.outbox
            .iter()
            .filter_map(|id| {
                self.entries.get(id).map(|e| OutboxSnapshot {
                    id: *id,
                    retry_count: e.state.retry_count,
                    last_send_at: e.state.last_send_at,
                })
            })
            .collect()
    }

    pub fn bump_retry(&mut self, id: MessageId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state.retry_count += 1;
        }
    }

    /// Marks every message whose `expire_at` has passed and that is not already terminal.
    /// Returns the ids that were transitioned, for the caller to persist `EXPIRE` records.
    pub fn find_expired(&self, now: i64) -> Vec<MessageId> {
        self.entries
            .values()
            .filter(|e| !e.state.status.is_terminal() && e.message.is_expired(now))
            .map(|e| e.message.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::now_unix;

    #[test]
    fn begin_then_take_then_done_round_trip() {
        let mut idx = Index::default();
        let msg = Message::new("a", "b.c", serde_json::json!({}));
        let id = msg.id;
        idx.apply(Record::Begin(msg), now_unix()).unwrap();
        assert_eq!(idx.pending_size(), 1);

        let taken = idx.take_pending(10);
        assert_eq!(taken.len(), 1);
        assert_eq!(idx.pending_size(), 1); // EXECUTING still counts as pending

        idx.apply(Record::Done(id, Some(serde_json::json!({"ok": true}))), now_unix())
            .unwrap();
        assert_eq!(idx.pending_size(), 0);
        assert_eq!(idx.done_size(), 1);
    }

    #[test]
    fn duplicate_ack_is_a_no_op() {
        let mut idx = Index::default();
        let msg = Message::new("a", "b.c", serde_json::json!({}));
        let id = msg.id;
        idx.apply(Record::Begin(msg), now_unix()).unwrap();
        idx.apply(Record::Send(id), now_unix()).unwrap();
        idx.apply(Record::Ack(id), now_unix()).unwrap();
        assert_eq!(idx.get(id).unwrap().state.status, Status::Acked);
        // replaying the ack must not panic or change state
        idx.apply(Record::Ack(id), now_unix()).unwrap();
        assert_eq!(idx.get(id).unwrap().state.status, Status::Acked);
    }

    #[test]
    fn unknown_id_operations_error() {
        let mut idx = Index::default();
        let id = MessageId::new();
        assert!(idx.apply(Record::Send(id), now_unix()).is_err());
        assert!(idx.apply(Record::Ack(id), now_unix()).is_err());
        assert!(idx.apply(Record::Done(id, None), now_unix()).is_err());
    }

    #[test]
    fn release_executing_reclaims_without_durable_record() {
        let mut idx = Index::default();
        let msg = Message::new("a", "b.c", serde_json::json!({}));
        let id = msg.id;
        idx.apply(Record::Begin(msg), now_unix()).unwrap();
        idx.take_pending(1);
        assert_eq!(idx.get(id).unwrap().state.status, Status::Executing);
        idx.release_executing(id);
        assert_eq!(idx.get(id).unwrap().state.status, Status::Inbox);
        assert_eq!(idx.take_pending(1).len(), 1);
    }
}
