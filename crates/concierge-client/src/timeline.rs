//! Local, ordered view of one conversation.
//!
//! Confirmed messages are keyed by `(created_at, id)`, so rendering order is
//! the store order no matter whether a message arrived through backfill, a
//! realtime event, or the reply to our own append. Merging is idempotent by
//! id.
//!
//! Optimistic sends live in a separate pending buffer keyed by a temporary
//! id until the store hands back the authoritative message. Whichever copy
//! of a sent message lands first (realtime echo, backfill or append reply)
//! takes the place of its placeholder, so it is only ever rendered once.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use concierge_shared::{IdentityId, Message, MessageId};

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SendStatus {
    Sending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub temp_id: Uuid,
    pub sender_id: IdentityId,
    pub content: String,
    pub queued_at: DateTime<Utc>,
    pub status: SendStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TimelineEntry {
    Confirmed(Message),
    Pending(PendingMessage),
}

#[derive(Debug, Default)]
pub struct Timeline {
    confirmed: BTreeMap<(DateTime<Utc>, MessageId), Message>,
    ids: HashSet<MessageId>,
    pending: Vec<PendingMessage>,
    /// Placeholders taken by a copy that arrived ahead of the append reply.
    settled: HashMap<MessageId, Uuid>,
    /// Highest id obtained from a store listing. Realtime events never move
    /// it, so an incremental backfill from here also covers dropped events.
    synced_through: Option<MessageId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a confirmed message. Returns `false` for a duplicate id.
    pub fn merge(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        self.settle_placeholder(&message);
        self.confirmed.insert(message.order_key(), message);
        true
    }

    // Pending sends with the same sender and content are interchangeable, so
    // the oldest one in flight stands for this message.
    fn settle_placeholder(&mut self, message: &Message) {
        let position = self.pending.iter().position(|p| {
            p.status == SendStatus::Sending
                && p.sender_id == message.sender_id
                && p.content == message.content
        });
        if let Some(position) = position {
            let placeholder = self.pending.remove(position);
            self.settled.insert(message.id, placeholder.temp_id);
        }
    }

    /// Merge a store listing obtained with `since` and advance the sync
    /// watermark. Returns the number of new messages.
    ///
    /// A listing that contradicts its own contract (an id at or below
    /// `since`, or rows out of `(created_at, id)` order) means local state
    /// can no longer be patched incrementally.
    pub fn apply_backfill(
        &mut self,
        since: Option<MessageId>,
        batch: Vec<Message>,
    ) -> Result<usize, ChatError> {
        if let Some(since) = since {
            if let Some(bad) = batch.iter().find(|m| m.id <= since) {
                return Err(ChatError::StaleState(format!(
                    "listing since {since} returned message {}",
                    bad.id
                )));
            }
        }
        if let Some(pair) = batch
            .windows(2)
            .find(|pair| pair[0].order_key() >= pair[1].order_key())
        {
            return Err(ChatError::StaleState(format!(
                "listing out of order at messages {} and {}",
                pair[0].id, pair[1].id
            )));
        }

        let highest = batch.iter().map(|m| m.id).max();
        let mut added = 0;
        for message in batch {
            if self.merge(message) {
                added += 1;
            }
        }
        if highest > self.synced_through {
            self.synced_through = highest;
        }
        Ok(added)
    }

    /// Replace the confirmed set with a full listing. Messages newer than
    /// the listing (delivered live while it was in flight) are kept.
    pub fn replace_all(&mut self, batch: Vec<Message>) {
        let highest = batch.iter().map(|m| m.id).max();
        let newer: Vec<Message> = self
            .confirmed
            .values()
            .filter(|m| Some(m.id) > highest)
            .cloned()
            .collect();

        self.confirmed.clear();
        self.ids.clear();
        for message in batch.into_iter().chain(newer) {
            self.merge(message);
        }
        self.synced_through = highest;
    }

    pub fn synced_through(&self) -> Option<MessageId> {
        self.synced_through
    }

    pub fn highest_id(&self) -> Option<MessageId> {
        self.ids.iter().max().copied()
    }

    pub fn push_pending(&mut self, sender: IdentityId, content: String) -> Uuid {
        let temp_id = Uuid::new_v4();
        self.pending.push(PendingMessage {
            temp_id,
            sender_id: sender,
            content,
            queued_at: Utc::now(),
            status: SendStatus::Sending,
        });
        temp_id
    }

    /// The store accepted a pending message: drop the placeholder and merge
    /// the authoritative copy, unless an earlier copy already did both.
    pub fn confirm(&mut self, temp_id: Uuid, message: Message) {
        match self.settled.remove(&message.id) {
            Some(taken) if taken == temp_id => {}
            Some(taken) => {
                // The echo took an identical placeholder that is still in
                // flight; ours now stands for that send.
                if let Some(p) = self.pending.iter_mut().find(|p| p.temp_id == temp_id) {
                    p.temp_id = taken;
                }
            }
            None => {
                self.settled.retain(|_, taken| *taken != temp_id);
                self.pending.retain(|p| p.temp_id != temp_id);
                if self.ids.insert(message.id) {
                    self.confirmed.insert(message.order_key(), message);
                }
            }
        }
    }

    pub fn fail(&mut self, temp_id: Uuid) {
        self.settled.retain(|_, taken| *taken != temp_id);
        if let Some(p) = self.pending.iter_mut().find(|p| p.temp_id == temp_id) {
            p.status = SendStatus::Failed;
        }
    }

    /// Flip a failed message back to `Sending` and return its content.
    pub fn retry(&mut self, temp_id: Uuid) -> Option<String> {
        let p = self
            .pending
            .iter_mut()
            .find(|p| p.temp_id == temp_id && p.status == SendStatus::Failed)?;
        p.status = SendStatus::Sending;
        Some(p.content.clone())
    }

    pub fn discard(&mut self, temp_id: Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.temp_id != temp_id);
        self.pending.len() != before
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    /// Confirmed messages in store order.
    pub fn messages(&self) -> Vec<Message> {
        self.confirmed.values().cloned().collect()
    }

    /// Confirmed messages followed by pending ones, in queue order.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.confirmed
            .values()
            .cloned()
            .map(TimelineEntry::Confirmed)
            .chain(self.pending.iter().cloned().map(TimelineEntry::Pending))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.confirmed.clear();
        self.ids.clear();
        self.pending.clear();
        self.settled.clear();
        self.synced_through = None;
    }
}
