//! Ephemeral typing presence.
//!
//! A typing signal is never a mutable flag. Each (conversation, participant)
//! pair maps to the instant its last signal expires, and [`TypingState`] is
//! recomputed from the clock on every read. A participant whose tab crashed
//! or whose link dropped therefore stops "typing" within one TTL window
//! without anyone sending a clear.
//!
//! Expiry on the receiving side is measured from *receipt* on the local
//! monotonic clock, so sender clock skew cannot stretch or shorten it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use concierge_bus::{RealtimeBus, Topic};
use concierge_shared::{BusEvent, ConversationKey, IdentityId, PresenceEvent, PresenceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Absent,
    Typing { expires_at: Instant },
}

impl TypingState {
    pub fn is_typing(&self) -> bool {
        matches!(self, TypingState::Typing { .. })
    }
}

type SignalKey = (ConversationKey, IdentityId);

#[derive(Default)]
struct PresenceInner {
    /// Expiry of the most recently observed or created signal.
    signals: HashMap<SignalKey, Instant>,
    /// Last outbound broadcast, for debouncing.
    last_broadcast: HashMap<SignalKey, Instant>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    bus: RealtimeBus,
    ttl: Duration,
    debounce: Duration,
    inner: Arc<Mutex<PresenceInner>>,
}

impl PresenceTracker {
    pub fn new(bus: RealtimeBus, ttl: Duration, debounce: Duration) -> Self {
        Self {
            bus,
            ttl,
            debounce,
            inner: Arc::new(Mutex::new(PresenceInner::default())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // Presence is cosmetic: a poisoned lock is recovered rather than
    // propagated.
    fn inner(&self) -> MutexGuard<'_, PresenceInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `participant` is composing and broadcast it, at most once
    /// per debounce interval. Returns whether a broadcast went out.
    pub fn set_typing(&self, key: &ConversationKey, participant: &IdentityId) -> bool {
        let now = Instant::now();
        let signal = (key.clone(), participant.clone());

        {
            let mut inner = self.inner();
            inner.signals.insert(signal.clone(), now + self.ttl);

            if let Some(last) = inner.last_broadcast.get(&signal) {
                if now.duration_since(*last) < self.debounce {
                    return false;
                }
            }
            inner.last_broadcast.insert(signal, now);
        }

        self.broadcast(
            key,
            participant,
            PresenceKind::Typing {
                ttl_ms: self.ttl.as_millis() as u64,
            },
        );
        true
    }

    /// Best-effort explicit clear, published immediately.
    pub fn clear_typing(&self, key: &ConversationKey, participant: &IdentityId) {
        let signal = (key.clone(), participant.clone());
        {
            let mut inner = self.inner();
            inner.signals.remove(&signal);
            inner.last_broadcast.remove(&signal);
        }
        self.broadcast(key, participant, PresenceKind::Stopped);
    }

    fn broadcast(&self, key: &ConversationKey, participant: &IdentityId, kind: PresenceKind) {
        let event = BusEvent::Presence(PresenceEvent {
            key: key.clone(),
            participant: participant.clone(),
            kind,
            sent_at: Utc::now(),
        });
        if let Err(e) = self.bus.publish(&Topic::Presence(key.clone()), &event) {
            debug!(conversation = %key, error = %e, "Dropping presence broadcast");
        }
    }

    /// Apply a presence event received from the bus.
    pub fn observe(&self, event: &PresenceEvent) {
        let signal = (event.key.clone(), event.participant.clone());
        let mut inner = self.inner();
        match event.kind {
            PresenceKind::Typing { ttl_ms } => {
                let expires_at = Instant::now() + Duration::from_millis(ttl_ms);
                inner.signals.insert(signal, expires_at);
            }
            PresenceKind::Stopped => {
                inner.signals.remove(&signal);
            }
        }
    }

    pub fn state(&self, key: &ConversationKey, participant: &IdentityId) -> TypingState {
        let now = Instant::now();
        let inner = self.inner();
        match inner.signals.get(&(key.clone(), participant.clone())) {
            Some(&expires_at) if now < expires_at => TypingState::Typing { expires_at },
            _ => TypingState::Absent,
        }
    }

    pub fn is_typing(&self, key: &ConversationKey, participant: &IdentityId) -> bool {
        self.state(key, participant).is_typing()
    }

    /// Participants with a live signal in `key`, sorted.
    pub fn typing_in(&self, key: &ConversationKey) -> Vec<IdentityId> {
        let now = Instant::now();
        let inner = self.inner();
        let mut typing: Vec<IdentityId> = inner
            .signals
            .iter()
            .filter(|((k, _), expires_at)| k == key && now < **expires_at)
            .map(|((_, who), _)| who.clone())
            .collect();
        typing.sort();
        typing
    }

    /// Earliest instant at which a live signal in `key` lapses. Views arm a
    /// timer on this to clear indicators without waiting for another event.
    pub fn next_expiry(&self, key: &ConversationKey) -> Option<Instant> {
        let now = Instant::now();
        let inner = self.inner();
        inner
            .signals
            .iter()
            .filter(|((k, _), expires_at)| k == key && now < **expires_at)
            .map(|(_, expires_at)| *expires_at)
            .min()
    }

    /// Evict dead signals. Readers never depend on this; it only bounds memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let debounce = self.debounce;
        let mut inner = self.inner();
        let before = inner.signals.len();
        inner.signals.retain(|_, expires_at| now < *expires_at);
        inner
            .last_broadcast
            .retain(|_, last| now.duration_since(*last) < debounce);
        before - inner.signals.len()
    }
}
