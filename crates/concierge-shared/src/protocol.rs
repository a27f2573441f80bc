use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationKey, IdentityId, Message};

/// Everything carried on the realtime bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BusEvent {
    /// A message was persisted; published on the conversation topic and on
    /// the inbox topic of both participants.
    MessageAppended(Message),

    /// Ephemeral typing presence, published on the conversation's presence
    /// topic. Never persisted.
    Presence(PresenceEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEvent {
    pub key: ConversationKey,
    pub participant: IdentityId,
    pub kind: PresenceKind,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PresenceKind {
    /// Participant is composing. Receivers treat the signal as live for
    /// `ttl_ms` after receipt, measured on their own clock.
    Typing { ttl_ms: u64 },
    /// Explicit clear (blur, send, close). Best effort only.
    Stopped,
}

impl BusEvent {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn key(&self) -> &ConversationKey {
        match self {
            BusEvent::MessageAppended(m) => &m.key,
            BusEvent::Presence(p) => &p.key,
        }
    }
}
