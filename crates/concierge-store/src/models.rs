//! Read models returned by the store.

use serde::{Deserialize, Serialize};

use concierge_shared::{ConversationKey, IdentityId, Message};

// ---------------------------------------------------------------------------
// ConversationRow
// ---------------------------------------------------------------------------

/// One conversation involving a given identity, with its most recent message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRow {
    /// The thread (scope + participant pair).
    pub key: ConversationKey,
    /// The participant on the other side, seen from the queried identity.
    pub other: IdentityId,
    /// Most recent message of the thread by `(created_at, id)`.
    pub last_message: Message,
}
