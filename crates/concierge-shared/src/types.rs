use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_CHARS;
use crate::error::ValidationError;

// Identity ids are opaque strings handed out by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque id of the business record (sourcing request, order, ...) a
/// conversation is anchored to. Never interpreted by the messaging core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned message id, monotonic per store.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Agent,
    Admin,
}

impl Role {
    /// Agents and admins multiplex many conversations through the inbox.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Agent | Role::Admin)
    }
}

/// The signed-in identity as reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub role: Role,
}

// ---------------------------------------------------------------------------
// ConversationKey
// ---------------------------------------------------------------------------

/// Identity of a message thread.
///
/// Participants are stored in sorted order, so the derived `Eq`/`Hash`
/// compare the *unordered* pair: `(alice, bob)` and `(bob, alice)` under the
/// same scope are the same conversation. Two keys with the same pair but a
/// different (or missing) scope are distinct threads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "RawConversationKey")]
pub struct ConversationKey {
    scope: Option<ScopeId>,
    low: IdentityId,
    high: IdentityId,
}

/// Wire shape of a key, checked through [`ConversationKey::new`].
#[derive(Deserialize)]
struct RawConversationKey {
    scope: Option<ScopeId>,
    low: IdentityId,
    high: IdentityId,
}

impl TryFrom<RawConversationKey> for ConversationKey {
    type Error = ValidationError;

    fn try_from(raw: RawConversationKey) -> Result<Self, Self::Error> {
        Self::new(raw.scope, raw.low, raw.high)
    }
}

impl ConversationKey {
    pub fn new(
        scope: Option<ScopeId>,
        a: IdentityId,
        b: IdentityId,
    ) -> Result<Self, ValidationError> {
        if a.0.is_empty() || b.0.is_empty() {
            return Err(ValidationError::EmptyIdentity);
        }
        if matches!(scope, Some(ref s) if s.0.is_empty()) {
            return Err(ValidationError::EmptyIdentity);
        }
        if a == b {
            return Err(ValidationError::SelfConversation);
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { scope, low, high })
    }

    /// A standing thread between two identities with no business record.
    pub fn general(a: IdentityId, b: IdentityId) -> Result<Self, ValidationError> {
        Self::new(None, a, b)
    }

    /// A thread tied to one business record.
    pub fn scoped(scope: ScopeId, a: IdentityId, b: IdentityId) -> Result<Self, ValidationError> {
        Self::new(Some(scope), a, b)
    }

    pub fn scope(&self) -> Option<&ScopeId> {
        self.scope.as_ref()
    }

    pub fn participants(&self) -> (&IdentityId, &IdentityId) {
        (&self.low, &self.high)
    }

    pub fn involves(&self, id: &IdentityId) -> bool {
        &self.low == id || &self.high == id
    }

    /// The other participant, seen from `me`.
    pub fn counterpart(&self, me: &IdentityId) -> Option<&IdentityId> {
        if &self.low == me {
            Some(&self.high)
        } else if &self.high == me {
            Some(&self.low)
        } else {
            None
        }
    }

    pub fn check_sender(&self, sender: &IdentityId) -> Result<(), ValidationError> {
        if self.involves(sender) {
            Ok(())
        } else {
            Err(ValidationError::SenderNotParticipant {
                sender: sender.to_string(),
            })
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "scoped/{}/{}/{}", scope, self.low, self.high),
            None => write!(f, "general/{}/{}", self.low, self.high),
        }
    }
}

/// Reject empty, whitespace-only and oversized content.
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    let len = content.chars().count();
    if len > MAX_MESSAGE_CHARS {
        return Err(ValidationError::ContentTooLong {
            len,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(())
}

/// Full pre-store validation of an append request.
pub fn validate_append(
    key: &ConversationKey,
    sender: &IdentityId,
    content: &str,
) -> Result<(), ValidationError> {
    key.check_sender(sender)?;
    validate_content(content)
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A persisted chat message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub key: ConversationKey,
    pub sender_id: IdentityId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Total order within a conversation: `(created_at, id)`.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

// ---------------------------------------------------------------------------
// ConversationSummary
// ---------------------------------------------------------------------------

/// One inbox row: the other participant and the latest message exchanged
/// with them. Derived at read time, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub other_participant: IdentityId,
    /// Thread the latest message belongs to; selecting the row opens it.
    pub key: ConversationKey,
    pub last_message: Option<Message>,
    pub unread: bool,
}

impl ConversationSummary {
    pub fn derive(
        me: &IdentityId,
        other: IdentityId,
        key: ConversationKey,
        last: Option<Message>,
    ) -> Self {
        let unread = last.as_ref().map(|m| &m.sender_id != me).unwrap_or(false);
        Self {
            other_participant: other,
            key,
            last_message: last,
            unread,
        }
    }

    pub fn last_activity(&self) -> Option<(DateTime<Utc>, MessageId)> {
        self.last_message.as_ref().map(Message::order_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> IdentityId {
        IdentityId::new(s)
    }

    #[test]
    fn test_key_is_unordered_pair() {
        let k1 = ConversationKey::general(id("alice"), id("bob")).unwrap();
        let k2 = ConversationKey::general(id("bob"), id("alice")).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.to_string(), "general/alice/bob");
    }

    #[test]
    fn test_scope_separates_threads() {
        let general = ConversationKey::general(id("alice"), id("bob")).unwrap();
        let r1 = ConversationKey::scoped(ScopeId::new("req-1"), id("alice"), id("bob")).unwrap();
        let r2 = ConversationKey::scoped(ScopeId::new("req-2"), id("bob"), id("alice")).unwrap();
        assert_ne!(general, r1);
        assert_ne!(r1, r2);
    }

    #[test]
    fn test_self_conversation_rejected() {
        assert_eq!(
            ConversationKey::general(id("alice"), id("alice")),
            Err(ValidationError::SelfConversation)
        );
        assert_eq!(
            ConversationKey::general(id(""), id("alice")),
            Err(ValidationError::EmptyIdentity)
        );
    }

    #[test]
    fn test_decoded_key_is_checked() {
        let swapped = bincode::serialize(&(None::<ScopeId>, id("bob"), id("alice"))).unwrap();
        let key: ConversationKey = bincode::deserialize(&swapped).unwrap();
        assert_eq!(key, ConversationKey::general(id("alice"), id("bob")).unwrap());
        assert_eq!(key.participants(), (&id("alice"), &id("bob")));

        let with_self = bincode::serialize(&(None::<ScopeId>, id("bob"), id("bob"))).unwrap();
        assert!(bincode::deserialize::<ConversationKey>(&with_self).is_err());
    }

    #[test]
    fn test_counterpart() {
        let key = ConversationKey::general(id("staff"), id("cust")).unwrap();
        assert_eq!(key.counterpart(&id("staff")), Some(&id("cust")));
        assert_eq!(key.counterpart(&id("cust")), Some(&id("staff")));
        assert_eq!(key.counterpart(&id("mallory")), None);
    }

    #[test]
    fn test_validate_append() {
        let key = ConversationKey::general(id("alice"), id("bob")).unwrap();
        assert_eq!(
            validate_append(&key, &id("alice"), "   \n\t"),
            Err(ValidationError::EmptyContent)
        );
        assert!(matches!(
            validate_append(&key, &id("mallory"), "hi"),
            Err(ValidationError::SenderNotParticipant { .. })
        ));
        let long = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(matches!(
            validate_append(&key, &id("bob"), &long),
            Err(ValidationError::ContentTooLong { .. })
        ));
        assert!(validate_append(&key, &id("bob"), "hello").is_ok());
    }

    #[test]
    fn test_summary_unread_derivation() {
        let key = ConversationKey::general(id("staff"), id("cust")).unwrap();
        let msg = Message {
            id: MessageId(1),
            key: key.clone(),
            sender_id: id("cust"),
            content: "hi".into(),
            created_at: Utc::now(),
        };
        let s = ConversationSummary::derive(&id("staff"), id("cust"), key.clone(), Some(msg));
        assert!(s.unread);

        let s = ConversationSummary::derive(&id("staff"), id("cust"), key, None);
        assert!(!s.unread);
    }
}
