use std::fmt;

use concierge_shared::constants::{TOPIC_INBOX, TOPIC_MESSAGES, TOPIC_PRESENCE};
use concierge_shared::{ConversationKey, IdentityId};

/// Bus topics used by the messaging core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// New messages of one conversation.
    Messages(ConversationKey),
    /// Typing presence of one conversation.
    Presence(ConversationKey),
    /// Any new message touching one identity (staff inbox feed).
    Inbox(IdentityId),
}

impl Topic {
    pub fn to_topic(&self) -> String {
        match self {
            Topic::Messages(key) => format!("{TOPIC_MESSAGES}:{key}"),
            Topic::Presence(key) => format!("{TOPIC_PRESENCE}:{key}"),
            Topic::Inbox(id) => format!("{TOPIC_INBOX}:{id}"),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_topic())
    }
}
