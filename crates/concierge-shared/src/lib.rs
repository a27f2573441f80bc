//! # concierge-shared
//!
//! Data model and wire protocol shared by every Concierge crate: identities,
//! conversation keys, messages, typing presence and the frames carried on the
//! realtime bus.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ValidationError;
pub use protocol::{BusEvent, PresenceEvent, PresenceKind};
pub use types::{
    ConversationKey, ConversationSummary, Identity, IdentityId, Message, MessageId, Role, ScopeId,
};
pub use types::{validate_append, validate_content};
