//! # concierge-client
//!
//! The direct-messaging core consumed by portal UI code.
//!
//! - [`MessageStore`] is the async seam over the durable message log;
//!   [`SqliteMessageStore`] persists through `concierge-store` and publishes
//!   every successful append on the realtime bus.
//! - [`PresenceTracker`] holds TTL-bounded typing signals.
//! - [`ChatSession`] owns the lifecycle of one open conversation: backfill,
//!   live subscription, optimistic send, typing, reconnect.
//! - [`InboxAggregator`] keeps a staff member's ranked conversation list
//!   fresh by polling and by re-fetching on inbox events.
//!
//! Each owner exposes explicit start/stop so hosts can run them as plain
//! tokio tasks.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod error;
pub mod inbox;
pub mod presence;
pub mod retry;
pub mod session;
pub mod store;
pub mod timeline;

#[cfg(test)]
mod scenarios;

pub use collaborators::{IdentityProvider, Notifier, StaticIdentity};
pub use config::ChatConfig;
pub use context::ChatContext;
pub use error::ChatError;
pub use inbox::{InboxAggregator, InboxHandle};
pub use presence::{PresenceTracker, TypingState};
pub use session::{ChatSession, SessionNotice, SessionState, SessionView};
pub use store::{MessageStore, SqliteMessageStore};
pub use timeline::{PendingMessage, SendStatus, Timeline, TimelineEntry};
