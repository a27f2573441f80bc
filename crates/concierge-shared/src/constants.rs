/// Application name
pub const APP_NAME: &str = "Concierge";

/// How long a typing signal stays live without a refresh (milliseconds)
pub const TYPING_TTL_MS: u64 = 5_000;

/// Minimum spacing between two outbound typing broadcasts for the same
/// participant in the same conversation (milliseconds)
pub const TYPING_DEBOUNCE_MS: u64 = 1_500;

/// Maximum message length in characters
pub const MAX_MESSAGE_CHARS: usize = 4_000;

/// Upper bound for a backfill (list) round trip before it counts as failed
pub const BACKFILL_TIMEOUT_SECS: u64 = 10;

/// Upper bound for an append round trip before the send is reported as failed
pub const APPEND_TIMEOUT_SECS: u64 = 10;

/// Inbox safety-net poll interval
pub const INBOX_POLL_SECS: u64 = 15;

/// Backoff bounds for read-path retries (milliseconds)
pub const RETRY_INITIAL_MS: u64 = 250;
pub const RETRY_MAX_MS: u64 = 8_000;

/// Per-subscriber frame buffer on the realtime bus
pub const BUS_BUFFER: usize = 256;

/// Topic prefixes on the realtime bus
pub const TOPIC_MESSAGES: &str = "msg";
pub const TOPIC_PRESENCE: &str = "presence";
pub const TOPIC_INBOX: &str = "inbox";
