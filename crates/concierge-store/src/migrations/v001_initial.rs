//! v001 -- Initial schema creation.
//!
//! Creates the append-only `messages` log.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (append-only; never updated or deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    scope_id         TEXT,                    -- NULL for general threads
    participant_low  TEXT NOT NULL,           -- lexicographically smaller id
    participant_high TEXT NOT NULL,
    sender_id        TEXT NOT NULL,
    content          TEXT NOT NULL,
    created_at       TEXT NOT NULL,           -- RFC-3339, UTC, microseconds

    CHECK (participant_low < participant_high),
    CHECK (sender_id = participant_low OR sender_id = participant_high)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(participant_low, participant_high, scope_id, id);

CREATE INDEX IF NOT EXISTS idx_messages_low ON messages(participant_low);
CREATE INDEX IF NOT EXISTS idx_messages_high ON messages(participant_high);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
