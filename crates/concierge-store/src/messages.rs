use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, OptionalExtension};

use concierge_shared::{validate_append, ConversationKey, IdentityId, Message, MessageId, ScopeId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::ConversationRow;

const MESSAGE_COLUMNS: &str =
    "id, scope_id, participant_low, participant_high, sender_id, content, created_at";

impl Database {
    /// Append a message through the normal write path.
    ///
    /// The request is validated before any SQL runs. Inside one transaction
    /// the new row gets `created_at = max(now, newest persisted created_at)`,
    /// so the autoincrement id and the timestamp never disagree.
    pub fn append_message(
        &self,
        key: &ConversationKey,
        sender: &IdentityId,
        content: &str,
    ) -> Result<Message> {
        validate_append(key, sender, content)?;

        let tx = self.conn().unchecked_transaction()?;

        let newest: Option<String> =
            tx.query_row("SELECT MAX(created_at) FROM messages", [], |row| row.get(0))?;
        let mut created_at = Utc::now().trunc_subsecs(6);
        if let Some(ts) = newest {
            let newest = parse_timestamp(&ts)?;
            if newest > created_at {
                created_at = newest;
            }
        }

        let message = insert_row(&tx, key, sender, content, created_at)?;
        tx.commit()?;

        tracing::debug!(
            id = %message.id,
            conversation = %key,
            sender = %sender,
            "message appended"
        );
        Ok(message)
    }

    /// Insert with an explicit timestamp, bypassing the monotonic clamp.
    ///
    /// Used by importers replaying historical data. Validation still applies.
    pub fn insert_message_at(
        &self,
        key: &ConversationKey,
        sender: &IdentityId,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        validate_append(key, sender, content)?;
        insert_row(self.conn(), key, sender, content, created_at.trunc_subsecs(6))
    }

    /// All messages of a conversation with `id > since`, ascending by
    /// `(created_at, id)`.
    pub fn list_messages(
        &self,
        key: &ConversationKey,
        since: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let (low, high) = key.participants();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE participant_low = ?1 AND participant_high = ?2 AND scope_id IS ?3
               AND id > ?4
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;

        let rows = stmt.query_map(
            params![
                low.as_str(),
                high.as_str(),
                key.scope().map(ScopeId::as_str),
                since.map(|m| m.0).unwrap_or(0),
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// One row per distinct (scope, other participant) involving `identity`,
    /// with the most recent message attached, most recent first.
    pub fn list_conversations_involving(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<ConversationRow>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM (
                 SELECT *, ROW_NUMBER() OVER (
                     PARTITION BY scope_id, participant_low, participant_high
                     ORDER BY created_at DESC, id DESC
                 ) AS recency
                 FROM messages
                 WHERE participant_low = ?1 OR participant_high = ?1
             )
             WHERE recency = 1
             ORDER BY created_at DESC, id DESC"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![identity.as_str()], row_to_message)?;

        let mut conversations = Vec::new();
        for row in rows {
            let last_message = row?;
            let other = last_message
                .key
                .counterpart(identity)
                .cloned()
                .ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "row {} does not involve {identity}",
                        last_message.id
                    ))
                })?;
            conversations.push(ConversationRow {
                key: last_message.key.clone(),
                other,
                last_message,
            });
        }
        Ok(conversations)
    }

    /// Most recent message of a conversation, if any.
    pub fn latest_message(&self, key: &ConversationKey) -> Result<Option<Message>> {
        let (low, high) = key.participants();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE participant_low = ?1 AND participant_high = ?2 AND scope_id IS ?3
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        );
        let message = self
            .conn()
            .query_row(
                &sql,
                params![low.as_str(), high.as_str(), key.scope().map(ScopeId::as_str)],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn count_messages(&self, key: &ConversationKey) -> Result<u64> {
        let (low, high) = key.participants();
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE participant_low = ?1 AND participant_high = ?2 AND scope_id IS ?3",
            params![low.as_str(), high.as_str(), key.scope().map(ScopeId::as_str)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn insert_row(
    conn: &rusqlite::Connection,
    key: &ConversationKey,
    sender: &IdentityId,
    content: &str,
    created_at: DateTime<Utc>,
) -> Result<Message> {
    let (low, high) = key.participants();
    conn.execute(
        "INSERT INTO messages (scope_id, participant_low, participant_high, sender_id, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            key.scope().map(ScopeId::as_str),
            low.as_str(),
            high.as_str(),
            sender.as_str(),
            content,
            format_timestamp(&created_at),
        ],
    )?;

    Ok(Message {
        id: MessageId(conn.last_insert_rowid()),
        key: key.clone(),
        sender_id: sender.clone(),
        content: content.to_string(),
        created_at,
    })
}

/// Fixed-width RFC 3339 so that text order equals chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(ts)?.with_timezone(&Utc))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: i64 = row.get(0)?;
    let scope: Option<String> = row.get(1)?;
    let low: String = row.get(2)?;
    let high: String = row.get(3)?;
    let sender: String = row.get(4)?;
    let content: String = row.get(5)?;
    let ts_str: String = row.get(6)?;

    let key = ConversationKey::new(scope.map(ScopeId), IdentityId(low), IdentityId(high))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id: MessageId(id),
        key,
        sender_id: IdentityId(sender),
        content,
        created_at,
    })
}
