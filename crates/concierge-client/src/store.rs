//! The message store seam.
//!
//! [`SqliteMessageStore`] is the production implementation: the SQLite log
//! is the durability guarantee, the realtime bus is best-effort delivery.
//! Every successful append is published before `append` returns; a failed
//! publish is logged and the append still succeeds, because subscribers heal
//! gaps by backfilling.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use concierge_bus::{RealtimeBus, Topic};
use concierge_shared::{validate_append, BusEvent, ConversationKey, IdentityId, Message, MessageId};
use concierge_store::{ConversationRow, Database};

use crate::error::ChatError;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. Fails with `ChatError::Validation` for empty
    /// content or a sender outside the key, before anything is written.
    async fn append(
        &self,
        key: &ConversationKey,
        sender: &IdentityId,
        content: &str,
    ) -> Result<Message, ChatError>;

    /// Messages of `key` with `id > since`, ascending by `(created_at, id)`.
    async fn list(
        &self,
        key: &ConversationKey,
        since: Option<MessageId>,
    ) -> Result<Vec<Message>, ChatError>;

    /// One row per (scope, other participant) involving `identity`, newest
    /// first.
    async fn list_conversations_involving(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<ConversationRow>, ChatError>;
}

#[derive(Clone)]
pub struct SqliteMessageStore {
    db: Arc<Mutex<Database>>,
    bus: RealtimeBus,
}

impl SqliteMessageStore {
    pub fn new(db: Database, bus: RealtimeBus) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            bus,
        }
    }

    /// Direct handle on the underlying database, for hosts that import or
    /// inspect data outside the append path.
    pub fn database(&self) -> Arc<Mutex<Database>> {
        self.db.clone()
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> concierge_store::Result<T>,
    ) -> Result<T, ChatError> {
        let guard = self
            .db
            .lock()
            .map_err(|e| ChatError::TransientIo(format!("Lock poisoned: {e}")))?;
        Ok(f(&*guard)?)
    }

    fn publish_appended(&self, message: &Message) {
        let event = BusEvent::MessageAppended(message.clone());
        let (low, high) = message.key.participants();
        let topics = [
            Topic::Messages(message.key.clone()),
            Topic::Inbox(low.clone()),
            Topic::Inbox(high.clone()),
        ];

        for topic in &topics {
            match self.bus.publish(topic, &event) {
                Ok(delivered) => {
                    debug!(topic = %topic, id = %message.id, delivered, "Published appended message")
                }
                Err(e) => {
                    warn!(topic = %topic, id = %message.id, error = %e, "Publish after append failed")
                }
            }
        }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(
        &self,
        key: &ConversationKey,
        sender: &IdentityId,
        content: &str,
    ) -> Result<Message, ChatError> {
        validate_append(key, sender, content)?;
        let message = self.with_db(|db| db.append_message(key, sender, content))?;
        self.publish_appended(&message);
        Ok(message)
    }

    async fn list(
        &self,
        key: &ConversationKey,
        since: Option<MessageId>,
    ) -> Result<Vec<Message>, ChatError> {
        self.with_db(|db| db.list_messages(key, since))
    }

    async fn list_conversations_involving(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<ConversationRow>, ChatError> {
        self.with_db(|db| db.list_conversations_involving(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_shared::{ScopeId, ValidationError};

    fn id(s: &str) -> IdentityId {
        IdentityId::new(s)
    }

    fn store() -> (SqliteMessageStore, RealtimeBus) {
        let bus = RealtimeBus::new();
        let store = SqliteMessageStore::new(Database::open_in_memory().unwrap(), bus.clone());
        (store, bus)
    }

    #[tokio::test]
    async fn test_append_implies_publish() {
        let (store, bus) = store();
        let key = ConversationKey::scoped(ScopeId::new("req-1"), id("cust"), id("agent")).unwrap();
        let mut conv = bus.subscribe(&Topic::Messages(key.clone())).unwrap();
        let mut inbox = bus.subscribe(&Topic::Inbox(id("agent"))).unwrap();

        let sent = store.append(&key, &id("cust"), "need a quote").await.unwrap();

        let frame = conv.receiver.try_recv().unwrap();
        assert_eq!(frame.decode().unwrap(), BusEvent::MessageAppended(sent.clone()));
        let frame = inbox.receiver.try_recv().unwrap();
        assert_eq!(frame.decode().unwrap(), BusEvent::MessageAppended(sent));
    }

    #[tokio::test]
    async fn test_append_survives_bus_outage() {
        let (store, bus) = store();
        let key = ConversationKey::general(id("cust"), id("agent")).unwrap();

        bus.disconnect();
        let sent = store.append(&key, &id("agent"), "hello").await.unwrap();

        assert_eq!(store.list(&key, None).await.unwrap(), vec![sent]);
    }

    #[tokio::test]
    async fn test_validation_before_store() {
        let (store, bus) = store();
        let key = ConversationKey::general(id("cust"), id("agent")).unwrap();
        let mut conv = bus.subscribe(&Topic::Messages(key.clone())).unwrap();

        let err = store.append(&key, &id("cust"), "").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(ValidationError::EmptyContent)));
        let err = store.append(&key, &id("intruder"), "hi").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Validation(ValidationError::SenderNotParticipant { .. })
        ));

        assert!(store.list(&key, None).await.unwrap().is_empty());
        assert!(conv.receiver.try_recv().is_err());
    }
}
