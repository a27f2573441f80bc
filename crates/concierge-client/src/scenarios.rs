//! End-to-end behaviour of sessions and inboxes over a shared store and bus.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{timeout, Instant};

use concierge_bus::{RealtimeBus, Topic};
use concierge_shared::{
    ConversationKey, ConversationSummary, Identity, IdentityId, Message, MessageId, Role, ScopeId,
    ValidationError,
};
use concierge_store::{ConversationRow, Database};

use crate::config::ChatConfig;
use crate::context::ChatContext;
use crate::error::ChatError;
use crate::inbox::InboxAggregator;
use crate::session::{ChatSession, SessionNotice, SessionState, SessionView};
use crate::store::{MessageStore, SqliteMessageStore};
use crate::timeline::{SendStatus, TimelineEntry};

/// SQLite-backed store with switchable faults.
struct FlakyStore {
    inner: SqliteMessageStore,
    list_failures: AtomicU32,
    fail_appends: AtomicBool,
    ignore_since: AtomicBool,
    /// Delay between a published append and its reply, in milliseconds.
    reply_lag_ms: AtomicU64,
}

impl FlakyStore {
    fn new(bus: &RealtimeBus) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteMessageStore::new(Database::open_in_memory().unwrap(), bus.clone()),
            list_failures: AtomicU32::new(0),
            fail_appends: AtomicBool::new(false),
            ignore_since: AtomicBool::new(false),
            reply_lag_ms: AtomicU64::new(0),
        })
    }

    /// Append without publishing, as if the realtime event was lost.
    fn append_silently(&self, key: &ConversationKey, sender: &str, content: &str) -> Message {
        self.inner
            .database()
            .lock()
            .unwrap()
            .append_message(key, &id(sender), content)
            .unwrap()
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn append(
        &self,
        key: &ConversationKey,
        sender: &IdentityId,
        content: &str,
    ) -> Result<Message, ChatError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(ChatError::TransientIo("append refused".into()));
        }
        let message = self.inner.append(key, sender, content).await?;
        let lag = self.reply_lag_ms.load(Ordering::SeqCst);
        if lag > 0 {
            tokio::time::sleep(Duration::from_millis(lag)).await;
        }
        Ok(message)
    }

    async fn list(
        &self,
        key: &ConversationKey,
        since: Option<MessageId>,
    ) -> Result<Vec<Message>, ChatError> {
        let failing = self
            .list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChatError::TransientIo("listing refused".into()));
        }
        let since = if self.ignore_since.load(Ordering::SeqCst) {
            None
        } else {
            since
        };
        self.inner.list(key, since).await
    }

    async fn list_conversations_involving(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<ConversationRow>, ChatError> {
        self.inner.list_conversations_involving(identity).await
    }
}

fn id(s: &str) -> IdentityId {
    IdentityId::new(s)
}

fn general(a: &str, b: &str) -> ConversationKey {
    ConversationKey::general(id(a), id(b)).unwrap()
}

/// One store and bus, with a separate context (and presence tracker) per
/// participant as if each ran in its own client.
fn harness() -> (Arc<FlakyStore>, RealtimeBus) {
    let bus = RealtimeBus::new();
    (FlakyStore::new(&bus), bus)
}

fn client(store: &Arc<FlakyStore>, bus: &RealtimeBus) -> ChatContext {
    ChatContext::new(store.clone(), bus.clone(), ChatConfig::default())
}

async fn until(session: &ChatSession, pred: impl FnMut(&SessionView) -> bool) {
    let mut rx = session.watch();
    timeout(Duration::from_secs(30), rx.wait_for(pred))
        .await
        .expect("condition not reached")
        .unwrap();
}

async fn live(ctx: ChatContext, me: &str, key: &ConversationKey) -> ChatSession {
    let session = ChatSession::open(ctx, id(me), key.clone()).unwrap();
    session.wait_for_state(SessionState::Live).await.unwrap();
    session
}

fn leads_with(summaries: &[ConversationSummary], who: &str) -> bool {
    summaries
        .first()
        .map_or(false, |s| s.other_participant.as_str() == who)
}

fn contents(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

#[tokio::test]
async fn test_both_sides_render_store_order() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    let cust = live(client(&store, &bus), "cust", &key).await;
    let agent = live(client(&store, &bus), "agent", &key).await;

    for round in 0..5 {
        cust.send(&format!("c{round}")).await.unwrap();
        agent.send(&format!("a{round}")).await.unwrap();
    }
    store.append_silently(&key, "cust", "late");
    cust.send("last").await.unwrap();

    let authoritative = store.list(&key, None).await.unwrap();
    assert_eq!(authoritative.len(), 12);

    // The agent saw every message live except the silent one.
    until(&agent, |v| v.entries.len() == 11).await;
    assert_eq!(
        contents(&agent.messages()),
        contents(&authoritative)
            .into_iter()
            .filter(|c| *c != "late")
            .collect::<Vec<_>>()
    );
    assert_eq!(contents(&cust.messages()).last(), Some(&"last"));
}

#[tokio::test]
async fn test_reconnect_heals_dropped_event() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    store.inner.append(&key, &id("cust"), "m0").await.unwrap();

    let agent = live(client(&store, &bus), "agent", &key).await;
    store.inner.append(&key, &id("cust"), "m1").await.unwrap();
    store.append_silently(&key, "cust", "m2");
    store.inner.append(&key, &id("cust"), "m3").await.unwrap();

    until(&agent, |v| v.entries.len() == 3).await;
    assert_eq!(contents(&agent.messages()), vec!["m0", "m1", "m3"]);

    bus.disconnect();
    agent
        .wait_for_state(SessionState::Reconnecting)
        .await
        .unwrap();
    store.inner.append(&key, &id("cust"), "m4").await.unwrap();
    bus.reconnect();

    agent.wait_for_state(SessionState::Live).await.unwrap();
    until(&agent, |v| v.entries.len() == 5).await;
    assert_eq!(
        contents(&agent.messages()),
        vec!["m0", "m1", "m2", "m3", "m4"]
    );
    assert_eq!(bus.subscriber_count(&Topic::Messages(key)), 1);
}

#[tokio::test]
async fn test_contradictory_listing_forces_full_reload() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    store.inner.append(&key, &id("cust"), "m1").await.unwrap();

    let agent = live(client(&store, &bus), "agent", &key).await;
    bus.disconnect();
    agent
        .wait_for_state(SessionState::Reconnecting)
        .await
        .unwrap();
    store.inner.append(&key, &id("cust"), "m2").await.unwrap();

    // The incremental listing now repeats m1, which it must never do.
    store.ignore_since.store(true, Ordering::SeqCst);
    bus.reconnect();

    agent.wait_for_state(SessionState::Live).await.unwrap();
    until(&agent, |v| v.entries.len() == 2).await;
    assert_eq!(contents(&agent.messages()), vec!["m1", "m2"]);
}

#[tokio::test(start_paused = true)]
async fn test_typing_indicator_expires_without_clear() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    let cust = live(client(&store, &bus), "cust", &key).await;
    let agent = live(client(&store, &bus), "agent", &key).await;
    let ttl = ChatConfig::default().typing_ttl;

    let started = Instant::now();
    assert!(cust.set_typing());
    until(&agent, |v| v.typing == vec![id("cust")]).await;
    assert!(agent.is_typing(&id("cust")));

    // The customer's tab dies: no clear is ever sent.
    until(&agent, |v| v.typing.is_empty()).await;
    assert!(started.elapsed() >= ttl);
    assert!(!agent.is_typing(&id("cust")));
}

#[tokio::test(start_paused = true)]
async fn test_send_clears_typing() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    let cust = live(client(&store, &bus), "cust", &key).await;
    let agent = live(client(&store, &bus), "agent", &key).await;

    cust.set_typing();
    until(&agent, |v| !v.typing.is_empty()).await;
    cust.send("done typing").await.unwrap();

    until(&agent, |v| v.typing.is_empty() && v.entries.len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_echo_ahead_of_reply_renders_once() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    let cust = live(client(&store, &bus), "cust", &key).await;
    let lag = Duration::from_millis(300);
    store
        .reply_lag_ms
        .store(lag.as_millis() as u64, Ordering::SeqCst);

    let started = Instant::now();
    let (sent, (during_lag, elapsed)) = tokio::join!(cust.send("hello"), async {
        until(&cust, |v| {
            v.entries
                .iter()
                .any(|e| matches!(e, TimelineEntry::Confirmed(_)))
        })
        .await;
        (cust.entries(), started.elapsed())
    });

    assert!(elapsed < lag);
    assert_eq!(during_lag.len(), 1);
    assert_eq!(cust.entries(), vec![TimelineEntry::Confirmed(sent.unwrap())]);
}

#[tokio::test(start_paused = true)]
async fn test_message_during_loading_is_kept() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    store.list_failures.store(1, Ordering::SeqCst);

    let agent = ChatSession::open(client(&store, &bus), id("agent"), key.clone()).unwrap();
    until(&agent, |v| v.notice == Some(SessionNotice::SlowNetwork)).await;
    assert_eq!(agent.state(), SessionState::Loading);

    store
        .inner
        .append(&key, &id("cust"), "during loading")
        .await
        .unwrap();

    agent.wait_for_state(SessionState::Live).await.unwrap();
    until(&agent, |v| v.entries.len() == 1).await;
    assert_eq!(contents(&agent.messages()), vec!["during loading"]);
}

#[tokio::test]
async fn test_failed_send_can_be_retried() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    let cust = live(client(&store, &bus), "cust", &key).await;

    store.fail_appends.store(true, Ordering::SeqCst);
    let err = cust.send("quote please").await.unwrap_err();
    assert!(err.is_retryable());

    let temp_id = match cust.entries().as_slice() {
        [TimelineEntry::Pending(p)] => {
            assert_eq!(p.status, SendStatus::Failed);
            assert_eq!(p.content, "quote please");
            p.temp_id
        }
        other => panic!("unexpected entries: {other:?}"),
    };

    store.fail_appends.store(false, Ordering::SeqCst);
    let sent = cust.retry(temp_id).await.unwrap();
    assert_eq!(cust.entries(), vec![TimelineEntry::Confirmed(sent)]);
    assert!(matches!(
        cust.retry(temp_id).await,
        Err(ChatError::UnknownPending(_))
    ));
}

#[tokio::test]
async fn test_failed_send_can_be_discarded() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    let cust = live(client(&store, &bus), "cust", &key).await;

    store.fail_appends.store(true, Ordering::SeqCst);
    cust.send("never mind").await.unwrap_err();
    let temp_id = cust.view().entries.iter().find_map(|e| match e {
        TimelineEntry::Pending(p) => Some(p.temp_id),
        _ => None,
    });

    cust.discard_failed(temp_id.unwrap()).unwrap();
    assert!(cust.entries().is_empty());
    assert!(store.list(&key, None).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_backfill_retries_with_notice() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    store.inner.append(&key, &id("cust"), "hello").await.unwrap();
    store.list_failures.store(2, Ordering::SeqCst);

    let agent = ChatSession::open(client(&store, &bus), id("agent"), key).unwrap();
    until(&agent, |v| v.notice == Some(SessionNotice::SlowNetwork)).await;
    assert_eq!(agent.state(), SessionState::Loading);

    agent.wait_for_state(SessionState::Live).await.unwrap();
    assert_eq!(agent.view().notice, None);
    assert_eq!(contents(&agent.messages()), vec!["hello"]);
}

#[tokio::test(start_paused = true)]
async fn test_send_before_live_is_rejected() {
    let (store, bus) = harness();
    let key = general("cust", "agent");
    store.list_failures.store(u32::MAX, Ordering::SeqCst);

    let cust = ChatSession::open(client(&store, &bus), id("cust"), key).unwrap();
    let err = cust.send("too early").await.unwrap_err();
    assert!(matches!(err, ChatError::NotLive(SessionState::Loading)));
    assert!(cust.entries().is_empty());
}

#[tokio::test]
async fn test_scoped_threads_stay_apart() {
    let (store, bus) = harness();
    let req1 = ConversationKey::scoped(ScopeId::new("req-1"), id("cust"), id("agent")).unwrap();
    let req2 = ConversationKey::scoped(ScopeId::new("req-2"), id("cust"), id("agent")).unwrap();
    let plain = general("cust", "agent");

    let s1 = live(client(&store, &bus), "cust", &req1).await;
    let s2 = live(client(&store, &bus), "agent", &req2).await;
    let s3 = live(client(&store, &bus), "agent", &plain).await;

    s1.send("about request one").await.unwrap();
    s2.send("about request two").await.unwrap();
    s3.send("general chat").await.unwrap();
    tokio::task::yield_now().await;

    assert_eq!(contents(&s1.messages()), vec!["about request one"]);
    assert_eq!(contents(&s2.messages()), vec!["about request two"]);
    assert_eq!(contents(&s3.messages()), vec!["general chat"]);
    assert_eq!(store.list(&req1, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_input_never_reaches_the_store() {
    let (store, bus) = harness();
    let key = general("cust", "agent");

    let err = ChatSession::open(client(&store, &bus), id("stranger"), key.clone())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::SenderNotParticipant { .. })
    ));

    let cust = live(client(&store, &bus), "cust", &key).await;
    assert!(matches!(
        cust.send("").await,
        Err(ChatError::Validation(ValidationError::EmptyContent))
    ));
    assert!(store.list(&key, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_inbox_ranks_by_latest_message() {
    let (store, bus) = harness();
    let with_a = general("staff", "a");
    let with_b = general("staff", "b");
    store.inner.append(&with_a, &id("a"), "M1").await.unwrap();
    store.inner.append(&with_b, &id("b"), "M2").await.unwrap();
    store.inner.append(&with_a, &id("staff"), "M3").await.unwrap();

    let staff = Identity {
        id: id("staff"),
        display_name: "Support".into(),
        role: Role::Admin,
    };
    let inbox = InboxAggregator::start(client(&store, &bus), &staff)
        .await
        .unwrap();

    let summaries = inbox.summaries();
    let order: Vec<_> = summaries
        .iter()
        .map(|s| (s.other_participant.as_str(), s.unread))
        .collect();
    assert_eq!(order, vec![("a", false), ("b", true)]);

    // A new message from b is pushed, not polled.
    let mut rx = inbox.watch();
    store.inner.append(&with_b, &id("b"), "M4").await.unwrap();
    timeout(Duration::from_secs(5), rx.wait_for(|s| leads_with(s, "b")))
        .await
        .unwrap()
        .unwrap();

    // Selecting a row opens its thread.
    let row_a = inbox.summaries().into_iter().find(|s| s.other_participant == id("a"));
    let session = inbox.open_session(&row_a.unwrap()).unwrap();
    session.wait_for_state(SessionState::Live).await.unwrap();
    assert_eq!(contents(&session.messages()), vec!["M1", "M3"]);
}

#[tokio::test]
async fn test_inbox_resubscribes_after_reconnect() {
    let (store, bus) = harness();
    let staff = Identity {
        id: id("staff"),
        display_name: "Support".into(),
        role: Role::Agent,
    };
    let inbox = InboxAggregator::start(client(&store, &bus), &staff)
        .await
        .unwrap();
    let topic = Topic::Inbox(id("staff"));

    bus.disconnect();
    bus.reconnect();
    let mut rx = inbox.watch();
    timeout(Duration::from_secs(5), async {
        while bus.subscriber_count(&topic) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    store
        .inner
        .append(&general("staff", "c"), &id("c"), "anyone there?")
        .await
        .unwrap();
    timeout(Duration::from_secs(5), rx.wait_for(|s| s.len() == 1))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_closing_everything_leaves_no_subscribers() {
    let (store, bus) = harness();
    let key = general("staff", "cust");
    let staff = Identity {
        id: id("staff"),
        display_name: "Support".into(),
        role: Role::Agent,
    };

    {
        let _cust = live(client(&store, &bus), "cust", &key).await;
        let _agent = live(client(&store, &bus), "staff", &key).await;
        let _inbox = InboxAggregator::start(client(&store, &bus), &staff)
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count(&Topic::Messages(key.clone())), 2);
    }

    assert_eq!(bus.subscriber_count(&Topic::Messages(key.clone())), 0);
    assert_eq!(bus.subscriber_count(&Topic::Presence(key)), 0);
    assert_eq!(bus.subscriber_count(&Topic::Inbox(id("staff"))), 0);
}
