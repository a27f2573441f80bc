//! One open conversation.
//!
//! A session moves `Loading -> Live`, drops to `Reconnecting` whenever the
//! realtime link goes away, and returns to `Live` once it has resubscribed
//! and backfilled what it missed. `close` ends it from any state.
//!
//! Subscriptions are always in place *before* the backfill that precedes
//! `Live`, so a message is either in the listing or delivered as an event.
//! Duplicates are harmless because the timeline merges by id.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use concierge_bus::{BusError, BusFrame, LinkStatus, Subscription, SubscriptionId, Topic};
use concierge_shared::{validate_append, BusEvent, ConversationKey, IdentityId, Message, MessageId};

use crate::context::ChatContext;
use crate::error::ChatError;
use crate::retry::Backoff;
use crate::timeline::{Timeline, TimelineEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed,
    Loading,
    Live,
    Reconnecting,
}

/// Non-fatal conditions the UI should surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionNotice {
    /// A backfill failed or timed out and is being retried.
    SlowNetwork,
}

/// Everything a view needs to render the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub entries: Vec<TimelineEntry>,
    /// Other participants currently typing.
    pub typing: Vec<IdentityId>,
    pub notice: Option<SessionNotice>,
}

impl SessionView {
    fn empty(state: SessionState) -> Self {
        Self {
            state,
            entries: Vec::new(),
            typing: Vec::new(),
            notice: None,
        }
    }
}

struct Feeds {
    messages: Subscription,
    presence: Subscription,
}

impl Feeds {
    fn ids(&self) -> Vec<SubscriptionId> {
        vec![self.messages.id, self.presence.id]
    }
}

struct Shared {
    state: SessionState,
    timeline: Timeline,
    subscriptions: Vec<SubscriptionId>,
    notice: Option<SessionNotice>,
}

struct SessionCore {
    ctx: ChatContext,
    me: IdentityId,
    key: ConversationKey,
    shared: Mutex<Shared>,
    view: watch::Sender<SessionView>,
}

pub struct ChatSession {
    core: Arc<SessionCore>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    /// Open `key` as `me`. Must be called from within a tokio runtime.
    ///
    /// Fails with `ChatError::Validation` when `me` is not a participant.
    /// The session starts in `Loading`; the initial backfill runs in the
    /// background and is retried until it succeeds or the session closes.
    pub fn open(
        ctx: ChatContext,
        me: IdentityId,
        key: ConversationKey,
    ) -> Result<Self, ChatError> {
        key.check_sender(&me)?;

        let (view, _) = watch::channel(SessionView::empty(SessionState::Loading));
        let core = Arc::new(SessionCore {
            ctx,
            me,
            key,
            shared: Mutex::new(Shared {
                state: SessionState::Loading,
                timeline: Timeline::new(),
                subscriptions: Vec::new(),
                notice: None,
            }),
            view,
        });

        let feeds = match core.subscribe_feeds() {
            Ok(feeds) => feeds,
            Err(e) => {
                debug!(conversation = %core.key, error = %e, "Opening session without a realtime link");
                None
            }
        };

        info!(conversation = %core.key, me = %core.me, "Opening chat session");
        let task = tokio::spawn(core.clone().run(feeds));

        Ok(Self {
            core,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn key(&self) -> &ConversationKey {
        &self.core.key
    }

    pub fn me(&self) -> &IdentityId {
        &self.core.me
    }

    pub fn state(&self) -> SessionState {
        self.core.shared().state
    }

    /// Confirmed messages in `(created_at, id)` order.
    pub fn messages(&self) -> Vec<Message> {
        self.core.shared().timeline.messages()
    }

    /// Confirmed messages followed by pending sends.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.core.shared().timeline.entries()
    }

    pub fn view(&self) -> SessionView {
        self.core.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.core.view.subscribe()
    }

    /// Resolve once the session reaches `state`.
    pub async fn wait_for_state(&self, state: SessionState) -> Result<(), ChatError> {
        let mut rx = self.core.view.subscribe();
        rx.wait_for(|view| view.state == state)
            .await
            .map(|_| ())
            .map_err(|_| ChatError::Closed)
    }

    /// Send a message as `me`.
    ///
    /// The message shows up immediately as a pending entry and is replaced
    /// by the stored copy once the append succeeds. On failure it stays in
    /// the timeline as `Failed` for [`retry`](Self::retry) or
    /// [`discard_failed`](Self::discard_failed).
    pub async fn send(&self, content: &str) -> Result<Message, ChatError> {
        self.core.ensure_sendable()?;
        validate_append(&self.core.key, &self.core.me, content)?;

        let temp_id = {
            let mut shared = self.core.shared();
            shared
                .timeline
                .push_pending(self.core.me.clone(), content.to_string())
        };
        self.core.publish_view();
        self.stop_typing();

        self.core.deliver(temp_id, content).await
    }

    /// Re-send a failed message.
    pub async fn retry(&self, temp_id: Uuid) -> Result<Message, ChatError> {
        self.core.ensure_sendable()?;
        let content = self
            .core
            .shared()
            .timeline
            .retry(temp_id)
            .ok_or(ChatError::UnknownPending(temp_id))?;
        self.core.publish_view();

        self.core.deliver(temp_id, &content).await
    }

    pub fn discard_failed(&self, temp_id: Uuid) -> Result<(), ChatError> {
        let removed = self.core.shared().timeline.discard(temp_id);
        if !removed {
            return Err(ChatError::UnknownPending(temp_id));
        }
        self.core.publish_view();
        Ok(())
    }

    /// Signal that `me` is composing. Debounced; returns whether a broadcast
    /// went out.
    pub fn set_typing(&self) -> bool {
        if self.state() == SessionState::Closed {
            return false;
        }
        self.core.ctx.presence.set_typing(&self.core.key, &self.core.me)
    }

    pub fn stop_typing(&self) {
        let presence = &self.core.ctx.presence;
        if presence.is_typing(&self.core.key, &self.core.me) {
            presence.clear_typing(&self.core.key, &self.core.me);
        }
    }

    /// Other participants currently typing.
    pub fn typing(&self) -> Vec<IdentityId> {
        self.core.others_typing()
    }

    pub fn is_typing(&self, participant: &IdentityId) -> bool {
        self.core.ctx.presence.is_typing(&self.core.key, participant)
    }

    /// Stop the session: unsubscribe, cancel the background task and drop
    /// local state. Idempotent and safe to call from `Drop`.
    pub fn close(&self) {
        let subscriptions = {
            let mut shared = self.core.shared();
            if shared.state == SessionState::Closed {
                return;
            }
            shared.state = SessionState::Closed;
            shared.timeline.clear();
            shared.notice = None;
            std::mem::take(&mut shared.subscriptions)
        };

        for id in &subscriptions {
            self.core.ctx.bus.unsubscribe(id);
        }
        if let Some(task) = self.task_slot().take() {
            task.abort();
        }
        self.stop_typing();
        self.core.publish_view();

        info!(conversation = %self.core.key, me = %self.core.me, "Chat session closed");
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionCore {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.shared().state == SessionState::Closed
    }

    fn set_state(&self, state: SessionState) {
        {
            let mut shared = self.shared();
            if shared.state == SessionState::Closed || shared.state == state {
                return;
            }
            shared.state = state;
        }
        debug!(conversation = %self.key, ?state, "Session state changed");
        self.publish_view();
    }

    fn set_notice(&self, notice: Option<SessionNotice>) {
        {
            let mut shared = self.shared();
            if shared.notice == notice {
                return;
            }
            shared.notice = notice;
        }
        self.publish_view();
    }

    fn others_typing(&self) -> Vec<IdentityId> {
        let mut typing = self.ctx.presence.typing_in(&self.key);
        typing.retain(|who| who != &self.me);
        typing
    }

    fn publish_view(&self) {
        let view = {
            let shared = self.shared();
            SessionView {
                state: shared.state,
                entries: shared.timeline.entries(),
                typing: if shared.state == SessionState::Closed {
                    Vec::new()
                } else {
                    self.others_typing()
                },
                notice: shared.notice,
            }
        };
        self.view.send_replace(view);
    }

    fn ensure_sendable(&self) -> Result<(), ChatError> {
        match self.shared().state {
            SessionState::Live | SessionState::Reconnecting => Ok(()),
            SessionState::Closed => Err(ChatError::Closed),
            state @ SessionState::Loading => Err(ChatError::NotLive(state)),
        }
    }

    async fn deliver(&self, temp_id: Uuid, content: &str) -> Result<Message, ChatError> {
        let limit = self.ctx.config.append_timeout;
        let outcome = match timeout(limit, self.ctx.store.append(&self.key, &self.me, content)).await
        {
            Ok(result) => result,
            Err(_) => Err(ChatError::Timeout(limit)),
        };

        {
            let mut shared = self.shared();
            if shared.state == SessionState::Closed {
                return outcome;
            }
            match &outcome {
                Ok(message) => shared.timeline.confirm(temp_id, message.clone()),
                Err(_) => shared.timeline.fail(temp_id),
            }
        }
        self.publish_view();

        if let Err(e) = &outcome {
            warn!(conversation = %self.key, %temp_id, error = %e, "Send failed");
        }
        outcome
    }

    /// Subscribe both feeds and register them for `close`. Returns `None`
    /// when the session was closed in the meantime.
    fn subscribe_feeds(&self) -> Result<Option<Feeds>, BusError> {
        let bus = &self.ctx.bus;
        let messages = bus.subscribe(&Topic::Messages(self.key.clone()))?;
        let presence = match bus.subscribe(&Topic::Presence(self.key.clone())) {
            Ok(sub) => sub,
            Err(e) => {
                bus.unsubscribe(&messages.id);
                return Err(e);
            }
        };
        let feeds = Feeds { messages, presence };

        let mut shared = self.shared();
        if shared.state == SessionState::Closed {
            for id in feeds.ids() {
                bus.unsubscribe(&id);
            }
            return Ok(None);
        }
        shared.subscriptions = feeds.ids();
        Ok(Some(feeds))
    }

    fn release_feeds(&self) {
        let ids = std::mem::take(&mut self.shared().subscriptions);
        for id in &ids {
            self.ctx.bus.unsubscribe(id);
        }
    }

    async fn run(self: Arc<Self>, mut feeds: Option<Feeds>) {
        let mut link = self.ctx.bus.watch_link();

        loop {
            if !self.sync().await {
                return;
            }

            if let Some(active) = feeds.take() {
                let epoch = link.borrow_and_update().epoch;
                self.set_state(SessionState::Live);
                info!(conversation = %self.key, "Session live");

                self.pump(active, &mut link, epoch).await;
                self.release_feeds();
            }

            if self.is_closed() {
                return;
            }
            self.set_state(SessionState::Reconnecting);
            warn!(conversation = %self.key, "Realtime link lost, waiting to resubscribe");

            match self.resubscribe(&mut link).await {
                Some(active) => feeds = Some(active),
                None => return,
            }
        }
    }

    async fn resubscribe(&self, link: &mut watch::Receiver<LinkStatus>) -> Option<Feeds> {
        loop {
            while !link.borrow_and_update().connected {
                if link.changed().await.is_err() {
                    return None;
                }
            }
            match self.subscribe_feeds() {
                Ok(feeds) => return feeds,
                Err(e) => debug!(conversation = %self.key, error = %e, "Resubscribe failed"),
            }
        }
    }

    /// Backfill until it succeeds. Returns `false` if the session closed.
    async fn sync(&self) -> bool {
        let cfg = &self.ctx.config;
        let mut backoff = Backoff::new(cfg.retry_initial, cfg.retry_max);

        loop {
            if self.is_closed() {
                return false;
            }
            match self.backfill().await {
                Ok(added) => {
                    debug!(conversation = %self.key, added, "Backfill complete");
                    self.set_notice(None);
                    if added > 0 {
                        self.publish_view();
                    }
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        conversation = %self.key,
                        error = %e,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Backfill failed"
                    );
                    self.set_notice(Some(SessionNotice::SlowNetwork));
                    sleep(delay).await;
                }
            }
        }
    }

    async fn list(&self, since: Option<MessageId>) -> Result<Vec<Message>, ChatError> {
        let limit = self.ctx.config.backfill_timeout;
        timeout(limit, self.ctx.store.list(&self.key, since))
            .await
            .map_err(|_| ChatError::Timeout(limit))?
    }

    async fn backfill(&self) -> Result<usize, ChatError> {
        let since = self.shared().timeline.synced_through();
        let batch = self.list(since).await?;

        let stale = match self.shared().timeline.apply_backfill(since, batch) {
            Ok(added) => return Ok(added),
            Err(ChatError::StaleState(reason)) => reason,
            Err(e) => return Err(e),
        };

        warn!(conversation = %self.key, reason = %stale, "Discarding local history and reloading");
        let full = self.list(None).await?;
        let mut shared = self.shared();
        let before = shared.timeline.len();
        shared.timeline.replace_all(full);
        Ok(shared.timeline.len().saturating_sub(before))
    }

    /// Deliver realtime events until the link drops.
    async fn pump(&self, mut feeds: Feeds, link: &mut watch::Receiver<LinkStatus>, epoch: u64) {
        loop {
            let expiry = self.ctx.presence.next_expiry(&self.key);
            let deadline = expiry.unwrap_or_else(Instant::now);

            tokio::select! {
                frame = feeds.messages.receiver.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => return,
                },
                frame = feeds.presence.receiver.recv() => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => return,
                },
                _ = sleep_until(deadline), if expiry.is_some() => {
                    // A typing signal lapsed.
                    self.ctx.presence.purge_expired();
                    self.publish_view();
                }
                changed = link.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let status = *link.borrow_and_update();
                    if !status.connected || status.epoch != epoch {
                        return;
                    }
                }
            }
        }
    }

    fn on_frame(&self, frame: BusFrame) {
        let event = match frame.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %frame.topic, error = %e, "Dropping undecodable frame");
                return;
            }
        };
        if event.key() != &self.key {
            return;
        }

        match event {
            BusEvent::MessageAppended(message) => {
                let added = {
                    let mut shared = self.shared();
                    shared.state != SessionState::Closed && shared.timeline.merge(message)
                };
                if added {
                    self.publish_view();
                }
            }
            BusEvent::Presence(presence) => {
                if presence.participant == self.me {
                    return;
                }
                self.ctx.presence.observe(&presence);
                self.publish_view();
            }
        }
    }
}
