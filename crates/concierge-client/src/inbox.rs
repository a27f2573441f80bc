//! Staff inbox: a ranked list of everyone a staff identity talks to.
//!
//! The store listing is the only source of truth. Inbox events on the bus
//! merely trigger a re-fetch, and a fixed-interval poll re-fetches anyway
//! in case events were lost.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use concierge_bus::{BusError, BusFrame, Subscription, SubscriptionId, Topic};
use concierge_shared::{ConversationSummary, Identity, IdentityId};
use concierge_store::ConversationRow;

use crate::collaborators::IdentityProvider;
use crate::context::ChatContext;
use crate::error::ChatError;
use crate::session::ChatSession;

/// Collapse store rows into one summary per other participant, keeping the
/// most recent thread, ranked by latest activity.
pub(crate) fn collapse(me: &IdentityId, rows: Vec<ConversationRow>) -> Vec<ConversationSummary> {
    let mut summaries: Vec<ConversationSummary> = Vec::new();
    for row in rows {
        match summaries
            .iter_mut()
            .find(|s| s.other_participant == row.other)
        {
            Some(existing) => {
                if Some(row.last_message.order_key()) > existing.last_activity() {
                    *existing =
                        ConversationSummary::derive(me, row.other, row.key, Some(row.last_message));
                }
            }
            None => summaries.push(ConversationSummary::derive(
                me,
                row.other,
                row.key,
                Some(row.last_message),
            )),
        }
    }
    summaries.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
    summaries
}

struct Feed {
    subscription: Option<SubscriptionId>,
    stopped: bool,
}

pub struct InboxAggregator {
    ctx: ChatContext,
    me: Identity,
    summaries: watch::Sender<Vec<ConversationSummary>>,
    feed: Mutex<Feed>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl InboxAggregator {
    /// Populate the inbox for `identity` and keep it fresh until the
    /// returned handle is stopped or dropped.
    pub async fn start(ctx: ChatContext, identity: &Identity) -> Result<InboxHandle, ChatError> {
        if !identity.role.is_staff() {
            return Err(ChatError::NotStaff);
        }

        let (summaries, _) = watch::channel(Vec::new());
        let inner = Arc::new(Self {
            ctx,
            me: identity.clone(),
            summaries,
            feed: Mutex::new(Feed {
                subscription: None,
                stopped: false,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
        });

        // Subscribe first so nothing appended during the initial listing is
        // missed.
        let feed = match inner.subscribe_feed() {
            Ok(feed) => feed,
            Err(e) => {
                debug!(identity = %identity.id, error = %e, "Starting inbox without a realtime link");
                None
            }
        };
        inner.refresh().await;

        info!(identity = %identity.id, "Inbox started");
        let task = tokio::spawn(inner.clone().run(feed));

        Ok(InboxHandle {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// Start the inbox for whoever the identity provider reports.
    pub async fn start_for(
        ctx: ChatContext,
        identities: &dyn IdentityProvider,
    ) -> Result<InboxHandle, ChatError> {
        let identity = identities.current_identity()?;
        Self::start(ctx, &identity).await
    }

    fn feed(&self) -> MutexGuard<'_, Feed> {
        self.feed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribe_feed(&self) -> Result<Option<Subscription>, BusError> {
        let subscription = self.ctx.bus.subscribe(&Topic::Inbox(self.me.id.clone()))?;
        let mut feed = self.feed();
        if feed.stopped {
            self.ctx.bus.unsubscribe(&subscription.id);
            return Ok(None);
        }
        feed.subscription = Some(subscription.id);
        Ok(Some(subscription))
    }

    fn release_feed(&self) {
        if let Some(id) = self.feed().subscription.take() {
            self.ctx.bus.unsubscribe(&id);
        }
    }

    async fn try_refresh(&self) -> Result<usize, ChatError> {
        let _serialized = self.refresh_lock.lock().await;

        let limit = self.ctx.config.backfill_timeout;
        let rows = timeout(limit, self.ctx.store.list_conversations_involving(&self.me.id))
            .await
            .map_err(|_| ChatError::Timeout(limit))??;

        let fresh = collapse(&self.me.id, rows);
        let count = fresh.len();
        self.summaries.send_if_modified(|current| {
            if *current == fresh {
                return false;
            }
            *current = fresh;
            true
        });
        Ok(count)
    }

    // Background refreshes are cosmetic: failures keep the previous list.
    async fn refresh(&self) {
        match self.try_refresh().await {
            Ok(count) => debug!(identity = %self.me.id, conversations = count, "Inbox refreshed"),
            Err(e) => warn!(identity = %self.me.id, error = %e, "Inbox refresh failed"),
        }
    }

    async fn run(self: Arc<Self>, mut feed: Option<Subscription>) {
        let poll = self.ctx.config.inbox_poll_interval;
        let mut ticker = interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut link = self.ctx.bus.watch_link();
        let mut epoch = link.borrow_and_update().epoch;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                frame = next_frame(&mut feed) => match frame {
                    Some(_) => {
                        // One re-fetch covers every event queued so far.
                        if let Some(sub) = feed.as_mut() {
                            while sub.receiver.try_recv().is_ok() {}
                        }
                        self.refresh().await;
                    }
                    None => {
                        debug!(identity = %self.me.id, "Inbox feed ended");
                        self.release_feed();
                        feed = None;
                    }
                },
                changed = link.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let status = *link.borrow_and_update();
                    if status.connected && (feed.is_none() || status.epoch != epoch) {
                        epoch = status.epoch;
                        self.release_feed();
                        feed = match self.subscribe_feed() {
                            Ok(feed) => feed,
                            Err(e) => {
                                debug!(identity = %self.me.id, error = %e, "Inbox resubscribe failed");
                                None
                            }
                        };
                        self.refresh().await;
                    }
                }
            }
        }
    }
}

async fn next_frame(feed: &mut Option<Subscription>) -> Option<BusFrame> {
    match feed {
        Some(sub) => sub.receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// Owner of a running inbox. Dropping it stops the inbox.
pub struct InboxHandle {
    inner: Arc<InboxAggregator>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InboxHandle {
    pub fn identity(&self) -> &Identity {
        &self.inner.me
    }

    /// Current summaries, most recent activity first.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.inner.summaries.borrow().clone()
    }

    pub fn unread_count(&self) -> usize {
        self.inner.summaries.borrow().iter().filter(|s| s.unread).count()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.inner.summaries.subscribe()
    }

    /// Re-fetch now. Unlike background refreshes, failures are returned.
    pub async fn refresh_now(&self) -> Result<usize, ChatError> {
        self.inner.try_refresh().await
    }

    /// Open the thread behind an inbox row.
    pub fn open_session(&self, summary: &ConversationSummary) -> Result<ChatSession, ChatError> {
        ChatSession::open(
            self.inner.ctx.clone(),
            self.inner.me.id.clone(),
            summary.key.clone(),
        )
    }

    /// Unsubscribe and cancel the background task. Idempotent.
    pub fn stop(&self) {
        {
            let mut feed = self.inner.feed();
            if feed.stopped {
                return;
            }
            feed.stopped = true;
        }
        self.inner.release_feed();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        info!(identity = %self.inner.me.id, "Inbox stopped");
    }
}

impl Drop for InboxHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
