//! Scripted portal flow: a customer asks about a sourcing request, staff
//! answer from the inbox, the business workflow sends a "quote ready"
//! notification, and the customer follows up in the general thread.

use std::time::Duration;

use anyhow::Context;
use tokio::time::timeout;
use tracing::info;

use concierge_client::{
    ChatContext, ChatSession, IdentityProvider, InboxAggregator, InboxHandle, Notifier,
    SessionState, StaticIdentity,
};
use concierge_shared::ConversationKey;

use crate::config::HostConfig;

const STEP_TIMEOUT: Duration = Duration::from_secs(15);

async fn live(session: &ChatSession) -> anyhow::Result<()> {
    timeout(STEP_TIMEOUT, session.wait_for_state(SessionState::Live))
        .await
        .context("Timed out waiting for the session to go live")??;
    Ok(())
}

/// Run the flow and hand back the agent's inbox, still running.
pub async fn run(
    ctx: &ChatContext,
    config: &HostConfig,
    notifier: &dyn Notifier,
) -> anyhow::Result<InboxHandle> {
    let customer = StaticIdentity(config.customer.clone()).current_identity()?;
    let agent = StaticIdentity(config.agent.clone());

    let inbox = InboxAggregator::start_for(ctx.clone(), &agent).await?;
    let agent = agent.current_identity()?;

    // Customer side: the thread tied to the sourcing request.
    let key = ConversationKey::scoped(config.scope.clone(), customer.id.clone(), agent.id.clone())?;
    let customer_session = ChatSession::open(ctx.clone(), customer.id.clone(), key.clone())?;
    live(&customer_session).await?;
    customer_session.set_typing();
    customer_session
        .send("Hi! Could you quote 500 units of the blue variant?")
        .await?;

    // Staff side: pick the thread from the inbox.
    let mut rows = inbox.watch();
    timeout(STEP_TIMEOUT, rows.wait_for(|rows| rows.iter().any(|s| s.key == key)))
        .await
        .context("Timed out waiting for the inbox")??;
    let summary = inbox
        .summaries()
        .into_iter()
        .find(|s| s.key == key)
        .context("Conversation missing from the inbox")?;
    info!(
        from = %summary.other_participant,
        unread = summary.unread,
        "Agent picked conversation from inbox"
    );

    let agent_session = inbox.open_session(&summary)?;
    live(&agent_session).await?;
    agent_session.set_typing();
    agent_session
        .send(&format!("Thanks {}, checking with the supplier now.", customer.display_name))
        .await?;
    agent_session
        .send("Your quote is ready: 500 units at $4.20 each, 3 weeks lead time.")
        .await?;

    // The business workflow, not the messaging core, notifies the customer.
    notifier.notify(
        &customer.id,
        "Quote ready",
        &format!("Your quote for {} is ready to review.", config.scope),
    );

    let mut view = customer_session.watch();
    timeout(STEP_TIMEOUT, view.wait_for(|v| v.entries.len() >= 3))
        .await
        .context("Timed out waiting for the replies")??;
    for message in customer_session.messages() {
        info!(id = %message.id, sender = %message.sender_id, content = %message.content, "Scoped thread");
    }

    // Follow-up outside the request, in the standing thread.
    let general = ConversationKey::general(customer.id.clone(), agent.id.clone())?;
    let general_session = ChatSession::open(ctx.clone(), customer.id.clone(), general)?;
    live(&general_session).await?;
    general_session.send("Unrelated: do you ship to Canada?").await?;

    customer_session.close();
    agent_session.close();
    general_session.close();

    inbox.refresh_now().await?;
    Ok(inbox)
}
