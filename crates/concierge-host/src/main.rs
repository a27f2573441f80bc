//! # concierge-host
//!
//! Demo host for the portal messaging core.
//!
//! This binary:
//! - opens the SQLite message log
//! - wires the realtime bus, the message store and typing presence into a
//!   shared client context
//! - runs a scripted customer/staff exchange, including an out-of-band
//!   "quote ready" notification
//! - keeps the staff inbox running and logs every change until Ctrl+C

mod config;
mod notifier;
mod portal;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use concierge_bus::RealtimeBus;
use concierge_client::{ChatContext, SqliteMessageStore};
use concierge_shared::constants::APP_NAME;
use concierge_store::Database;

use crate::config::HostConfig;
use crate::notifier::LogNotifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,concierge_client=debug,concierge_store=info")
        }))
        .init();

    info!("Starting {} host v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = HostConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), "Message log opened");

    let bus = RealtimeBus::with_buffer(config.chat.bus_buffer);
    let store = SqliteMessageStore::new(db, bus.clone());
    let ctx = ChatContext::new(Arc::new(store), bus, config.chat.clone());
    let notifier = LogNotifier;

    // -----------------------------------------------------------------------
    // 4. Run the scripted portal flow
    // -----------------------------------------------------------------------
    let inbox = portal::run(&ctx, &config, &notifier).await?;
    info!(
        "Inbox for {}:\n{}",
        inbox.identity().display_name,
        serde_json::to_string_pretty(&inbox.summaries())?
    );

    // -----------------------------------------------------------------------
    // 5. Keep the inbox live until shutdown
    // -----------------------------------------------------------------------
    let mut updates = inbox.watch();
    info!("Inbox running, press Ctrl+C to exit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let unread = updates.borrow().iter().filter(|s| s.unread).count();
                info!(unread, "Inbox updated");
            }
        }
    }

    inbox.stop();
    info!("Concierge host shut down");
    Ok(())
}
