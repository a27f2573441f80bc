use std::sync::Arc;

use concierge_bus::RealtimeBus;

use crate::config::ChatConfig;
use crate::presence::PresenceTracker;
use crate::store::MessageStore;

/// Shared handles every session and inbox of one client process runs on.
#[derive(Clone)]
pub struct ChatContext {
    pub store: Arc<dyn MessageStore>,
    pub bus: RealtimeBus,
    pub presence: PresenceTracker,
    pub config: ChatConfig,
}

impl ChatContext {
    pub fn new(store: Arc<dyn MessageStore>, bus: RealtimeBus, config: ChatConfig) -> Self {
        let presence = PresenceTracker::new(bus.clone(), config.typing_ttl, config.typing_debounce);
        Self {
            store,
            bus,
            presence,
            config,
        }
    }
}
