use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use concierge_bus::BusError;
use concierge_shared::ValidationError;
use concierge_store::StoreError;

use crate::session::SessionState;

/// Failures surfaced by the messaging core.
///
/// `Validation` is never retried. `TransientIo`, `Timeout` and `StaleState`
/// are retried automatically on read paths and surfaced with a retry
/// affordance on sends.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Connectivity error: {0}")]
    TransientIo(String),

    #[error("Taking longer than expected (gave up after {0:?})")]
    Timeout(Duration),

    #[error("Local state out of sync with the store: {0}")]
    StaleState(String),

    #[error("Session is closed")]
    Closed,

    #[error("Session is not live yet (state: {0:?})")]
    NotLive(SessionState),

    #[error("The inbox is only available to agents and admins")]
    NotStaff,

    #[error("Identity unavailable: {0}")]
    Identity(String),

    #[error("No pending message with temporary id {0}")]
    UnknownPending(Uuid),
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::TransientIo(_) | ChatError::Timeout(_) | ChatError::StaleState(_)
        )
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(v) => ChatError::Validation(v),
            other => ChatError::TransientIo(other.to_string()),
        }
    }
}

impl From<BusError> for ChatError {
    fn from(e: BusError) -> Self {
        ChatError::TransientIo(e.to_string())
    }
}
