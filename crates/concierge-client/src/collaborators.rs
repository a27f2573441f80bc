//! Interfaces the messaging core needs from the surrounding portal.

use concierge_shared::{Identity, IdentityId};

use crate::error::ChatError;

/// Session/identity management. Decides participant ids and whether the
/// staff inbox applies.
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Result<Identity, ChatError>;
}

/// Fire-and-forget out-of-band notification (push, email, ...).
///
/// Called by the business workflows around the messaging core (e.g. "quote
/// ready"), never by the core itself. Implementations must not block and
/// must swallow their own delivery failures.
pub trait Notifier: Send + Sync {
    fn notify(&self, identity: &IdentityId, title: &str, message: &str);
}

/// Identity provider for a fixed, already-authenticated identity.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub Identity);

impl IdentityProvider for StaticIdentity {
    fn current_identity(&self) -> Result<Identity, ChatError> {
        Ok(self.0.clone())
    }
}
