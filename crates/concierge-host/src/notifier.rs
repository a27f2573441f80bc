use tracing::info;

use concierge_client::Notifier;
use concierge_shared::IdentityId;

/// Out-of-band notifier that only writes to the log. Stands in for push or
/// email delivery.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, identity: &IdentityId, title: &str, message: &str) {
        info!(recipient = %identity, title, message, "Out-of-band notification");
    }
}
