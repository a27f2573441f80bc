// Realtime pub/sub layer: per-topic fan-out with bounded subscriber buffers
// and an observable link status.

pub mod bus;
pub mod error;
pub mod topic;

pub use bus::{BusFrame, LinkStatus, RealtimeBus, Subscription, SubscriptionId};
pub use error::BusError;
pub use topic::Topic;
