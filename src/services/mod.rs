pub mod clock;
pub mod events;
pub mod facilitator;
pub mod ledger;
pub mod metrics;
pub mod replay;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::EventBus;
pub use facilitator::Facilitator;
pub use ledger::{EthersLedger, InMemoryLedger, LedgerClient};
pub use metrics::{MetricsAggregator, MetricsCollector};
pub use replay::ReplayGuard;
pub use store::{MemoryReplayStore, RedisReplayStore, ReplayStore};
