pub mod agent;
pub mod endpoint;
pub mod payment;
pub mod pool;
pub mod sequence;

pub use agent::Agent;
pub use endpoint::{default_endpoints, Endpoint};
pub use payment::PaymentClient;
pub use pool::{AgentPool, PoolConfig};
pub use sequence::SequenceCounter;
