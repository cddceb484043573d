pub mod agent_id;
pub mod x402;

pub use agent_id::{extract_agent_id, AgentId, ANONYMOUS_AGENT};
pub use x402::{payment_middleware, PaymentGate, PricedRoute};
