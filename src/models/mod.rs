pub mod event;
pub mod metrics;
pub mod payment;
pub mod response;

pub use event::*;
pub use metrics::*;
pub use payment::*;
pub use response::*;
