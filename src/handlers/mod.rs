pub mod dashboard;
pub mod health;
pub mod stats;
pub mod transform;

pub use dashboard::*;
pub use health::*;
pub use stats::*;
pub use transform::{echo, hash, reverse, uppercase, Transform};
