pub mod health;
pub mod rate_limit;
pub mod reconnect;
pub mod retry_queue;
pub mod types;

pub use health::*;
pub use rate_limit::*;
pub use reconnect::*;
pub use retry_queue::*;
pub use types::*;
