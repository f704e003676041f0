//! Connection resilience: rate limiting, retry queueing, reconnect backoff, health
//! tracking and hooks, composed by a kameo session actor.

pub mod config;
pub mod core;
pub mod hooks;
pub mod media;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::ResilienceConfig;
pub use hooks::{
    HookDispatcher, HookEvent, HookKind, HooksConfig, Middleware, MiddlewareContext, Next,
};
pub use media::{MediaTransfer, TransferOptions};
pub use session::{
    Disconnect, GetHealth, GetSessionStats, ResilientSession, SendMessage, SessionArgs,
};
pub use transport::Connection;
