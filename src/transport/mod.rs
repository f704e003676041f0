use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;

use crate::core::{ConnectionEvent, OutboundMessage, ResilienceResult};

/// Boxed future returned by [`Connection`] operations.
pub type ConnectionFuture = Pin<Box<dyn Future<Output = ResilienceResult<()>> + Send>>;

/// Boundary to the underlying messaging connection.
///
/// The session only reacts to the events this yields and calls back into it to send
/// or to reconnect; wire protocol and payload encoding stay on the other side.
pub trait Connection: Clone + Send + Sync + 'static {
    type Events: Stream<Item = ConnectionEvent> + Send + Unpin + 'static;

    /// Stream of state updates and inbound messages. Called once per session.
    fn events(&self) -> Self::Events;

    /// Re-establish the connection. Success is confirmed later by an `Open` update.
    fn reconnect(&self) -> ConnectionFuture;

    fn send(&self, message: OutboundMessage) -> ConnectionFuture;

    /// Close the connection on request. Completion is reported by a `Close` update.
    fn close(&self) -> ConnectionFuture;
}
