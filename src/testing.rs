//! In-memory connection for exercising a session without a real transport.
//!
//! Create it with [`MockConnection::channel_pair`] to obtain both the connection to
//! hand to the session and a [`MockRemote`] that drives it: push state updates and
//! inbound messages, observe sent messages, and inject send/reconnect failures.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::{
    ConnectionEvent, ConnectionState, DisconnectReason, InboundMessage, OutboundMessage,
    ResilienceError,
};
use crate::transport::{Connection, ConnectionFuture};

/// Close code reported when the session closes the connection itself.
pub const CLIENT_CLOSE_CODE: u16 = 1000;

struct MockShared {
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    sent_tx: mpsc::UnboundedSender<OutboundMessage>,
    failing_sends: AtomicU32,
    failing_reconnects: AtomicU32,
    reconnects: AtomicU32,
    closes: AtomicU32,
}

fn take_budget(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Connection side of the pair.
#[derive(Clone)]
pub struct MockConnection {
    shared: Arc<MockShared>,
}

impl MockConnection {
    pub fn channel_pair() -> (Self, MockRemote) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            sent_tx,
            failing_sends: AtomicU32::new(0),
            failing_reconnects: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockRemote { shared, sent_rx },
        )
    }
}

impl Connection for MockConnection {
    type Events = MockEvents;

    /// Only the first caller receives events; later streams end immediately.
    fn events(&self) -> Self::Events {
        MockEvents {
            rx: self.shared.events_rx.lock().take(),
        }
    }

    /// Succeeds unless a reconnect failure was injected, and reports `Open` on success.
    fn reconnect(&self) -> ConnectionFuture {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.reconnects.fetch_add(1, Ordering::SeqCst);
            if take_budget(&shared.failing_reconnects) {
                return Err(ResilienceError::ConnectionFailed(
                    "mock reconnect refused".to_string(),
                ));
            }
            let _ = shared
                .events_tx
                .send(ConnectionEvent::Update(ConnectionState::Open));
            Ok(())
        })
    }

    fn send(&self, message: OutboundMessage) -> ConnectionFuture {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            if take_budget(&shared.failing_sends) {
                return Err(ResilienceError::SendFailed("mock send refused".to_string()));
            }
            shared
                .sent_tx
                .send(message)
                .map_err(|_| ResilienceError::SendFailed("mock remote dropped".to_string()))
        })
    }

    fn close(&self) -> ConnectionFuture {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.closes.fetch_add(1, Ordering::SeqCst);
            let _ = shared.events_tx.send(ConnectionEvent::Update(ConnectionState::Close {
                reason: Some(DisconnectReason::new(
                    Some(CLIENT_CLOSE_CODE),
                    "closed by client",
                )),
            }));
            Ok(())
        })
    }
}

/// Event stream returned by [`MockConnection::events`].
pub struct MockEvents {
    rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl Stream for MockEvents {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum MockRemoteError {
    #[error("mock connection event stream is closed")]
    ChannelClosed,
}

/// Remote-side handle paired with [`MockConnection`].
pub struct MockRemote {
    shared: Arc<MockShared>,
    sent_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl MockRemote {
    pub fn push_state(&self, state: ConnectionState) -> Result<(), MockRemoteError> {
        self.push(ConnectionEvent::Update(state))
    }

    pub fn open(&self) -> Result<(), MockRemoteError> {
        self.push_state(ConnectionState::Open)
    }

    pub fn close(&self, code: Option<u16>, reason: &str) -> Result<(), MockRemoteError> {
        self.push_state(ConnectionState::Close {
            reason: Some(DisconnectReason::new(code, reason)),
        })
    }

    pub fn push_message(&self, message: InboundMessage) -> Result<(), MockRemoteError> {
        self.push(ConnectionEvent::Message(message))
    }

    fn push(&self, event: ConnectionEvent) -> Result<(), MockRemoteError> {
        self.shared
            .events_tx
            .send(event)
            .map_err(|_| MockRemoteError::ChannelClosed)
    }

    /// Next message the connection delivered.
    pub async fn recv_sent(&mut self) -> Option<OutboundMessage> {
        self.sent_rx.recv().await
    }

    pub async fn recv_sent_timeout(&mut self, timeout: Duration) -> Option<OutboundMessage> {
        tokio::time::timeout(timeout, self.sent_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.shared.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reconnects fail.
    pub fn fail_next_reconnects(&self, n: u32) {
        self.shared.failing_reconnects.store(n, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> u32 {
        self.shared.reconnects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.shared.closes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn events_are_delivered_once() {
        let (connection, remote) = MockConnection::channel_pair();
        let mut events = connection.events();
        let mut second = connection.events();

        remote.open().expect("open");
        remote
            .push_message(InboundMessage::new("peer", "hi"))
            .expect("push");

        assert_eq!(
            events.next().await,
            Some(ConnectionEvent::Update(ConnectionState::Open))
        );
        assert!(matches!(events.next().await, Some(ConnectionEvent::Message(_))));
        assert_eq!(second.next().await, None);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let (connection, mut remote) = MockConnection::channel_pair();
        remote.fail_next_sends(1);
        remote.fail_next_reconnects(1);

        let msg = OutboundMessage::new("peer", "payload");
        assert!(connection.send(msg.clone()).await.is_err());
        connection.send(msg.clone()).await.expect("second send");
        assert_eq!(remote.recv_sent().await, Some(msg));

        let mut events = connection.events();
        assert!(connection.reconnect().await.is_err());
        connection.reconnect().await.expect("second reconnect");
        assert_eq!(remote.reconnect_count(), 2);
        assert_eq!(
            events.next().await,
            Some(ConnectionEvent::Update(ConnectionState::Open))
        );
    }

    #[tokio::test]
    async fn close_reports_client_close() {
        let (connection, remote) = MockConnection::channel_pair();
        let mut events = connection.events();

        connection.close().await.expect("close");
        assert_eq!(remote.close_count(), 1);
        match events.next().await {
            Some(ConnectionEvent::Update(ConnectionState::Close {
                reason: Some(reason),
            })) => assert_eq!(reason.code, Some(CLIENT_CLOSE_CODE)),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
