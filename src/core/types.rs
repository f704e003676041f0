use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Convenience result alias for resilience-layer operations.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Canonical error surface shared by every component.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Rejected by middleware: {0}")]
    Rejected(String),

    #[error("Handler failed ({context}): {error}")]
    Handler { context: String, error: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Actor error: {0}")]
    ActorError(String),
}

impl ResilienceError {
    pub(crate) fn from_panic(context: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let error = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        ResilienceError::Handler {
            context: context.to_string(),
            error,
        }
    }
}

/// Structured reason attached to a close transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub code: Option<u16>,
    pub message: String,
}

impl DisconnectReason {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Connection lifecycle state reported by the connection collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close { reason: Option<DisconnectReason> },
}

impl ConnectionState {
    pub fn closed(reason: impl Into<String>) -> Self {
        ConnectionState::Close {
            reason: Some(DisconnectReason::new(None, reason)),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Close { .. })
    }
}

/// Inbound payload as delivered by the connection; never inspected by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: Option<String>,
    pub from: String,
    pub kind: Option<String>,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(from: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            from: from.into(),
            kind: None,
            payload: payload.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Payload as UTF-8 text, when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.as_ref()).ok()
    }
}

/// Addressed outbound payload handed to the transport-send collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            to: to.into(),
            payload: payload.into(),
        }
    }
}

/// Events emitted by the connection collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Update(ConnectionState),
    Message(InboundMessage),
}
