//! Lifecycle hooks and the inbound middleware chain.
//!
//! Hook handlers observe events and can never fail the caller: errors and panics
//! are logged and the next handler still runs. Middleware is different: an error
//! aborts the chain and propagates to whoever executed it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::core::{
    ConnectionState, DisconnectReason, InboundMessage, OutboundMessage, ResilienceError,
    ResilienceResult,
};

pub mod middleware;

pub use middleware::{Middleware, MiddlewareContext, Next};

use middleware::FnMiddleware;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookKind {
    BeforeConnect,
    AfterConnect,
    BeforeDisconnect,
    AfterDisconnect,
    MessageReceive,
    MessageSend,
    Error,
    Reconnect,
}

impl HookKind {
    pub const ALL: [HookKind; 8] = [
        HookKind::BeforeConnect,
        HookKind::AfterConnect,
        HookKind::BeforeDisconnect,
        HookKind::AfterDisconnect,
        HookKind::MessageReceive,
        HookKind::MessageSend,
        HookKind::Error,
        HookKind::Reconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::BeforeConnect => "before:connect",
            HookKind::AfterConnect => "after:connect",
            HookKind::BeforeDisconnect => "before:disconnect",
            HookKind::AfterDisconnect => "after:disconnect",
            HookKind::MessageReceive => "message:receive",
            HookKind::MessageSend => "message:send",
            HookKind::Error => "error",
            HookKind::Reconnect => "reconnect",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to hook handlers.
#[derive(Debug, Clone)]
pub enum HookEvent {
    BeforeConnect,
    AfterConnect { state: ConnectionState },
    BeforeDisconnect,
    AfterDisconnect { reason: Option<DisconnectReason> },
    MessageReceive(InboundMessage),
    MessageSend(OutboundMessage),
    Error(ResilienceError),
    Reconnect { attempt: u32 },
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            HookEvent::BeforeConnect => HookKind::BeforeConnect,
            HookEvent::AfterConnect { .. } => HookKind::AfterConnect,
            HookEvent::BeforeDisconnect => HookKind::BeforeDisconnect,
            HookEvent::AfterDisconnect { .. } => HookKind::AfterDisconnect,
            HookEvent::MessageReceive(_) => HookKind::MessageReceive,
            HookEvent::MessageSend(_) => HookKind::MessageSend,
            HookEvent::Error(_) => HookKind::Error,
            HookEvent::Reconnect { .. } => HookKind::Reconnect,
        }
    }
}

/// Handle returned by [`HookDispatcher::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// How far an inbound message got through the middleware chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareOutcome {
    Completed,
    /// Some middleware returned without calling `next`.
    Halted,
}

pub type HookFuture = BoxFuture<'static, ResilienceResult<()>>;

type HookHandler = Arc<dyn Fn(HookEvent) -> HookFuture + Send + Sync>;

fn boxed_handler<F, Fut>(handler: F) -> HookHandler
where
    F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ResilienceResult<()>> + Send + 'static,
{
    Arc::new(move |event| -> HookFuture { Box::pin(handler(event)) })
}

/// Handlers registered up front when a dispatcher is built with
/// [`HookDispatcher::from_config`].
#[derive(Default)]
pub struct HooksConfig {
    handlers: Vec<(HookKind, HookHandler)>,
}

impl HooksConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook<F, Fut>(mut self, kind: HookKind, handler: F) -> Self
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<()>> + Send + 'static,
    {
        self.handlers.push((kind, boxed_handler(handler)));
        self
    }
}

impl fmt::Debug for HooksConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.handlers.iter().map(|(kind, _)| kind.as_str()).collect();
        f.debug_struct("HooksConfig").field("hooks", &kinds).finish()
    }
}

pub struct HookDispatcher {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<HookKind, Vec<(HookId, HookHandler)>>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: HooksConfig) -> Self {
        let dispatcher = Self::new();
        for (kind, handler) in config.handlers {
            dispatcher.register(kind, handler);
        }
        dispatcher
    }

    /// Register `handler` for `kind`. Handlers run in registration order.
    pub fn on<F, Fut>(&self, kind: HookKind, handler: F) -> HookId
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResilienceResult<()>> + Send + 'static,
    {
        self.register(kind, boxed_handler(handler))
    }

    fn register(&self, kind: HookKind, handler: HookHandler) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Returns `false` when it was not registered under `kind`.
    pub fn off(&self, kind: HookKind, id: HookId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Run every handler registered for the event's kind, one after another.
    pub async fn trigger(&self, event: HookEvent) {
        let kind = event.kind();
        let handlers: Vec<HookHandler> = match self.handlers.read().get(&kind) {
            Some(list) => list.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
            None => return,
        };

        debug!(hook = kind.as_str(), handlers = handlers.len(), "triggering hook");

        for handler in handlers {
            let outcome = AssertUnwindSafe(async { handler(event.clone()).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ResilienceError::from_panic(kind.as_str(), panic)));
            if let Err(err) = outcome {
                error!(hook = kind.as_str(), error = %err, "hook handler failed");
            }
        }
    }

    pub fn use_middleware<M: Middleware>(&self, middleware: M) {
        self.middleware.write().push(Arc::new(middleware));
    }

    /// Register a closure as middleware.
    ///
    /// ```ignore
    /// hooks.use_fn(|ctx, next| Box::pin(async move {
    ///     ctx.set_attribute("seen", "yes");
    ///     next.run(ctx).await
    /// }));
    /// ```
    pub fn use_fn<F>(&self, middleware: F)
    where
        F: for<'a> Fn(&'a mut MiddlewareContext, Next<'a>) -> BoxFuture<'a, ResilienceResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.use_middleware(FnMiddleware(middleware));
    }

    /// Run the middleware chain over `ctx`.
    ///
    /// An empty chain completes immediately. A failing or panicking middleware aborts
    /// the rest of the chain and its error is returned.
    pub async fn execute_middlewares(
        &self,
        ctx: &mut MiddlewareContext,
    ) -> ResilienceResult<MiddlewareOutcome> {
        let chain: Vec<Arc<dyn Middleware>> = self.middleware.read().clone();
        ctx.begin();

        let result = AssertUnwindSafe(Next::new(&chain).run(ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ResilienceError::from_panic("middleware", panic)));

        match result {
            Ok(()) if ctx.reached_end() => Ok(MiddlewareOutcome::Completed),
            Ok(()) => Ok(MiddlewareOutcome::Halted),
            Err(err) => {
                error!(error = %err, "middleware chain failed");
                Err(err)
            }
        }
    }

    /// Drop every hook handler and middleware.
    pub fn clear(&self) {
        self.handlers.write().clear();
        self.middleware.write().clear();
    }

    /// Handlers registered for `kind`, or across all kinds when `None`.
    pub fn hook_count(&self, kind: Option<HookKind>) -> usize {
        let handlers = self.handlers.read();
        match kind {
            Some(kind) => handlers.get(&kind).map_or(0, Vec::len),
            None => handlers.values().map(Vec::len).sum(),
        }
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.read().len()
    }
}

impl Default for HookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("hooks", &self.hook_count(None))
            .field("middleware", &self.middleware_count())
            .finish()
    }
}
