use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::core::{InboundMessage, ResilienceResult};

/// Mutable view of an inbound message threaded through the middleware chain.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareContext {
    pub message: Option<InboundMessage>,
    pub from: Option<String>,
    pub kind: Option<String>,
    pub body: Option<String>,
    pub attributes: BTreeMap<String, String>,
    reached_end: bool,
}

impl MiddlewareContext {
    pub fn from_message(message: InboundMessage) -> Self {
        Self {
            from: Some(message.from.clone()),
            kind: message.kind.clone(),
            body: message.text().map(str::to_owned),
            message: Some(message),
            ..Self::default()
        }
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub(crate) fn begin(&mut self) {
        self.reached_end = false;
    }

    pub(crate) fn reached_end(&self) -> bool {
        self.reached_end
    }
}

/// One link of the inbound processing chain.
///
/// Call `next.run(ctx)` to hand control to the rest of the chain. Returning without
/// calling it stops processing; returning an error aborts the chain with that error.
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ResilienceResult<()>>;
}

/// Continuation over the middleware that have not run yet.
///
/// `run` consumes the continuation, so a middleware hands control onward at most
/// once:
///
/// ```compile_fail
/// use futures_util::future::BoxFuture;
/// use ws_resilience::core::ResilienceResult;
/// use ws_resilience::hooks::{Middleware, MiddlewareContext, Next};
///
/// struct Twice;
///
/// impl Middleware for Twice {
///     fn handle<'a>(
///         &'a self,
///         ctx: &'a mut MiddlewareContext,
///         next: Next<'a>,
///     ) -> BoxFuture<'a, ResilienceResult<()>> {
///         Box::pin(async move {
///             next.run(ctx).await?;
///             next.run(ctx).await
///         })
///     }
/// }
/// ```
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { chain }
    }

    pub fn run<'b>(self, ctx: &'b mut MiddlewareContext) -> BoxFuture<'b, ResilienceResult<()>>
    where
        'a: 'b,
    {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(ctx, Next { chain: rest }),
            None => {
                ctx.reached_end = true;
                Box::pin(async { Ok(()) })
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.chain.len())
            .finish()
    }
}

/// Adapter that lets a plain closure act as [`Middleware`].
pub(crate) struct FnMiddleware<F>(pub(crate) F);

impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut MiddlewareContext, Next<'a>) -> BoxFuture<'a, ResilienceResult<()>>
        + Send
        + Sync
        + 'static,
{
    fn handle<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ResilienceResult<()>> {
        (self.0)(ctx, next)
    }
}
