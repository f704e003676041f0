//! Session actor composing the resilience components around one [`Connection`].
//!
//! Connection events are pumped into the actor from a task outside kameo; the actor
//! owns the policies and calls back into the connection to send or reconnect.

use std::sync::Arc;

use futures_util::StreamExt;
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::core::{
    ConnectionEvent, ConnectionHealth, ConnectionState, HealthMonitor, InboundMessage,
    OutboundMessage, RateLimiter, ReconnectEvent, ReconnectOutcome, ReconnectScheduler,
    ResilienceError, ResilienceResult, RetryQueue, WorkId,
};
use crate::hooks::{
    HookDispatcher, HookEvent, HooksConfig, MiddlewareContext, MiddlewareOutcome,
};
use crate::transport::Connection;

pub struct SessionArgs<C: Connection> {
    pub connection: C,
    pub config: ResilienceConfig,
    pub hooks: Arc<HookDispatcher>,
}

impl<C: Connection> SessionArgs<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            config: ResilienceConfig::default(),
            hooks: Arc::new(HookDispatcher::new()),
        }
    }

    pub fn with_config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookDispatcher>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_hooks_config(self, config: HooksConfig) -> Self {
        self.with_hooks(Arc::new(HookDispatcher::from_config(config)))
    }
}

/// Event forwarded from the connection's event stream.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connection(ConnectionState),
    Inbound(InboundMessage),
}

impl From<ConnectionEvent> for SessionEvent {
    fn from(event: ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::Update(state) => SessionEvent::Connection(state),
            ConnectionEvent::Message(message) => SessionEvent::Inbound(message),
        }
    }
}

/// Queue `message` for delivery; replies with the queue id.
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub message: OutboundMessage,
    pub priority: i32,
}

impl SendMessage {
    pub fn new(message: OutboundMessage) -> Self {
        Self {
            message,
            priority: crate::core::DEFAULT_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Close the connection. The close that follows does not trigger a reconnect.
#[derive(Debug, Clone, Copy)]
pub struct Disconnect;

#[derive(Debug, Clone, Copy)]
pub struct GetHealth;

#[derive(Debug, Clone, Copy)]
pub struct GetSessionStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: ConnectionState,
    pub health: ConnectionHealth,
    pub queue_len: usize,
    pub queue_processing: bool,
    pub remaining_requests: u32,
    pub reconnect_attempts: u32,
    pub reconnecting: bool,
}

pub struct ResilientSession<C: Connection> {
    connection: C,
    config: ResilienceConfig,
    hooks: Arc<HookDispatcher>,
    limiter: Arc<RateLimiter>,
    queue: RetryQueue,
    reconnect: ReconnectScheduler,
    health: Arc<HealthMonitor>,
    state: ConnectionState,
    // Set while a requested close is outstanding.
    closing: bool,
    pump_task: Option<JoinHandle<()>>,
    reconnect_watch_task: Option<JoinHandle<()>>,
}

impl<C: Connection> Actor for ResilientSession<C> {
    type Args = SessionArgs<C>;
    type Error = ResilienceError;

    fn name() -> &'static str {
        "ResilientSession"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> ResilienceResult<Self> {
        let SessionArgs {
            connection,
            config,
            hooks,
        } = args;

        let health = Arc::new(HealthMonitor::new(config.health));
        health.start();

        let reconnect = ReconnectScheduler::new(config.reconnect);
        let reconnect_watch_task = Some(spawn_reconnect_watch(&reconnect, Arc::clone(&hooks)));

        let mut events = connection.events();
        let pump_ref = actor_ref.clone();
        let pump_task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if pump_ref.tell(SessionEvent::from(event)).send().await.is_err() {
                    break;
                }
            }
            debug!("connection event stream ended");
        }));

        info!(
            auto_reconnect = config.auto_reconnect,
            max_requests = config.rate_limit.max_requests,
            max_queue_size = config.queue.max_queue_size,
            "session started"
        );

        Ok(Self {
            connection,
            config,
            hooks,
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            queue: RetryQueue::new(config.queue),
            reconnect,
            health,
            state: ConnectionState::Connecting,
            closing: false,
            pump_task,
            reconnect_watch_task,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> ResilienceResult<()> {
        for task in [self.pump_task.take(), self.reconnect_watch_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        self.health.stop();
        self.reconnect.cancel();
        let discarded = self.queue.clear();
        info!(?reason, discarded, "session stopped");
        Ok(())
    }
}

/// Fire the error hook whenever the scheduler gives up.
fn spawn_reconnect_watch(
    scheduler: &ReconnectScheduler,
    hooks: Arc<HookDispatcher>,
) -> JoinHandle<()> {
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ReconnectEvent::Exhausted { attempts }) => {
                    hooks
                        .trigger(HookEvent::Error(ResilienceError::ReconnectExhausted {
                            attempts,
                        }))
                        .await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "reconnect event watcher lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

impl<C: Connection> KameoMessage<SessionEvent> for ResilientSession<C> {
    type Reply = ResilienceResult<()>;

    async fn handle(
        &mut self,
        event: SessionEvent,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match event {
            SessionEvent::Connection(state) => self.handle_connection_update(state).await,
            SessionEvent::Inbound(message) => self.handle_inbound(message).await,
        }
        Ok(())
    }
}

impl<C: Connection> KameoMessage<SendMessage> for ResilientSession<C> {
    type Reply = ResilienceResult<WorkId>;

    async fn handle(
        &mut self,
        SendMessage { message, priority }: SendMessage,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let limiter = Arc::clone(&self.limiter);
        let connection = self.connection.clone();
        let health = Arc::clone(&self.health);
        let hooks = Arc::clone(&self.hooks);

        let id = self.queue.add(
            move || {
                let limiter = Arc::clone(&limiter);
                let connection = connection.clone();
                let health = Arc::clone(&health);
                let hooks = Arc::clone(&hooks);
                let message = message.clone();
                async move {
                    limiter.acquire().await;
                    let started = Instant::now();
                    connection.send(message.clone()).await?;
                    health.record_send_latency(started.elapsed());
                    health.on_message_sent();
                    hooks.trigger(HookEvent::MessageSend(message)).await;
                    Ok(())
                }
            },
            priority,
        );
        Ok(id)
    }
}

impl<C: Connection> KameoMessage<Disconnect> for ResilientSession<C> {
    type Reply = ResilienceResult<()>;

    async fn handle(
        &mut self,
        _message: Disconnect,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.closing = true;
        self.reconnect.cancel();
        self.hooks.trigger(HookEvent::BeforeDisconnect).await;
        info!(state = ?self.state, "closing connection");
        if let Err(err) = self.connection.close().await {
            self.closing = false;
            warn!(error = %err, "close failed");
            return Err(err);
        }
        Ok(())
    }
}

impl<C: Connection> KameoMessage<GetHealth> for ResilientSession<C> {
    type Reply = ResilienceResult<ConnectionHealth>;

    async fn handle(
        &mut self,
        _message: GetHealth,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.health())
    }
}

impl<C: Connection> KameoMessage<GetSessionStats> for ResilientSession<C> {
    type Reply = ResilienceResult<SessionStats>;

    async fn handle(
        &mut self,
        _message: GetSessionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(SessionStats {
            state: self.state.clone(),
            health: self.health.health(),
            queue_len: self.queue.len(),
            queue_processing: self.queue.is_processing(),
            remaining_requests: self.limiter.remaining_requests(),
            reconnect_attempts: self.reconnect.attempts(),
            reconnecting: self.reconnect.is_active(),
        })
    }
}

impl<C: Connection> ResilientSession<C> {
    async fn handle_connection_update(&mut self, state: ConnectionState) {
        self.health.on_connection_update(&state);
        self.state = state.clone();

        match state {
            ConnectionState::Connecting => {}
            ConnectionState::Open => {
                self.closing = false;
                self.reconnect.reset();
                self.hooks
                    .trigger(HookEvent::AfterConnect {
                        state: ConnectionState::Open,
                    })
                    .await;
            }
            ConnectionState::Close { reason } => {
                self.hooks
                    .trigger(HookEvent::AfterDisconnect { reason })
                    .await;
                if std::mem::take(&mut self.closing) {
                    debug!("connection closed on request, not reconnecting");
                } else if self.config.auto_reconnect {
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn schedule_reconnect(&self) {
        let connection = self.connection.clone();
        let hooks = Arc::clone(&self.hooks);
        let health = Arc::clone(&self.health);
        let scheduler = self.reconnect.clone();

        let outcome = self.reconnect.schedule_reconnect(move || {
            let connection = connection.clone();
            let hooks = Arc::clone(&hooks);
            let health = Arc::clone(&health);
            let attempt = scheduler.attempts();
            async move {
                health.on_reconnect_attempt();
                hooks.trigger(HookEvent::Reconnect { attempt }).await;
                hooks.trigger(HookEvent::BeforeConnect).await;
                connection.reconnect().await
            }
        });

        match outcome {
            ReconnectOutcome::Scheduled { attempt, delay } => debug!(
                attempt,
                delay_ms = delay.as_millis().min(u64::MAX as u128) as u64,
                "reconnect scheduled after close"
            ),
            ReconnectOutcome::AlreadyInProgress => debug!("reconnect already in progress"),
            // The watcher task reports exhaustion through the error hook.
            ReconnectOutcome::Exhausted { attempts } => debug!(attempts, "reconnect budget spent"),
        }
    }

    async fn handle_inbound(&mut self, message: InboundMessage) {
        self.health.on_message_received();

        let mut ctx = MiddlewareContext::from_message(message.clone());
        match self.hooks.execute_middlewares(&mut ctx).await {
            Ok(MiddlewareOutcome::Completed) => {
                let message = ctx.message.take().unwrap_or(message);
                self.hooks.trigger(HookEvent::MessageReceive(message)).await;
            }
            Ok(MiddlewareOutcome::Halted) => {
                debug!(from = %message.from, "inbound message halted by middleware");
            }
            Err(err) => {
                warn!(from = %message.from, error = %err, "inbound message rejected");
                self.hooks.trigger(HookEvent::Error(err)).await;
            }
        }
    }
}
