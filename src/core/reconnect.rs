use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::{ResilienceError, ResilienceResult};

const EVENT_CAPACITY: usize = 64;
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Reconnect backoff policy.
///
/// `max_retries: None` retries forever.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectConfig {
    pub max_retries: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub exponential_backoff: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: DEFAULT_MULTIPLIER,
            exponential_backoff: true,
        }
    }
}

impl ReconnectConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_exponential_backoff(mut self, enable: bool) -> Self {
        self.exponential_backoff = enable;
        self
    }

    /// Delay applied after `attempts` attempts: `min(initial * multiplier^attempts, max)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if !self.exponential_backoff || self.initial_delay.is_zero() {
            return self.initial_delay;
        }

        // Zero, negative or non-finite multipliers mean "unset".
        let factor = if self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0 {
            self.backoff_multiplier
        } else {
            DEFAULT_MULTIPLIER
        };
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_nanos() as f64 * factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_nanos() as f64);
        if !capped.is_finite() || capped < 0.0 {
            return self.max_delay;
        }
        Duration::from_nanos(capped.round().min(u64::MAX as f64) as u64)
    }

    pub fn allows(&self, attempts: u32) -> bool {
        match self.max_retries {
            None => true,
            Some(max) => attempts < max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Waiting,
    Attempting,
}

/// Immediate result of [`ReconnectScheduler::schedule_reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Scheduled { attempt: u32, delay: Duration },
    AlreadyInProgress,
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    Scheduled { attempt: u32, delay: Duration },
    Attempting { attempt: u32 },
    Succeeded { attempt: u32 },
    Failed { attempt: u32, error: ResilienceError },
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
}

#[derive(Debug)]
struct SchedulerState {
    attempts: u32,
    phase: ReconnectPhase,
    // Bumped by cancel/reset/success so a stale driver task stops touching state.
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    config: ReconnectConfig,
    state: Mutex<SchedulerState>,
    events: broadcast::Sender<ReconnectEvent>,
}

impl Shared {
    fn emit(&self, event: ReconnectEvent) {
        let _ = self.events.send(event);
    }

    /// Move into `Waiting` for the next attempt, or `None` when the budget is spent.
    fn arm(&self, state: &mut SchedulerState) -> Option<(u32, Duration)> {
        if !self.config.allows(state.attempts) {
            state.phase = ReconnectPhase::Idle;
            return None;
        }

        state.attempts = state.attempts.saturating_add(1);
        let delay = self.config.delay_for(state.attempts);
        state.phase = ReconnectPhase::Waiting;

        info!(
            attempt = state.attempts,
            delay_ms = delay.as_millis().min(u64::MAX as u128) as u64,
            "scheduling reconnection"
        );
        self.emit(ReconnectEvent::Scheduled {
            attempt: state.attempts,
            delay,
        });
        Some((state.attempts, delay))
    }

    fn report_exhausted(&self, attempts: u32) {
        error!(
            attempts,
            max_retries = ?self.config.max_retries,
            "max reconnection attempts reached"
        );
        self.emit(ReconnectEvent::Exhausted { attempts });
    }
}

/// Drives reconnection attempts with exponential backoff.
///
/// At most one attempt is in flight. Failures re-arm the timer from the driver
/// task's loop until the attempt budget runs out.
#[derive(Clone, Debug)]
pub struct ReconnectScheduler {
    shared: Arc<Shared>,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SchedulerState {
                    attempts: 0,
                    phase: ReconnectPhase::Idle,
                    epoch: 0,
                    timer: None,
                }),
                events,
            }),
        }
    }

    pub fn should_reconnect(&self) -> bool {
        let attempts = self.shared.state.lock().attempts;
        self.shared.config.allows(attempts)
    }

    pub fn next_delay(&self) -> Duration {
        let attempts = self.shared.state.lock().attempts;
        self.shared.config.delay_for(attempts)
    }

    /// Schedule `reconnect` after the next backoff delay.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule_reconnect<F, Fut>(&self, reconnect: F) -> ReconnectOutcome
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<()>> + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.phase != ReconnectPhase::Idle {
            warn!(attempt = state.attempts, "reconnection already in progress");
            return ReconnectOutcome::AlreadyInProgress;
        }

        let Some((attempt, delay)) = self.shared.arm(&mut state) else {
            let attempts = state.attempts;
            drop(state);
            self.shared.report_exhausted(attempts);
            return ReconnectOutcome::Exhausted { attempts };
        };

        let epoch = state.epoch;
        state.timer = Some(tokio::spawn(Self::drive(
            Arc::clone(&self.shared),
            reconnect,
            epoch,
            delay,
        )));
        ReconnectOutcome::Scheduled { attempt, delay }
    }

    async fn drive<F, Fut>(shared: Arc<Shared>, mut reconnect: F, epoch: u64, first_delay: Duration)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<()>> + Send + 'static,
    {
        let mut delay = first_delay;
        loop {
            tokio::time::sleep(delay).await;

            let attempt = {
                let mut state = shared.state.lock();
                if state.epoch != epoch {
                    return;
                }
                state.phase = ReconnectPhase::Attempting;
                state.attempts
            };

            info!(attempt, "reconnecting now");
            shared.emit(ReconnectEvent::Attempting { attempt });

            let outcome = AssertUnwindSafe(async { reconnect().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ResilienceError::from_panic("reconnect", panic)));

            let next = {
                let mut state = shared.state.lock();
                if state.epoch != epoch {
                    debug!(attempt, "reconnection cancelled while attempting, ignoring outcome");
                    return;
                }

                match outcome {
                    Ok(()) => {
                        state.attempts = 0;
                        state.phase = ReconnectPhase::Idle;
                        state.epoch = state.epoch.wrapping_add(1);
                        state.timer = None;
                        info!(attempt, "reconnected successfully");
                        shared.emit(ReconnectEvent::Succeeded { attempt });
                        return;
                    }
                    Err(err) => {
                        error!(attempt, error = %err, "reconnection failed");
                        shared.emit(ReconnectEvent::Failed {
                            attempt,
                            error: err,
                        });
                        state.phase = ReconnectPhase::Idle;
                        match shared.arm(&mut state) {
                            Some((_, next)) => next,
                            None => {
                                state.timer = None;
                                let attempts = state.attempts;
                                drop(state);
                                shared.report_exhausted(attempts);
                                return;
                            }
                        }
                    }
                }
            };
            delay = next;
        }
    }

    /// Stop any pending timer and clear the in-flight flag; attempts are kept.
    ///
    /// An attempt that already started runs to completion but its outcome is ignored.
    pub fn cancel(&self) {
        let attempts = self.halt(false);
        info!(attempts, "reconnection cancelled");
        self.shared.emit(ReconnectEvent::Cancelled { attempts });
    }

    /// Like [`ReconnectScheduler::cancel`], and zeroes the attempt counter.
    pub fn reset(&self) {
        self.halt(true);
    }

    fn halt(&self, reset_attempts: bool) -> u32 {
        let (timer, phase, attempts) = {
            let mut state = self.shared.state.lock();
            state.epoch = state.epoch.wrapping_add(1);
            let phase = state.phase;
            state.phase = ReconnectPhase::Idle;
            if reset_attempts {
                state.attempts = 0;
            }
            (state.timer.take(), phase, state.attempts)
        };

        if let Some(timer) = timer
            && phase == ReconnectPhase::Waiting
        {
            timer.abort();
        }
        attempts
    }

    pub fn attempts(&self) -> u32 {
        self.shared.state.lock().attempts
    }

    pub fn is_active(&self) -> bool {
        self.phase() != ReconnectPhase::Idle
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.shared.state.lock().phase
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> ReconnectConfig {
        self.shared.config
    }
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn always_failing(
        calls: &Arc<AtomicU32>,
    ) -> impl FnMut() -> futures_util::future::Ready<ResilienceResult<()>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures_util::future::ready(Err(ResilienceError::ConnectionFailed(
                "refused".to_string(),
            )))
        }
    }

    async fn wait_for<P>(events: &mut broadcast::Receiver<ReconnectEvent>, mut predicate: P) -> ReconnectEvent
    where
        P: FnMut(&ReconnectEvent) -> bool,
    {
        loop {
            let event = events.recv().await.expect("scheduler event channel open");
            if predicate(&event) {
                return event;
            }
        }
    }

    #[test]
    fn exponential_delay_is_capped() {
        let config = ReconnectConfig::new(Duration::from_millis(1000), Duration::from_millis(8000), 2.0);
        let delays: Vec<Duration> = (0..5).map(|n| config.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(8000),
                Duration::from_millis(8000),
            ]
        );
        assert_eq!(config.delay_for(u32::MAX), Duration::from_millis(8000));
    }

    #[test]
    fn constant_delay_when_backoff_disabled() {
        let config = ReconnectConfig::default().with_exponential_backoff(false);
        for n in [0, 1, 5, 50] {
            assert_eq!(config.delay_for(n), Duration::from_secs(1));
        }
    }

    #[test]
    fn invalid_multiplier_falls_back_to_default() {
        let config = ReconnectConfig::new(Duration::from_millis(100), Duration::from_secs(10), f64::NAN);
        assert_eq!(config.delay_for(2), Duration::from_millis(400));

        let zero = ReconnectConfig::new(Duration::from_millis(100), Duration::from_secs(10), 0.0);
        assert_eq!(zero.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn fractional_multiplier_is_kept() {
        let config = ReconnectConfig::new(Duration::from_millis(1000), Duration::from_secs(10), 0.5);
        let delays: Vec<Duration> = (0..3).map(|n| config.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(500),
                Duration::from_millis(250),
            ]
        );

        let gentle = ReconnectConfig::new(Duration::from_millis(1000), Duration::from_secs(10), 1.5);
        assert_eq!(gentle.delay_for(2), Duration::from_millis(2250));
    }

    #[test]
    fn fresh_scheduler_uses_initial_delay() {
        let scheduler = ReconnectScheduler::default();
        assert_eq!(scheduler.attempts(), 0);
        assert_eq!(scheduler.next_delay(), Duration::from_secs(1));
        assert!(scheduler.should_reconnect());
        assert!(!scheduler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_until_success_then_resets() {
        let scheduler = ReconnectScheduler::default();
        let mut events = scheduler.subscribe();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let start = Instant::now();

        let outcome = scheduler.schedule_reconnect(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call < 3 {
                    Err(ResilienceError::ConnectionFailed("refused".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        assert_eq!(
            outcome,
            ReconnectOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert!(scheduler.is_active());
        assert_eq!(
            scheduler.schedule_reconnect(|| async { Ok(()) }),
            ReconnectOutcome::AlreadyInProgress
        );

        let done = wait_for(&mut events, |e| matches!(e, ReconnectEvent::Succeeded { .. })).await;
        assert!(matches!(done, ReconnectEvent::Succeeded { attempt: 3 }));
        assert_eq!(start.elapsed(), Duration::from_secs(2 + 4 + 8));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.attempts(), 0);
        assert!(!scheduler.is_active());
        assert_eq!(scheduler.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn finite_budget_reports_exhaustion() {
        let scheduler =
            ReconnectScheduler::new(ReconnectConfig::default().with_max_retries(Some(2)));
        let mut events = scheduler.subscribe();
        let calls = Arc::new(AtomicU32::new(0));

        assert!(matches!(
            scheduler.schedule_reconnect(always_failing(&calls)),
            ReconnectOutcome::Scheduled { attempt: 1, .. }
        ));

        let exhausted = wait_for(&mut events, |e| matches!(e, ReconnectEvent::Exhausted { .. })).await;
        assert!(matches!(exhausted, ReconnectEvent::Exhausted { attempts: 2 }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.attempts(), 2);
        assert!(!scheduler.is_active());
        assert!(!scheduler.should_reconnect());

        assert_eq!(
            scheduler.schedule_reconnect(always_failing(&calls)),
            ReconnectOutcome::Exhausted { attempts: 2 }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_pending_timer_and_keeps_attempts() {
        let scheduler = ReconnectScheduler::default();
        let calls = Arc::new(AtomicU32::new(0));

        scheduler.schedule_reconnect(always_failing(&calls));
        tokio::time::sleep(Duration::from_millis(500)).await;
        scheduler.cancel();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.attempts(), 1);
        assert!(!scheduler.is_active());

        scheduler.reset();
        assert_eq!(scheduler.attempts(), 0);
        assert_eq!(scheduler.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_attempt_ignores_its_outcome() {
        let scheduler = ReconnectScheduler::default();
        let mut events = scheduler.subscribe();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        scheduler.schedule_reconnect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Err(ResilienceError::ConnectionFailed("slow failure".to_string()))
            }
        });

        wait_for(&mut events, |e| matches!(e, ReconnectEvent::Attempting { .. })).await;
        assert_eq!(scheduler.phase(), ReconnectPhase::Attempting);
        scheduler.cancel();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.attempts(), 1);
        assert!(!scheduler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_attempt_counts_as_failure() {
        let scheduler =
            ReconnectScheduler::new(ReconnectConfig::default().with_max_retries(Some(1)));
        let mut events = scheduler.subscribe();

        scheduler.schedule_reconnect(|| -> futures_util::future::Ready<ResilienceResult<()>> {
            panic!("transport exploded")
        });

        let failed = wait_for(&mut events, |e| matches!(e, ReconnectEvent::Failed { .. })).await;
        assert!(matches!(
            failed,
            ReconnectEvent::Failed {
                error: ResilienceError::Handler { .. },
                ..
            }
        ));
        wait_for(&mut events, |e| matches!(e, ReconnectEvent::Exhausted { .. })).await;
    }
}
