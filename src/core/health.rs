use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::types::ConnectionState;

const LATENCY_MAX_US: u64 = 60_000_000;
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unstable,
    Critical,
}

impl HealthStatus {
    pub fn from_disconnections(disconnections: u32, max_disconnections: u32) -> Self {
        if disconnections == 0 {
            HealthStatus::Healthy
        } else if disconnections < max_disconnections {
            HealthStatus::Unstable
        } else {
            HealthStatus::Critical
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unstable => "unstable",
            HealthStatus::Critical => "critical",
        })
    }
}

/// Point-in-time health snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub status: HealthStatus,
    pub uptime: Duration,
    pub disconnections: u32,
    pub last_disconnect: Option<SystemTime>,
    pub reconnect_attempts: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_latency_p50_us: u64,
    pub send_latency_p99_us: u64,
    pub latency_samples: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct HealthMonitorConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    pub max_disconnections: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(60),
            max_disconnections: 5,
        }
    }
}

impl HealthMonitorConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn with_max_disconnections(mut self, max_disconnections: u32) -> Self {
        self.max_disconnections = max_disconnections;
        self
    }
}

#[derive(Debug)]
struct Counters {
    started: Instant,
    disconnections: u32,
    last_disconnect: Option<SystemTime>,
    reconnect_attempts: u32,
    messages_sent: u64,
    messages_received: u64,
    send_latency: Histogram<u64>,
}

impl Counters {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            disconnections: 0,
            last_disconnect: None,
            reconnect_attempts: 0,
            messages_sent: 0,
            messages_received: 0,
            send_latency: Histogram::new_with_bounds(1, LATENCY_MAX_US, 3)
                .expect("histogram bounds are valid"),
        }
    }

    fn snapshot(&self, max_disconnections: u32) -> ConnectionHealth {
        let latency_samples = self.send_latency.len();
        let (p50, p99) = if latency_samples == 0 {
            (0, 0)
        } else {
            (
                self.send_latency.value_at_percentile(50.0),
                self.send_latency.value_at_percentile(99.0),
            )
        };

        ConnectionHealth {
            status: HealthStatus::from_disconnections(self.disconnections, max_disconnections),
            uptime: self.started.elapsed(),
            disconnections: self.disconnections,
            last_disconnect: self.last_disconnect,
            reconnect_attempts: self.reconnect_attempts,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            send_latency_p50_us: p50,
            send_latency_p99_us: p99,
            latency_samples,
        }
    }
}

#[derive(Debug)]
struct Inner {
    config: HealthMonitorConfig,
    counters: Mutex<Counters>,
    published: watch::Sender<ConnectionHealth>,
}

impl Inner {
    fn snapshot(&self) -> ConnectionHealth {
        self.counters.lock().snapshot(self.config.max_disconnections)
    }

    fn check(&self) {
        let health = self.snapshot();
        let uptime_secs = health.uptime.as_secs();
        match health.status {
            HealthStatus::Healthy => info!(
                uptime_secs,
                messages_sent = health.messages_sent,
                messages_received = health.messages_received,
                "connection healthy"
            ),
            HealthStatus::Unstable => warn!(
                uptime_secs,
                disconnections = health.disconnections,
                "connection unstable"
            ),
            HealthStatus::Critical => error!(
                uptime_secs,
                disconnections = health.disconnections,
                reconnect_attempts = health.reconnect_attempts,
                "connection critical"
            ),
        }
        self.published.send_replace(health);
    }
}

/// Connection health tracker with an optional periodic status check.
#[derive(Debug)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        let counters = Counters::new();
        let (published, _) = watch::channel(counters.snapshot(config.max_disconnections));
        Self {
            inner: Arc::new(Inner {
                config,
                counters: Mutex::new(counters),
                published,
            }),
            checker: Mutex::new(None),
        }
    }

    /// Spawn the periodic check. Returns `false` when monitoring is disabled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let config = self.inner.config;
        if !config.enabled {
            debug!("health monitoring disabled");
            return false;
        }

        let mut checker = self.checker.lock();
        if checker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return true;
        }

        let period = config.check_interval.max(MIN_CHECK_INTERVAL);
        let inner = Arc::clone(&self.inner);
        *checker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.check();
            }
        }));

        info!(
            interval_ms = period.as_millis().min(u64::MAX as u128) as u64,
            "health monitoring started"
        );
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = self.checker.lock().take() {
            handle.abort();
            debug!("health monitoring stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.checker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn on_connection_update(&self, state: &ConnectionState) {
        match state {
            ConnectionState::Open => info!("connection established"),
            ConnectionState::Connecting => debug!("connecting"),
            ConnectionState::Close { reason } => {
                let disconnections = {
                    let mut counters = self.inner.counters.lock();
                    counters.disconnections = counters.disconnections.saturating_add(1);
                    counters.last_disconnect = Some(SystemTime::now());
                    counters.disconnections
                };
                match reason {
                    Some(reason) => warn!(disconnections, %reason, "connection closed"),
                    None => warn!(disconnections, "connection closed"),
                }
            }
        }
    }

    pub fn on_reconnect_attempt(&self) {
        let mut counters = self.inner.counters.lock();
        counters.reconnect_attempts = counters.reconnect_attempts.saturating_add(1);
    }

    pub fn on_message_sent(&self) {
        let mut counters = self.inner.counters.lock();
        counters.messages_sent = counters.messages_sent.saturating_add(1);
    }

    pub fn on_message_received(&self) {
        let mut counters = self.inner.counters.lock();
        counters.messages_received = counters.messages_received.saturating_add(1);
    }

    pub fn record_send_latency(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.inner.counters.lock().send_latency.saturating_record(micros);
    }

    pub fn health(&self) -> ConnectionHealth {
        self.inner.snapshot()
    }

    /// Zero every counter and restart the uptime baseline.
    pub fn reset(&self) {
        let mut counters = self.inner.counters.lock();
        counters.started = Instant::now();
        counters.disconnections = 0;
        counters.last_disconnect = None;
        counters.reconnect_attempts = 0;
        counters.messages_sent = 0;
        counters.messages_received = 0;
        counters.send_latency.reset();
    }

    /// Snapshots published by each periodic check.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionHealth> {
        self.inner.published.subscribe()
    }

    pub fn config(&self) -> HealthMonitorConfig {
        self.inner.config
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthMonitorConfig::default())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.checker.get_mut().take() {
            handle.abort();
        }
    }
}
