use crate::core::{HealthMonitorConfig, RateLimiterConfig, ReconnectConfig, RetryQueueConfig};

/// Settings for every component owned by a [`crate::session::ResilientSession`].
#[derive(Clone, Copy, Debug)]
pub struct ResilienceConfig {
    pub rate_limit: RateLimiterConfig,
    pub queue: RetryQueueConfig,
    pub reconnect: ReconnectConfig,
    pub health: HealthMonitorConfig,
    /// Schedule a reconnect whenever the connection reports a close.
    pub auto_reconnect: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimiterConfig::default(),
            queue: RetryQueueConfig::default(),
            reconnect: ReconnectConfig::default(),
            health: HealthMonitorConfig::default(),
            auto_reconnect: true,
        }
    }
}

impl ResilienceConfig {
    pub fn with_rate_limit(mut self, rate_limit: RateLimiterConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_queue(mut self, queue: RetryQueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_health(mut self, health: HealthMonitorConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_auto_reconnect(mut self, enable: bool) -> Self {
        self.auto_reconnect = enable;
        self
    }
}
