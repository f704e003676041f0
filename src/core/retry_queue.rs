//! Priority retry queue for outbound work.
//!
//! Work items are ordered by descending priority (ties keep arrival order) and run
//! one at a time on a single worker task. A failed item is retried after
//! `retry_delay * retry_count` and goes back to the *front* of the queue, so it
//! keeps precedence until the next [`RetryQueue::add`] re-sorts the backlog.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::types::{ResilienceError, ResilienceResult};

/// Priority used when callers have no opinion.
pub const DEFAULT_PRIORITY: i32 = 5;

const EVENT_CAPACITY: usize = 256;
const ID_SUFFIX_LEN: usize = 9;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Boxed future produced by a queued unit of work.
pub type WorkFuture = Pin<Box<dyn Future<Output = ResilienceResult<()>> + Send>>;

type WorkFn = Box<dyn FnMut() -> WorkFuture + Send>;

/// Identifier handed back by [`RetryQueue::add`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkId(Arc<str>);

impl WorkId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn generate(rng: &mut SmallRng) -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        Self(Arc::from(format!("msg_{millis}_{suffix}")))
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryQueueConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_queue_size: usize,
    pub enable_logs: bool,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_queue_size: 100,
            enable_logs: true,
        }
    }
}

impl RetryQueueConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_logs(mut self, enable: bool) -> Self {
        self.enable_logs = enable;
        self
    }
}

/// Lifecycle signals surfaced to collaborators (metrics, logging, tests).
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Queued {
        id: WorkId,
        priority: i32,
    },
    Sent {
        id: WorkId,
        attempts: u32,
    },
    Retrying {
        id: WorkId,
        attempt: u32,
        delay: Duration,
        error: ResilienceError,
    },
    Failed {
        id: WorkId,
        attempts: u32,
        error: ResilienceError,
    },
    Evicted {
        id: WorkId,
        priority: i32,
    },
    Cleared {
        discarded: usize,
    },
}

struct QueuedWork {
    id: WorkId,
    execute: WorkFn,
    retry_count: u32,
    max_retries: u32,
    enqueued_at: Instant,
    priority: i32,
}

struct QueueState {
    items: VecDeque<QueuedWork>,
    processing: bool,
    // Bumped by `clear`; items sleeping out a retry delay at that point are dropped.
    generation: u64,
    rng: SmallRng,
}

struct Shared {
    config: RetryQueueConfig,
    state: Mutex<QueueState>,
    idle: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl Shared {
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

/// Capacity-bounded priority queue executed by a single serial worker.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct RetryQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryQueue")
            .field("config", &self.shared.config)
            .field("len", &self.len())
            .field("processing", &self.is_processing())
            .finish()
    }
}

impl RetryQueue {
    pub fn new(config: RetryQueueConfig) -> Self {
        let config = RetryQueueConfig {
            max_queue_size: config.max_queue_size.max(1),
            ..config
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(QueueState {
                    items: VecDeque::with_capacity(config.max_queue_size),
                    processing: false,
                    generation: 0,
                    rng: SmallRng::from_entropy(),
                }),
                idle: Notify::new(),
                events,
            }),
        }
    }

    /// Enqueue `work` and return its id immediately.
    ///
    /// `work` is invoked once per attempt. When the queue is full, the tail item
    /// (lowest priority, newest among equals) is evicted to make room. Starts the
    /// worker if it is idle, so this must be called from within a Tokio runtime.
    pub fn add<F, Fut>(&self, mut work: F, priority: i32) -> WorkId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<()>> + Send + 'static,
    {
        let execute: WorkFn = Box::new(move || -> WorkFuture { Box::pin(work()) });
        let config = self.shared.config;

        let (id, evicted, start_worker) = {
            let mut state = self.shared.state.lock();
            let id = WorkId::generate(&mut state.rng);
            let evicted = if state.items.len() >= config.max_queue_size {
                state.items.pop_back()
            } else {
                None
            };

            state.items.push_back(QueuedWork {
                id: id.clone(),
                execute,
                retry_count: 0,
                max_retries: config.max_retries,
                enqueued_at: Instant::now(),
                priority,
            });
            // Stable: equal priorities keep arrival order.
            state
                .items
                .make_contiguous()
                .sort_by(|a, b| b.priority.cmp(&a.priority));

            let start_worker = !state.processing;
            state.processing = true;
            (id, evicted, start_worker)
        };

        if let Some(evicted) = evicted {
            if config.enable_logs {
                warn!(
                    evicted = %evicted.id,
                    priority = evicted.priority,
                    queued_ms = evicted.enqueued_at.elapsed().as_millis().min(u64::MAX as u128) as u64,
                    "queue full, evicted lowest priority work"
                );
            }
            self.shared.emit(QueueEvent::Evicted {
                id: evicted.id,
                priority: evicted.priority,
            });
        }

        if config.enable_logs {
            info!(id = %id, priority, "work queued");
        }
        self.shared.emit(QueueEvent::Queued {
            id: id.clone(),
            priority,
        });

        if start_worker {
            tokio::spawn(Self::run(Arc::clone(&self.shared)));
        }

        id
    }

    /// [`RetryQueue::add`] with [`DEFAULT_PRIORITY`].
    pub fn add_default<F, Fut>(&self, work: F) -> WorkId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<()>> + Send + 'static,
    {
        self.add(work, DEFAULT_PRIORITY)
    }

    async fn run(shared: Arc<Shared>) {
        let config = shared.config;
        loop {
            let mut item = {
                let mut state = shared.state.lock();
                match state.items.pop_front() {
                    Some(item) => item,
                    None => {
                        state.processing = false;
                        shared.idle.notify_waiters();
                        return;
                    }
                }
            };

            let outcome = AssertUnwindSafe(async { (item.execute)().await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ResilienceError::from_panic("queued work", panic)));

            match outcome {
                Ok(()) => {
                    let attempts = item.retry_count + 1;
                    if config.enable_logs {
                        info!(id = %item.id, attempts, "work completed");
                    }
                    shared.emit(QueueEvent::Sent {
                        id: item.id,
                        attempts,
                    });
                }
                Err(err) => {
                    item.retry_count += 1;
                    if item.retry_count < item.max_retries {
                        let delay = config.retry_delay.saturating_mul(item.retry_count);
                        if config.enable_logs {
                            warn!(
                                id = %item.id,
                                attempt = item.retry_count,
                                max_retries = item.max_retries,
                                delay_ms = delay.as_millis().min(u64::MAX as u128) as u64,
                                error = %err,
                                "work failed, retrying"
                            );
                        }
                        shared.emit(QueueEvent::Retrying {
                            id: item.id.clone(),
                            attempt: item.retry_count,
                            delay,
                            error: err,
                        });

                        // Only a clear that lands during the delay drops the retry.
                        let generation = shared.state.lock().generation;
                        tokio::time::sleep(delay).await;

                        let mut state = shared.state.lock();
                        if state.generation == generation {
                            state.items.push_front(item);
                        } else {
                            debug!(id = %item.id, "queue cleared during retry delay, dropping work");
                        }
                    } else {
                        if config.enable_logs {
                            error!(
                                id = %item.id,
                                attempts = item.retry_count,
                                error = %err,
                                "work failed permanently"
                            );
                        }
                        shared.emit(QueueEvent::Failed {
                            id: item.id,
                            attempts: item.retry_count,
                            error: err,
                        });
                    }
                }
            }
        }
    }

    /// Number of items waiting to run (excludes the in-flight item).
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self) -> bool {
        self.shared.state.lock().processing
    }

    /// Pending ids in execution order.
    pub fn pending_ids(&self) -> Vec<WorkId> {
        self.shared
            .state
            .lock()
            .items
            .iter()
            .map(|item| item.id.clone())
            .collect()
    }

    /// Discard all pending work, including items waiting out a retry delay.
    ///
    /// The in-flight item is left to finish and keeps its retries if it fails.
    pub fn clear(&self) -> usize {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.generation = state.generation.wrapping_add(1);
            std::mem::take(&mut state.items)
        };
        let count = discarded.len();
        drop(discarded);

        if self.shared.config.enable_logs {
            info!(discarded = count, "work queue cleared");
        }
        self.shared.emit(QueueEvent::Cleared { discarded: count });
        count
    }

    /// Resolve once the worker has drained the queue and stopped.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if !self.is_processing() {
                return;
            }
            notified.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> RetryQueueConfig {
        self.shared.config
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new(RetryQueueConfig::default())
    }
}
