//! Bounded multi-producer / single-consumer item queue.
//!
//! Producers (request handlers, the tracing bridge, span guards) push from any
//! thread; the batcher task is the only consumer. A single `VecDeque` behind a
//! mutex keeps global FIFO order, which implies FIFO within each kind.
//!
//! # Wake-ups
//!
//! | Event | Signal | Waiter |
//! |-------|--------|--------|
//! | item enqueued | `data_notify.notify_one()` | batcher task |
//! | items drained | `not_full.notify_all()` + `space_notify.notify_waiters()` | blocked producers |
//! | queue closed | all of the above | everyone |
//!
//! `notify_one` stores a permit when the batcher is not waiting yet, so an
//! enqueue racing with the batcher's drain is never missed.

use crate::error::{ConfigError, EnqueueError};
use crate::item::TelemetryItem;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What to do with a new item when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the new item and return `QueueFull`
    #[default]
    Reject,
    /// Wait for space, up to `block_timeout`
    Block,
    /// Discard the oldest queued item to make room
    EvictOldest,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            "evict-oldest" | "evict_oldest" => Ok(Self::EvictOldest),
            _ => Err(ConfigError::Invalid {
                var: "OTEL_PIPELINE_OVERFLOW_POLICY",
                value: s.to_owned(),
                reason: "expected one of reject, block, evict-oldest".to_owned(),
            }),
        }
    }
}

/// Configuration for the item queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued items across all kinds
    pub capacity: usize,
    /// Behavior when the queue is full
    pub overflow_policy: OverflowPolicy,
    /// Upper bound on how long a producer waits under `OverflowPolicy::Block`
    pub block_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 2048,
            overflow_policy: OverflowPolicy::Reject,
            block_timeout: Duration::from_millis(100),
        }
    }
}

impl QueueConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }
}

/// Queue counters.
///
/// All methods use `Ordering::Relaxed`: the counters are statistical and
/// guard no other data.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    items_enqueued: CachePadded<AtomicU64>,
    items_dropped: AtomicU64,
    items_evicted: AtomicU64,
    full_events: AtomicU64,
}

impl QueueMetrics {
    /// Items accepted into the queue
    pub fn items_enqueued(&self) -> u64 {
        self.items_enqueued.load(Ordering::Relaxed)
    }

    /// Items lost at the queue: rejected, timed out while blocked, or evicted
    pub fn items_dropped(&self) -> u64 {
        self.items_dropped.load(Ordering::Relaxed)
    }

    /// Subset of `items_dropped` discarded by `OverflowPolicy::EvictOldest`
    pub fn items_evicted(&self) -> u64 {
        self.items_evicted.load(Ordering::Relaxed)
    }

    /// Number of enqueues that found the queue full
    pub fn full_events(&self) -> u64 {
        self.full_events.load(Ordering::Relaxed)
    }
}

/// An item plus the instant it entered the queue
#[derive(Debug)]
pub struct QueuedItem {
    pub item: TelemetryItem,
    pub enqueued_at: Instant,
}

struct QueueState {
    items: VecDeque<QueuedItem>,
    closed: bool,
}

/// Bounded, closable MPSC queue of telemetry items
pub struct ItemQueue {
    state: Mutex<QueueState>,
    not_full: Condvar,
    space_notify: Notify,
    data_notify: Notify,
    config: QueueConfig,
    metrics: QueueMetrics,
}

impl ItemQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(config.capacity.min(4096)),
                closed: false,
            }),
            not_full: Condvar::new(),
            space_notify: Notify::new(),
            data_notify: Notify::new(),
            config,
            metrics: QueueMetrics::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues an item, applying the overflow policy when full.
    ///
    /// Under `OverflowPolicy::Block` this parks the calling thread for up to
    /// `block_timeout`. On a multi-threaded tokio worker the wait runs inside
    /// `block_in_place`; on a current-thread runtime the batcher shares the
    /// caller's thread, so a full queue fails with `QueueFull` at once. Async
    /// callers should prefer [`ItemQueue::push_async`].
    pub fn push(&self, item: TelemetryItem) -> Result<(), EnqueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EnqueueError::PipelineClosed);
        }

        if state.items.len() >= self.config.capacity {
            self.metrics.full_events.fetch_add(1, Ordering::Relaxed);
            match self.config.overflow_policy {
                OverflowPolicy::Reject => {
                    drop(state);
                    self.record_drop();
                    return Err(EnqueueError::QueueFull);
                }
                OverflowPolicy::EvictOldest => {
                    state.items.pop_front();
                    self.metrics.items_evicted.fetch_add(1, Ordering::Relaxed);
                    self.record_drop();
                }
                OverflowPolicy::Block => {
                    state = match Handle::try_current().map(|h| h.runtime_flavor()) {
                        Err(_) => self.wait_for_space(state)?,
                        Ok(RuntimeFlavor::CurrentThread) => {
                            drop(state);
                            self.record_drop();
                            return Err(EnqueueError::QueueFull);
                        }
                        Ok(_) => tokio::task::block_in_place(|| self.wait_for_space(state))?,
                    };
                }
            }
        }

        self.insert(state, item);
        Ok(())
    }

    /// Parks until there is room, the queue closes or `block_timeout` passes.
    fn wait_for_space<'a>(
        &'a self,
        mut state: MutexGuard<'a, QueueState>,
    ) -> Result<MutexGuard<'a, QueueState>, EnqueueError> {
        let deadline = std::time::Instant::now() + self.config.block_timeout;
        while !state.closed && state.items.len() >= self.config.capacity {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                drop(state);
                self.record_drop();
                return Err(EnqueueError::QueueFull);
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        if state.closed {
            return Err(EnqueueError::PipelineClosed);
        }
        Ok(state)
    }

    /// Enqueues an item, awaiting space instead of parking the thread.
    ///
    /// Identical to [`ItemQueue::push`] for the non-blocking policies.
    pub async fn push_async(&self, item: TelemetryItem) -> Result<(), EnqueueError> {
        if self.config.overflow_policy != OverflowPolicy::Block {
            return self.push(item);
        }

        let deadline = Instant::now() + self.config.block_timeout;
        let mut counted_full = false;
        loop {
            // Register interest before checking, so a drain between the check
            // and the await still wakes us.
            let notified = self.space_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if state.closed {
                    return Err(EnqueueError::PipelineClosed);
                }
                if state.items.len() < self.config.capacity {
                    self.insert(state, item);
                    return Ok(());
                }
            }

            if !counted_full {
                self.metrics.full_events.fetch_add(1, Ordering::Relaxed);
                counted_full = true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.record_drop();
                return Err(EnqueueError::QueueFull);
            }
        }
    }

    fn insert(&self, mut state: MutexGuard<'_, QueueState>, item: TelemetryItem) {
        state.items.push_back(QueuedItem {
            item,
            enqueued_at: Instant::now(),
        });
        drop(state);
        self.metrics.items_enqueued.fetch_add(1, Ordering::Relaxed);
        self.data_notify.notify_one();
    }

    fn record_drop(&self) {
        self.metrics.items_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Moves up to `limit` items, oldest first, into `buf`. Single consumer only.
    pub fn drain_into(&self, buf: &mut Vec<QueuedItem>, limit: usize) -> usize {
        let mut state = self.lock();
        let n = state.items.len().min(limit);
        buf.extend(state.items.drain(..n));
        drop(state);

        if n > 0 {
            self.not_full.notify_all();
            self.space_notify.notify_waiters();
        }
        n
    }

    /// Closes the queue: every current and future enqueue fails with `PipelineClosed`.
    ///
    /// Items already queued stay drainable.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);

        self.not_full.notify_all();
        self.space_notify.notify_waiters();
        self.data_notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Resolves after the next enqueue (or close). Used by the batcher.
    pub(crate) fn data_notified(&self) -> Notified<'_> {
        self.data_notify.notified()
    }
}
