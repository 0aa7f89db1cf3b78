//! Configuration for the worker pool and the time wheel.

use crate::error::{SchedError, SchedResult};
use std::time::Duration;

/// Configuration for a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers started with the pool.
    pub workers: usize,
    /// Capacity of the shared work queue. `submit` blocks when it is full.
    pub queue_capacity: usize,
    /// Prefix used to name worker threads.
    pub thread_name: String,
}

impl PoolConfig {
    /// Creates a new pool configuration.
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self {
            workers,
            queue_capacity,
            thread_name: "regsync-worker".into(),
        }
    }

    /// Sets the thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> SchedResult<()> {
        if self.workers == 0 {
            return Err(SchedError::InvalidConfig("workers must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(SchedError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(16, 128)
    }
}

/// Configuration for a [`TimeWheel`](crate::TimeWheel).
#[derive(Debug, Clone)]
pub struct WheelConfig {
    /// Time the cursor waits before moving to the next bucket.
    pub interval: Duration,
    /// Number of buckets on the wheel.
    pub slots: usize,
    /// Capacity of each bucket's dispatch queue.
    pub dispatch_capacity: usize,
    /// How long a scan waits on a full dispatch queue before abandoning an
    /// entry. Defaults to `interval`.
    pub dispatch_timeout: Option<Duration>,
}

impl WheelConfig {
    /// Creates a wheel configuration with the given tick interval and slot count.
    pub fn new(interval: Duration, slots: usize) -> Self {
        Self {
            interval,
            slots,
            dispatch_capacity: 32,
            dispatch_timeout: None,
        }
    }

    /// Sets the per-bucket dispatch queue capacity.
    pub fn with_dispatch_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_capacity = capacity;
        self
    }

    /// Sets the dispatch wait timeout.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = Some(timeout);
        self
    }

    /// The effective dispatch wait timeout.
    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout.unwrap_or(self.interval)
    }

    /// Duration of one full wheel rotation.
    pub fn period(&self) -> Duration {
        self.interval * self.slots as u32
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> SchedResult<()> {
        if self.interval.is_zero() {
            return Err(SchedError::InvalidConfig("interval must be > 0".into()));
        }
        if self.slots == 0 {
            return Err(SchedError::InvalidConfig("slots must be > 0".into()));
        }
        if u32::try_from(self.slots).is_err() {
            return Err(SchedError::InvalidConfig("slots must fit in u32".into()));
        }
        if self.dispatch_capacity == 0 {
            return Err(SchedError::InvalidConfig(
                "dispatch_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 128)
    }
}
