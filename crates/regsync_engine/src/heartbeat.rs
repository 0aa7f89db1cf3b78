//! Heartbeat keep-alive for registered instances.
//!
//! A beat is a repeating time wheel task that hands the actual renewal to the
//! worker pool without waiting for queue space; a beat that finds the queue
//! full is dropped, so a slow registry never stalls a wheel bucket. The wheel
//! knows nothing about jobs: every beat checks the job token itself and
//! cancels its own schedule once the job is gone.

use crate::config::HeartbeatConfig;
use crate::error::EngineResult;
use parking_lot::Mutex;
use regsync_sched::{CancelHandle, TimeWheel, WorkerPool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keeps instances alive with periodic beats.
pub struct HeartbeatKeeper {
    wheel: Arc<TimeWheel>,
    pool: Arc<WorkerPool>,
    config: HeartbeatConfig,
    beats: Mutex<HashMap<String, CancelHandle>>,
}

impl HeartbeatKeeper {
    /// Creates a keeper scheduling on `wheel` and beating on `pool`.
    pub fn new(wheel: Arc<TimeWheel>, pool: Arc<WorkerPool>, config: HeartbeatConfig) -> Self {
        Self {
            wheel,
            pool,
            config,
            beats: Mutex::new(HashMap::new()),
        }
    }

    /// Heartbeat key of an instance.
    pub fn key(namespace: &str, service: &str, instance_id: &str) -> String {
        format!("{namespace}:{service}:{instance_id}")
    }

    /// Starts beating for `key` until `token` is cancelled or [`stop`](Self::stop)
    /// is called. Returns false if `key` already beats.
    pub fn start<F>(&self, key: impl Into<String>, token: CancellationToken, beat: F) -> EngineResult<bool>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let key = key.into();
        let mut beats = self.beats.lock();
        if beats.get(&key).is_some_and(|handle| !handle.is_cancelled()) {
            return Ok(false);
        }

        let handle = CancelHandle::new();
        let own = handle.clone();
        let pool = Arc::clone(&self.pool);
        let beat = Arc::new(beat);
        let beat_key = key.clone();
        self.wheel.schedule_exec_with_handle(
            handle.clone(),
            self.config.initial_delay,
            self.config.period,
            move || {
                if token.is_cancelled() {
                    debug!(key = %beat_key, "job cancelled, heartbeat stopped");
                    own.cancel();
                    return;
                }
                let beat = Arc::clone(&beat);
                if let Err(err) = pool.try_submit(move || beat()) {
                    warn!(key = %beat_key, error = %err, "heartbeat dropped");
                    if err.is_shutdown() {
                        own.cancel();
                    }
                }
            },
        )?;

        debug!(key = %key, "heartbeat started");
        beats.insert(key, handle);
        Ok(true)
    }

    /// Stops beating for `key`. Returns false if it was not beating.
    pub fn stop(&self, key: &str) -> bool {
        match self.beats.lock().remove(key) {
            Some(handle) => {
                handle.cancel();
                debug!(key, "heartbeat stopped");
                true
            }
            None => false,
        }
    }

    /// Stops every beat.
    pub fn stop_all(&self) {
        for (_, handle) in self.beats.lock().drain() {
            handle.cancel();
        }
    }

    /// Number of keys still beating.
    pub fn active(&self) -> usize {
        self.beats
            .lock()
            .values()
            .filter(|handle| !handle.is_cancelled())
            .count()
    }
}

impl Drop for HeartbeatKeeper {
    fn drop(&mut self) {
        self.stop_all();
    }
}
