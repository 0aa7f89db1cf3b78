//! Hashed time wheel.
//!
//! The wheel is a ring of `slots` buckets. A single cursor thread visits one
//! bucket per `interval`. Scheduling a task with delay `D` costs O(1): it is
//! appended to bucket `(cursor + ticks) % slots` with
//! `rotations = ticks / slots`, where `ticks = ceil(D / interval)`.
//!
//! When the cursor visits a bucket, every pending entry is looked at once:
//! entries with `rotations == 0` are pushed to the bucket's bounded dispatch
//! queue, the others have their count decremented and wait for the next
//! visit. Each bucket has its own consumer thread draining the dispatch
//! queue, so a stalled bucket never blocks another one.
//!
//! Repeating tasks are ordinary one-shot tasks whose runnable re-inserts the
//! next occurrence after running the user function.

use crate::config::WheelConfig;
use crate::error::{SchedError, SchedResult};
use crate::handle::CancelHandle;
use crate::panic::PanicSlot;
use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

type Runnable = Box<dyn FnOnce() + Send + 'static>;
type DelaySupplier = Arc<dyn Fn() -> Duration + Send + Sync>;
type Repeating = Arc<dyn Fn() + Send + Sync>;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct TimerTask {
    delay: Duration,
    rotations: u64,
    cancel: CancelHandle,
    run: Runnable,
}

impl TimerTask {
    fn new(delay: Duration, cancel: CancelHandle, run: Runnable) -> Self {
        Self {
            delay,
            rotations: 0,
            cancel,
            run,
        }
    }
}

struct Bucket {
    pending: Mutex<VecDeque<TimerTask>>,
    /// Taken on stop so the consumer drains and exits.
    dispatch: Mutex<Option<Sender<TimerTask>>>,
}

struct WheelInner {
    config: WheelConfig,
    buckets: Vec<Bucket>,
    /// Index of the bucket the next tick will visit.
    cursor: AtomicUsize,
    state: AtomicU8,
    panics: PanicSlot,
}

/// Computes `(bucket, rotations)` for a delay scheduled while the cursor
/// points at `cursor`.
pub fn slot_for(cursor: usize, slots: usize, interval: Duration, delay: Duration) -> (usize, u64) {
    let ticks = delay.as_nanos().div_ceil(interval.as_nanos());
    let slots = slots as u128;
    let position = ((cursor as u128 + ticks) % slots) as usize;
    let rotations = u64::try_from(ticks / slots).unwrap_or(u64::MAX);
    (position, rotations)
}

impl WheelInner {
    fn insert(&self, mut task: TimerTask) -> SchedResult<()> {
        if self.state.load(Ordering::SeqCst) == STOPPED {
            return Err(SchedError::WheelStopped);
        }
        // The slot is only valid for the cursor it was computed from, so the
        // cursor is re-read under the target bucket's lock.
        loop {
            let cursor = self.cursor.load(Ordering::SeqCst);
            let (position, rotations) =
                slot_for(cursor, self.buckets.len(), self.config.interval, task.delay);
            let mut pending = self.buckets[position].pending.lock();
            if self.cursor.load(Ordering::SeqCst) != cursor {
                continue;
            }
            task.rotations = rotations;
            pending.push_back(task);
            return Ok(());
        }
    }

    /// Visits the bucket under the cursor and moves the cursor on.
    ///
    /// The cursor is advanced while the bucket lock is held. An insert checks
    /// the cursor under its target bucket's lock and retries if it moved, so a
    /// racing insert is never scheduled early.
    fn advance(&self) {
        let current = self.cursor.load(Ordering::SeqCst);
        let bucket = &self.buckets[current];

        let due: Vec<TimerTask> = {
            let mut pending = bucket.pending.lock();
            self.cursor
                .store((current + 1) % self.buckets.len(), Ordering::SeqCst);

            let mut due = Vec::new();
            let mut waiting = VecDeque::with_capacity(pending.len());
            for mut task in pending.drain(..) {
                if task.cancel.is_cancelled() {
                    continue;
                }
                if task.rotations == 0 {
                    due.push(task);
                } else {
                    task.rotations -= 1;
                    waiting.push_back(task);
                }
            }
            *pending = waiting;
            due
        };

        if due.is_empty() {
            return;
        }
        let Some(sender) = bucket.dispatch.lock().clone() else {
            debug!(bucket = current, dropped = due.len(), "bucket consumer gone");
            return;
        };
        let timeout = self.config.dispatch_timeout();
        for task in due {
            dispatch(&sender, task, timeout, current);
        }
    }
}

/// Pushes a due task to its bucket consumer, waiting once for room.
fn dispatch(sender: &Sender<TimerTask>, task: TimerTask, timeout: Duration, bucket: usize) {
    let task = match sender.try_send(task) {
        Ok(()) => return,
        Err(TrySendError::Full(task)) => task,
        Err(TrySendError::Disconnected(_)) => return,
    };
    match sender.send_timeout(task, timeout) {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(task)) => {
            warn!(bucket, delay = ?task.delay, "dispatch queue full, task abandoned");
        }
        Err(SendTimeoutError::Disconnected(_)) => {}
    }
}

fn consume(receiver: Receiver<TimerTask>, panics: PanicSlot) {
    for task in receiver.iter() {
        if task.cancel.is_cancelled() {
            continue;
        }
        panics.run_guarded(task.run);
    }
}

/// Builds the runnable for one occurrence of a repeating task.
fn repeating(
    wheel: Weak<WheelInner>,
    handle: CancelHandle,
    next_delay: DelaySupplier,
    work: Repeating,
) -> Runnable {
    Box::new(move || {
        let Some(inner) = wheel.upgrade() else {
            return;
        };
        inner.panics.run_guarded(|| work());

        if handle.is_cancelled() {
            return;
        }
        let delay = next_delay();
        let run = repeating(Arc::downgrade(&inner), handle.clone(), next_delay, work);
        if let Err(err) = inner.insert(TimerTask::new(delay, handle, run)) {
            debug!(error = %err, "repeating task not re-armed");
        }
    })
}

/// A hashed time wheel running delayed and repeating tasks.
///
/// Construct one explicitly and share it by reference; there is no global
/// instance.
pub struct TimeWheel {
    inner: Arc<WheelInner>,
    ticker: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl TimeWheel {
    /// Creates a wheel and its bucket consumers. The cursor does not move
    /// until [`start`](Self::start) is called.
    pub fn new(config: WheelConfig) -> SchedResult<Self> {
        config.validate()?;
        let panics = PanicSlot::new("time_wheel");

        let mut buckets = Vec::with_capacity(config.slots);
        let mut consumers = Vec::with_capacity(config.slots);
        for index in 0..config.slots {
            let (sender, receiver) = bounded(config.dispatch_capacity);
            let slot_panics = panics.clone();
            let consumer = thread::Builder::new()
                .name(format!("regsync-wheel-{index}"))
                .spawn(move || consume(receiver, slot_panics))?;
            buckets.push(Bucket {
                pending: Mutex::new(VecDeque::new()),
                dispatch: Mutex::new(Some(sender)),
            });
            consumers.push(consumer);
        }

        Ok(Self {
            inner: Arc::new(WheelInner {
                config,
                buckets,
                cursor: AtomicUsize::new(0),
                state: AtomicU8::new(CREATED),
                panics,
            }),
            ticker: Mutex::new(None),
            consumers: Mutex::new(consumers),
        })
    }

    /// Starts the cursor thread.
    pub fn start(&self) -> SchedResult<()> {
        match self.inner.state.compare_exchange(
            CREATED,
            RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(RUNNING) => return Err(SchedError::AlreadyStarted),
            Err(_) => return Err(SchedError::WheelStopped),
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.interval;
        let handle = thread::Builder::new()
            .name("regsync-wheel-cursor".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => inner.advance(),
                    _ => break,
                }
            })?;

        *self.ticker.lock() = Some((stop_tx, handle));
        debug!(
            slots = self.inner.buckets.len(),
            interval = ?interval,
            "time wheel started"
        );
        Ok(())
    }

    /// Runs `work` once after `delay`.
    pub fn delay_exec<F>(&self, delay: Duration, work: F) -> SchedResult<CancelHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = CancelHandle::new();
        self.inner
            .insert(TimerTask::new(delay, handle.clone(), Box::new(work)))?;
        Ok(handle)
    }

    /// Runs `work` after `delay` and then every `period` until cancelled.
    pub fn schedule_exec<F>(
        &self,
        delay: Duration,
        period: Duration,
        work: F,
    ) -> SchedResult<CancelHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_with(delay, move || period, work)
    }

    /// Like [`schedule_exec`](Self::schedule_exec), using a handle the caller
    /// created beforehand so the work itself can cancel its own schedule.
    pub fn schedule_exec_with_handle<F>(
        &self,
        handle: CancelHandle,
        delay: Duration,
        period: Duration,
        work: F,
    ) -> SchedResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_repeating(handle, delay, Arc::new(move || period), Arc::new(work))
    }

    /// Runs `work` after `delay`, then again after whatever `next_delay`
    /// returns each time, until cancelled.
    pub fn schedule_with<S, F>(
        &self,
        delay: Duration,
        next_delay: S,
        work: F,
    ) -> SchedResult<CancelHandle>
    where
        S: Fn() -> Duration + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let handle = CancelHandle::new();
        self.schedule_repeating(
            handle.clone(),
            delay,
            Arc::new(next_delay),
            Arc::new(work),
        )?;
        Ok(handle)
    }

    fn schedule_repeating(
        &self,
        handle: CancelHandle,
        delay: Duration,
        next_delay: DelaySupplier,
        work: Repeating,
    ) -> SchedResult<()> {
        let run = repeating(
            Arc::downgrade(&self.inner),
            handle.clone(),
            next_delay,
            work,
        );
        self.inner.insert(TimerTask::new(delay, handle, run))
    }

    /// Installs the handler invoked with the message of every panicking task.
    pub fn set_panic_handler<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.inner.panics.set(Arc::new(handler));
    }

    /// Stops the wheel.
    ///
    /// Halts the cursor, makes one full pass over every bucket so entries due
    /// within the current rotation are dispatched, then waits for every
    /// bucket consumer to drain and exit. Never call from inside a task.
    pub fn stop(&self) {
        if self.inner.state.swap(STOPPED, Ordering::SeqCst) == STOPPED {
            return;
        }

        if let Some((stop_tx, handle)) = self.ticker.lock().take() {
            drop(stop_tx);
            if handle.join().is_err() {
                warn!("wheel cursor thread terminated abnormally");
            }
        }

        for _ in 0..self.inner.buckets.len() {
            self.inner.advance();
        }
        for bucket in &self.inner.buckets {
            bucket.dispatch.lock().take();
        }

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            if consumer.join().is_err() {
                warn!("wheel consumer thread terminated abnormally");
            }
        }
        debug!("time wheel stopped");
    }

    /// Returns true while the cursor thread is running.
    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == RUNNING
    }

    /// Index of the bucket the next tick visits.
    pub fn cursor(&self) -> usize {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    /// Number of entries still waiting in bucket queues.
    pub fn pending(&self) -> usize {
        self.inner
            .buckets
            .iter()
            .map(|bucket| bucket.pending.lock().len())
            .sum()
    }

    /// The wheel configuration.
    pub fn config(&self) -> &WheelConfig {
        &self.inner.config
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wheel(interval_ms: u64, slots: usize) -> TimeWheel {
        TimeWheel::new(WheelConfig::new(Duration::from_millis(interval_ms), slots)).unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inc = {
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, inc)
    }

    #[test]
    fn slot_math() {
        let second = Duration::from_secs(1);
        assert_eq!(slot_for(0, 8, second, Duration::ZERO), (0, 0));
        assert_eq!(slot_for(0, 8, second, Duration::from_secs(3)), (3, 0));
        assert_eq!(slot_for(6, 8, second, Duration::from_secs(3)), (1, 0));
        assert_eq!(slot_for(2, 8, second, Duration::from_secs(8)), (2, 1));
        assert_eq!(slot_for(0, 8, second, Duration::from_secs(20)), (4, 2));
        // Partial ticks round up.
        assert_eq!(slot_for(0, 8, second, Duration::from_millis(1500)), (2, 0));
    }

    proptest! {
        #[test]
        fn slot_recombines_to_tick_count(
            cursor in 0usize..64,
            slots in 1usize..64,
            delay_ms in 0u64..100_000,
            interval_ms in 1u64..500,
        ) {
            let cursor = cursor % slots;
            let interval = Duration::from_millis(interval_ms);
            let delay = Duration::from_millis(delay_ms);
            let (position, rotations) = slot_for(cursor, slots, interval, delay);

            prop_assert!(position < slots);
            let offset = (position + slots - cursor) % slots;
            let ticks = rotations * slots as u64 + offset as u64;
            prop_assert_eq!(ticks, delay_ms.div_ceil(interval_ms));
        }
    }

    #[test]
    fn insert_follows_a_cursor_that_moved_while_it_waited() {
        let w = wheel(10, 8);
        let inner = Arc::clone(&w.inner);

        // Delay of three ticks from cursor 0 targets bucket 3.
        let guard = inner.buckets[3].pending.lock();
        let inserter = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || {
                inner.insert(TimerTask::new(
                    Duration::from_millis(30),
                    CancelHandle::new(),
                    Box::new(|| {}),
                ))
            })
        };
        thread::sleep(Duration::from_millis(50));
        inner.cursor.store(2, Ordering::SeqCst);
        drop(guard);
        inserter.join().unwrap().unwrap();

        assert!(inner.buckets[3].pending.lock().is_empty());
        assert_eq!(inner.buckets[5].pending.lock().len(), 1);
    }

    #[test]
    fn one_shot_fires_after_delay() {
        let wheel = wheel(5, 8);
        wheel.start().unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();
        let sink = Arc::clone(&fired);
        wheel
            .delay_exec(Duration::from_millis(30), move || {
                sink.lock().push(start.elapsed());
            })
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        let fired = fired.lock();
        assert_eq!(fired.len(), 1);
        assert!(fired[0] >= Duration::from_millis(30));
    }

    #[test]
    fn delay_beyond_one_rotation() {
        // One rotation is 20ms.
        let wheel = wheel(5, 4);
        wheel.start().unwrap();

        let fired = Arc::new(Mutex::new(None));
        let start = Instant::now();
        let sink = Arc::clone(&fired);
        wheel
            .delay_exec(Duration::from_millis(55), move || {
                *sink.lock() = Some(start.elapsed());
            })
            .unwrap();

        thread::sleep(Duration::from_millis(250));
        let elapsed = fired.lock().expect("task fired");
        assert!(elapsed >= Duration::from_millis(55));
    }

    #[test]
    fn cancel_before_dispatch_prevents_run() {
        let wheel = wheel(5, 8);
        wheel.start().unwrap();
        let (count, inc) = counter();

        let handle = wheel.delay_exec(Duration::from_millis(40), inc).unwrap();
        handle.cancel();

        thread::sleep(Duration::from_millis(150));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(wheel.pending(), 0);
    }

    #[test]
    fn repeating_task_runs_until_cancelled() {
        let wheel = wheel(5, 8);
        wheel.start().unwrap();
        let (count, inc) = counter();

        let handle = wheel
            .schedule_exec(Duration::ZERO, Duration::from_millis(20), inc)
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(count.load(Ordering::SeqCst) >= 3);

        handle.cancel();
        let at_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        let settled = count.load(Ordering::SeqCst);
        assert!(settled <= at_cancel + 1);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn supplier_controls_next_delay() {
        let wheel = wheel(5, 16);
        wheel.start().unwrap();

        let stamps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stamps);
        let handle = wheel
            .schedule_with(
                Duration::ZERO,
                || Duration::from_millis(40),
                move || sink.lock().push(Instant::now()),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        handle.cancel();

        let stamps = stamps.lock();
        assert!(stamps.len() >= 2);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(40));
        }
    }

    #[test]
    fn handle_given_to_work_can_cancel_itself() {
        let wheel = wheel(5, 8);
        wheel.start().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = CancelHandle::new();
        let own = handle.clone();
        let runs = Arc::clone(&count);
        wheel
            .schedule_exec_with_handle(handle, Duration::ZERO, Duration::from_millis(10), move || {
                if runs.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    own.cancel();
                }
            })
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn nothing_fires_before_start() {
        let wheel = wheel(5, 8);
        let (count, inc) = counter();
        wheel.delay_exec(Duration::ZERO, inc).unwrap();

        thread::sleep(Duration::from_millis(40));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(wheel.pending(), 1);

        wheel.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(wheel.start(), Err(SchedError::AlreadyStarted)));
    }

    #[test]
    fn stop_flushes_current_rotation() {
        // One rotation is 800ms, so nothing is due on its own during the test.
        let wheel = wheel(100, 8);
        wheel.start().unwrap();
        let (near, inc_near) = counter();
        let (far, inc_far) = counter();

        wheel.delay_exec(Duration::from_millis(300), inc_near).unwrap();
        wheel.delay_exec(Duration::from_secs(5), inc_far).unwrap();

        wheel.stop();
        assert_eq!(near.load(Ordering::SeqCst), 1);
        assert_eq!(far.load(Ordering::SeqCst), 0);
        assert!(!wheel.is_running());
        assert!(matches!(
            wheel.delay_exec(Duration::ZERO, || {}),
            Err(SchedError::WheelStopped)
        ));
    }

    #[test]
    fn panicking_task_does_not_stop_bucket() {
        let wheel = wheel(5, 1);
        let panics = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&panics);
        wheel.set_panic_handler(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        wheel.start().unwrap();
        let (count, inc) = counter();

        wheel.delay_exec(Duration::ZERO, || panic!("task failed")).unwrap();
        wheel.delay_exec(Duration::ZERO, inc).unwrap();

        thread::sleep(Duration::from_millis(80));
        assert_eq!(panics.load(Ordering::SeqCst), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_without_start_makes_one_full_pass() {
        let wheel = wheel(1_000, 4);
        let (count, inc) = counter();
        wheel.delay_exec(Duration::from_secs(2), inc).unwrap();
        assert_eq!(wheel.pending(), 1);

        wheel.stop();
        assert_eq!(wheel.cursor(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(wheel.pending(), 0);
    }
}
