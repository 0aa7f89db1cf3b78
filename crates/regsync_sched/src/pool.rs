//! Resizable worker pool over a bounded queue.

use crate::config::PoolConfig;
use crate::error::{SchedError, SchedResult};
use crate::handle::CancelHandle;
use crate::panic::{PanicHandler, PanicSlot};
use crossbeam_channel::{bounded, select_biased, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

type Work = Box<dyn FnOnce() + Send + 'static>;

struct Unit {
    work: Work,
    cancel: Option<CancelHandle>,
}

struct WorkerSlot {
    /// Dropping the sender tells the worker to exit after its current unit.
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// A fixed-capacity pool of worker threads pulling from one bounded queue.
///
/// - `submit` blocks the caller while the queue is full
/// - a panicking unit is reported to the panic handler and the worker keeps going
/// - `resize` grows or shrinks the worker set at runtime
/// - `close` stops intake; queued units are still drained
pub struct WorkerPool {
    config: PoolConfig,
    sender: RwLock<Option<Sender<Unit>>>,
    receiver: Receiver<Unit>,
    /// Resize lock: serializes worker-count changes.
    workers: Mutex<Vec<WorkerSlot>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    panics: PanicSlot,
    busy: Arc<AtomicUsize>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    /// Creates a pool and starts `config.workers` workers.
    pub fn new(config: PoolConfig) -> SchedResult<Self> {
        config.validate()?;
        let (sender, receiver) = bounded(config.queue_capacity);
        let pool = Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::with_capacity(config.workers)),
            retired: Mutex::new(Vec::new()),
            panics: PanicSlot::new("worker_pool"),
            busy: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicUsize::new(0),
            config,
        };
        pool.resize(pool.config.workers)?;
        Ok(pool)
    }

    /// Enqueues a unit of work, blocking while the queue is full.
    pub fn submit<F>(&self, work: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Unit {
            work: Box::new(work),
            cancel: None,
        })
    }

    /// Enqueues `work` without waiting for queue space.
    ///
    /// Fails with [`SchedError::PoolFull`] when the queue is at capacity.
    pub fn try_submit<F>(&self, work: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.read().clone().ok_or(SchedError::PoolClosed)?;
        sender
            .try_send(Unit {
                work: Box::new(work),
                cancel: None,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => SchedError::PoolFull,
                TrySendError::Disconnected(_) => SchedError::PoolClosed,
            })
    }

    /// Enqueues `work(arg)`.
    pub fn submit_with<A, F>(&self, arg: A, work: F) -> SchedResult<()>
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        self.submit(move || work(arg))
    }

    /// Enqueues a unit and returns a handle that can withdraw it.
    ///
    /// A unit cancelled before a worker picks it up is skipped; a unit that
    /// is already running completes.
    pub fn go<F>(&self, work: F) -> SchedResult<CancelHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = CancelHandle::new();
        self.enqueue(Unit {
            work: Box::new(work),
            cancel: Some(handle.clone()),
        })?;
        Ok(handle)
    }

    fn enqueue(&self, unit: Unit) -> SchedResult<()> {
        // Clone the sender so a blocked submit never holds the lock `close` needs.
        let sender = self.sender.read().clone().ok_or(SchedError::PoolClosed)?;
        sender.send(unit).map_err(|_| SchedError::PoolClosed)
    }

    /// Changes the number of workers.
    ///
    /// Shrinking marks the excess workers to exit after their current unit;
    /// growing starts the new workers immediately.
    pub fn resize(&self, size: usize) -> SchedResult<()> {
        if size == 0 {
            return Err(SchedError::InvalidConfig("pool size must be > 0".into()));
        }
        if self.is_closed() {
            return Err(SchedError::PoolClosed);
        }

        let mut workers = self.workers.lock();
        let current = workers.len();
        if size < current {
            let mut retired = self.retired.lock();
            for mut slot in workers.drain(size..) {
                slot.stop.take();
                retired.extend(slot.thread.take());
            }
        } else {
            for _ in current..size {
                workers.push(self.spawn_worker()?);
            }
        }

        debug!(from = current, to = size, "worker pool resized");
        Ok(())
    }

    fn spawn_worker(&self) -> SchedResult<WorkerSlot> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let receiver = self.receiver.clone();
        let panics = self.panics.clone();
        let busy = Arc::clone(&self.busy);

        let thread = thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name, id))
            .spawn(move || worker_loop(receiver, stop_rx, panics, busy))?;

        Ok(WorkerSlot {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Installs the handler invoked with the message of every panicking unit.
    pub fn set_panic_handler<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let handler: PanicHandler = Arc::new(handler);
        self.panics.set(handler);
    }

    /// Stops accepting work. Workers drain the queue and then exit.
    pub fn close(&self) {
        if self.sender.write().take().is_some() {
            debug!(queued = self.receiver.len(), "worker pool closed");
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Waits for every worker thread that has been told to exit.
    ///
    /// Call after [`close`](Self::close); never call from inside a unit.
    pub fn join(&self) {
        let mut handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .iter_mut()
            .filter_map(|slot| slot.thread.take())
            .collect();
        handles.append(&mut self.retired.lock());

        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread terminated abnormally");
            }
        }
    }

    /// Current number of workers.
    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Number of units waiting in the queue.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Number of units currently executing.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.config.queue_capacity
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop(
    receiver: Receiver<Unit>,
    stop: Receiver<()>,
    panics: PanicSlot,
    busy: Arc<AtomicUsize>,
) {
    while let Some(unit) = next_unit(&receiver, &stop) {
        if unit.cancel.as_ref().is_some_and(CancelHandle::is_cancelled) {
            continue;
        }

        busy.fetch_add(1, Ordering::SeqCst);
        panics.run_guarded(unit.work);
        busy.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Waits for the next unit. Returns `None` once the worker is retired or the
/// queue is closed and drained.
///
/// A retired worker never takes another unit, even when both are ready.
fn next_unit(receiver: &Receiver<Unit>, stop: &Receiver<()>) -> Option<Unit> {
    select_biased! {
        recv(stop) -> _ => None,
        recv(receiver) -> unit => unit.ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn pool(workers: usize, capacity: usize) -> WorkerPool {
        WorkerPool::new(PoolConfig::new(workers, capacity)).unwrap()
    }

    #[test]
    fn retired_worker_leaves_queued_work() {
        let (queue_tx, queue_rx) = bounded::<Unit>(4);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        for _ in 0..2 {
            queue_tx
                .send(Unit {
                    work: Box::new(|| {}),
                    cancel: None,
                })
                .unwrap();
        }

        assert!(next_unit(&queue_rx, &stop_rx).is_some());
        drop(stop_tx);
        for _ in 0..100 {
            assert!(next_unit(&queue_rx, &stop_rx).is_none());
        }
        assert_eq!(queue_rx.len(), 1);
    }

    #[test]
    fn try_submit_fails_fast_on_full_queue() {
        let pool = pool(1, 1);
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);
        pool.submit(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv().unwrap();

        pool.try_submit(|| {}).unwrap();
        assert!(matches!(pool.try_submit(|| {}), Err(SchedError::PoolFull)));

        release_tx.send(()).unwrap();
        pool.close();
        pool.join();
        assert!(matches!(pool.try_submit(|| {}), Err(SchedError::PoolClosed)));
    }

    #[test]
    fn runs_all_submitted_work() {
        let pool = pool(4, 16);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let count = Arc::clone(&count);
            pool.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.close();
        pool.join();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn submit_with_passes_argument() {
        let pool = pool(1, 4);
        let total = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&total);

        pool.submit_with(41usize, move |n| {
            sink.fetch_add(n + 1, Ordering::SeqCst);
        })
        .unwrap();

        pool.close();
        pool.join();
        assert_eq!(total.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn panic_does_not_stop_worker() {
        let pool = pool(1, 8);
        let panics = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&panics);
        pool.set_panic_handler(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.submit(|| panic!("unit failed")).unwrap();
        pool.submit(move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        pool.close();
        pool.join();
        assert_eq!(panics.load(Ordering::SeqCst), 1);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn submit_after_close_fails() {
        let pool = pool(1, 4);
        pool.close();
        assert!(matches!(pool.submit(|| {}), Err(SchedError::PoolClosed)));
        assert!(matches!(pool.resize(2), Err(SchedError::PoolClosed)));
        pool.join();
    }

    #[test]
    fn resize_rejects_zero() {
        let pool = pool(2, 4);
        assert!(pool.resize(0).is_err());
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn cancelled_go_unit_is_skipped() {
        let pool = pool(1, 4);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        pool.submit(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = pool
            .go(move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        handle.cancel();
        drop(gate_tx);

        pool.close();
        pool.join();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn full_queue_blocks_submitter() {
        let pool = Arc::new(pool(1, 1));
        let (gate_tx, gate_rx) = bounded::<()>(0);
        pool.submit(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();
        // Wait for the worker to take the blocking unit so the queue is empty.
        while pool.busy() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        pool.submit(|| {}).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let submitter = {
            let pool = Arc::clone(&pool);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                pool.submit(|| {}).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        drop(gate_tx);
        submitter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));

        pool.close();
        pool.join();
    }

    #[test]
    fn queued_units_survive_shrink() {
        let pool = pool(2, 32);
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let gate = gate_rx.clone();
            pool.submit(move || {
                let _ = gate.recv();
            })
            .unwrap();
        }
        for _ in 0..10 {
            let count = Arc::clone(&count);
            pool.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.resize(1).unwrap();
        assert_eq!(pool.size(), 1);
        drop(gate_tx);

        pool.close();
        pool.join();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn shrink_bounds_concurrency() {
        let pool = pool(4, 64);
        pool.resize(1).unwrap();
        // Let the idle excess workers observe their stop signal.
        thread::sleep(Duration::from_millis(50));

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            pool.submit(move || {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                current.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.close();
        pool.join();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn grow_adds_workers() {
        let pool = pool(1, 8);
        pool.resize(3).unwrap();
        assert_eq!(pool.size(), 3);

        let (gate_tx, gate_rx) = bounded::<()>(0);
        for _ in 0..3 {
            let gate = gate_rx.clone();
            pool.submit(move || {
                let _ = gate.recv();
            })
            .unwrap();
        }
        let mut waited = 0;
        while pool.busy() < 3 && waited < 500 {
            thread::sleep(Duration::from_millis(2));
            waited += 1;
        }
        assert_eq!(pool.busy(), 3);

        drop(gate_tx);
        pool.close();
        pool.join();
    }
}
