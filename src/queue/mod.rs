//! Priority-ordered, rate-paced request queue.
//!
//! Every outbound call to the model transport goes through one shared
//! [`RequestQueue`]. The queue runs at most one task at a time, spaces the
//! start of consecutive tasks at least [`QueueConfig::min_delay`] apart, and
//! always dispatches the highest-priority waiting task next (earliest
//! submission first among equal priorities).
//!
//! The time of the last dispatch is written to a [`DispatchStore`] so that a
//! restarted process still honors the spacing. Storage failures are logged and
//! otherwise ignored; they only cost the cross-restart memory.
//!
//! There is no cancellation: once [`RequestQueue::add`] returns, the task will
//! eventually run and settle its future.

use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::storage::{DispatchStore, MemoryStore};

mod config;
mod entry;

pub use config::{DEFAULT_MIN_DELAY, QueueConfig};

use entry::{Job, JobFuture, QueueEntry};

/// Handle to the shared request queue.
///
/// Cloning is cheap and every clone refers to the same waiting list, so the
/// application's composition root should build one queue and hand clones to
/// each caller.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use sluice::{Error, queue::{QueueConfig, RequestQueue}};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Error> {
///     let queue = RequestQueue::in_memory(QueueConfig::default().min_delay(Duration::from_secs(1)));
///     let answer = queue.add(|| async { Ok::<_, Error>(42) }, 10).await?;
///     assert_eq!(answer, 42);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    store: Arc<dyn DispatchStore>,
    state: Mutex<State>,
}

struct State {
    waiting: BinaryHeap<QueueEntry>,
    next_seq: u64,
    // Whether a dispatch loop task currently owns the waiting list.
    running: bool,
    last_dispatch: Option<Instant>,
}

impl RequestQueue {
    /// Creates a queue that persists its last-dispatch time in `store`.
    ///
    /// The stored timestamp is read once here. A missing or unreadable value
    /// means the first task is dispatched without delay.
    pub fn new(config: QueueConfig, store: Arc<dyn DispatchStore>) -> Self {
        let last_dispatch = restore_last_dispatch(store.as_ref(), &config.storage_key);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                state: Mutex::new(State {
                    waiting: BinaryHeap::new(),
                    next_seq: 0,
                    running: false,
                    last_dispatch,
                }),
            }),
        }
    }

    /// Creates a queue backed by a fresh [`MemoryStore`].
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// Returns the queue's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Number of tasks waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Returns `true` while the dispatch loop is armed.
    pub fn is_dispatching(&self) -> bool {
        self.inner.lock().running
    }

    /// Enqueues `task` at `priority` and returns a future for its outcome.
    ///
    /// The entry joins the waiting list immediately, before the returned future
    /// is first polled. Higher `priority` values are dispatched first; equal
    /// priorities are dispatched in submission order.
    ///
    /// The returned future settles exactly once with whatever the task
    /// produced. The queue never alters a task's outcome. The one exception is
    /// a task that never produces an outcome (it panicked, or the runtime shut
    /// down underneath it), which settles with [`QueueError::Abandoned`].
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime, which hosts the dispatch
    /// loop. Outside one this panics before the queue is touched.
    pub fn add<F, Fut, T, E>(
        &self,
        task: F,
        priority: i32,
    ) -> impl Future<Output = Result<T, E>> + Send + use<F, Fut, T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + Send + 'static,
    {
        let runtime = Handle::current();
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || -> JobFuture {
            Box::pin(async move {
                // The caller may have dropped its future; nobody to notify then.
                let _ = tx.send(task().await);
            })
        });

        let (start_loop, pending) = {
            let mut state = self.inner.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.push(QueueEntry::new(priority, seq, job));
            let start_loop = !state.running;
            state.running = true;
            (start_loop, state.waiting.len())
        };

        debug!(priority, pending, "request queued");

        if start_loop {
            runtime.spawn(dispatch_loop(LoopGuard::new(Arc::clone(&self.inner))));
        }

        async move {
            rx.await
                .unwrap_or_else(|_| Err(E::from(QueueError::Abandoned)))
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Time still to wait before the next dispatch may start.
    fn pacing_wait(&self, last_dispatch: Option<Instant>) -> Duration {
        match last_dispatch {
            Some(at) => self.config.min_delay.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    // Store writes may block on file I/O, so they run on the blocking pool.
    async fn persist_dispatch(&self) {
        let store = Arc::clone(&self.store);
        let key = self.config.storage_key.clone();
        let at = SystemTime::now();
        match task::spawn_blocking(move || store.save(&key, at)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist dispatch time"),
            Err(e) => warn!(error = %e, "dispatch time writer did not complete"),
        }
    }
}

/// Owned by a running dispatch loop.
///
/// If the loop is dropped before it drains (its runtime shut down, or the
/// spawn was refused), this clears `running` so the next `add` starts a fresh
/// loop, and drops every stranded entry so its caller settles with
/// [`QueueError::Abandoned`].
struct LoopGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl LoopGuard {
    fn new(inner: Arc<Inner>) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let stranded = {
            let mut state = self.inner.lock();
            state.running = false;
            std::mem::take(&mut state.waiting)
        };
        if !stranded.is_empty() {
            warn!(
                stranded = stranded.len(),
                "dispatch loop stopped before draining; abandoning queued requests"
            );
        }
        // Jobs are dropped outside the lock; their captures may call back into the queue.
        drop(stranded);
    }
}

/// Drains the waiting list one task at a time, honoring the minimum spacing.
///
/// Exits once the list is empty; the next [`RequestQueue::add`] starts a new
/// loop. The empty check and the `running` reset happen under the same lock
/// as `add`'s push, so an entry is never stranded.
async fn dispatch_loop(mut guard: LoopGuard) {
    let inner = Arc::clone(&guard.inner);

    loop {
        let wait = {
            let mut state = inner.lock();
            if state.waiting.is_empty() {
                state.running = false;
                debug!("request queue drained");
                None
            } else {
                Some(inner.pacing_wait(state.last_dispatch))
            }
        };
        let Some(wait) = wait else {
            guard.disarm();
            return;
        };

        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "pacing next dispatch");
            sleep(wait).await;
        }

        // Entries added during the wait compete here, so a late high-priority
        // request still goes ahead of older low-priority ones.
        let next = {
            let mut state = inner.lock();
            match state.waiting.pop() {
                Some(entry) => {
                    state.last_dispatch = Some(Instant::now());
                    Some((entry, state.waiting.len()))
                }
                None => {
                    state.running = false;
                    None
                }
            }
        };
        let Some((entry, pending)) = next else {
            guard.disarm();
            return;
        };

        inner.persist_dispatch().await;

        let priority = entry.priority;
        debug!(priority, pending, "dispatching request");

        // Run on its own task so a panicking request cannot take the loop down.
        if let Err(e) = tokio::spawn((entry.job)()).await {
            warn!(priority, error = %e, "queued request did not complete");
        }
    }
}

// Converts the persisted wall-clock time into a monotonic instant.
fn restore_last_dispatch(store: &dyn DispatchStore, key: &str) -> Option<Instant> {
    let stored = match store.load(key) {
        Ok(Some(at)) => at,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "failed to read last dispatch time; starting unpaced");
            return None;
        }
    };

    let now = Instant::now();
    match SystemTime::now().duration_since(stored) {
        Ok(elapsed) => now.checked_sub(elapsed),
        // A timestamp from the future (clock moved backwards) counts as "just now".
        Err(_) => Some(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransportError};
    use crate::storage::StoreError;

    type Log = Arc<Mutex<Vec<(&'static str, Instant)>>>;

    const GAP: Duration = Duration::from_millis(100);

    fn queue() -> RequestQueue {
        RequestQueue::in_memory(QueueConfig::default().min_delay(GAP))
    }

    // A task that records its label and dispatch time when it starts.
    fn record(
        log: &Log,
        label: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<Result<&'static str, Error>> + Send + 'static {
        let log = Arc::clone(log);
        move || {
            log.lock().unwrap().push((label, Instant::now()));
            std::future::ready(Ok(label))
        }
    }

    fn labels(log: &Log) -> Vec<&'static str> {
        log.lock().unwrap().iter().map(|(l, _)| *l).collect()
    }

    fn offsets(log: &Log, start: Instant) -> Vec<Duration> {
        log.lock()
            .unwrap()
            .iter()
            .map(|(_, at)| at.duration_since(start))
            .collect()
    }

    struct FailingStore;

    impl DispatchStore for FailingStore {
        fn load(&self, _key: &str) -> Result<Option<SystemTime>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("storage unavailable")))
        }

        fn save(&self, _key: &str, _at: SystemTime) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("storage unavailable")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_priorities_dispatch_in_order_and_paced() {
        let q = queue();
        let log = Log::default();
        let start = Instant::now();

        let t1 = q.add(record(&log, "t1"), 1);
        let t2 = q.add(record(&log, "t2"), 5);
        let t3 = q.add(record(&log, "t3"), 1);
        let (r1, r2, r3) = tokio::join!(t1, t2, t3);

        assert_eq!((r1.unwrap(), r2.unwrap(), r3.unwrap()), ("t1", "t2", "t3"));
        assert_eq!(labels(&log), vec!["t2", "t1", "t3"]);

        let at = offsets(&log, start);
        assert!(at[0] < Duration::from_millis(10));
        assert!(at[1] >= GAP && at[1] < GAP + Duration::from_millis(10));
        assert!(at[2] >= GAP * 2 && at[2] < GAP * 2 + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_dispatched_first() {
        let q = queue();
        let log = Log::default();

        let a = q.add(record(&log, "a"), 5);
        let b = q.add(record(&log, "b"), 10);
        let _ = tokio::join!(a, b);

        assert_eq!(labels(&log), vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_is_fifo() {
        let q = queue();
        let log = Log::default();

        let a = q.add(record(&log, "a"), 3);
        let b = q.add(record(&log, "b"), 3);
        let c = q.add(record(&log, "c"), 3);
        let _ = tokio::join!(a, b, c);

        assert_eq!(labels(&log), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_does_not_block_the_next() {
        let q = queue();
        let log = Log::default();

        let failing = q.add(
            || async {
                Err::<&'static str, _>(Error::from(TransportError::Http {
                    status: 400,
                    message: "bad request".into(),
                }))
            },
            10,
        );
        let next = q.add(record(&log, "next"), 1);

        let (failed, ok) = tokio::join!(failing, next);
        assert!(matches!(
            failed,
            Err(Error::Transport(TransportError::Http { status: 400, .. }))
        ));
        assert_eq!(ok.unwrap(), "next");
    }

    #[tokio::test(start_paused = true)]
    async fn late_high_priority_overtakes_waiting_entries() {
        let q = queue();
        let log = Log::default();
        let start = Instant::now();

        let first = q.add(record(&log, "first"), 1);
        let low = q.add(record(&log, "low"), 1);
        first.await.unwrap();

        // The loop is now pacing before `low`; this arrives during that wait.
        let urgent = q.add(record(&log, "urgent"), 10);
        let _ = tokio::join!(low, urgent);

        assert_eq!(labels(&log), vec!["first", "urgent", "low"]);
        let at = offsets(&log, start);
        assert!(at[1] - at[0] >= GAP);
        assert!(at[2] - at[1] >= GAP);
    }

    #[tokio::test(start_paused = true)]
    async fn gaps_hold_when_tasks_are_slow_or_late() {
        let q = queue();
        let log = Log::default();

        let log_slow = Arc::clone(&log);
        let slow = q.add(
            move || async move {
                log_slow.lock().unwrap().push(("slow", Instant::now()));
                sleep(Duration::from_millis(250)).await;
                Ok::<_, Error>("slow")
            },
            1,
        );
        let quick = q.add(record(&log, "quick"), 1);
        let _ = tokio::join!(slow, quick);

        sleep(Duration::from_millis(30)).await;
        q.add(record(&log, "late"), 1).await.unwrap();

        let log = log.lock().unwrap();
        for pair in log.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= GAP);
        }
        // The slow task ran past the gap, so `quick` started as soon as it finished.
        assert!(log[1].1.duration_since(log[0].1) >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_storage_does_not_affect_dispatch() {
        let q = RequestQueue::new(QueueConfig::default().min_delay(GAP), Arc::new(FailingStore));
        let log = Log::default();
        let start = Instant::now();

        let a = q.add(record(&log, "a"), 1);
        let b = q.add(record(&log, "b"), 1);
        let (ra, rb) = tokio::join!(a, b);

        assert!(ra.is_ok() && rb.is_ok());
        let at = offsets(&log, start);
        assert!(at[0] < Duration::from_millis(10));
        assert!(at[1] >= GAP);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_dispatch_time_paces_a_restarted_queue() {
        let store: Arc<dyn DispatchStore> = Arc::new(MemoryStore::new());
        let config = QueueConfig::default().min_delay(Duration::from_secs(2));

        let before = RequestQueue::new(config.clone(), Arc::clone(&store));
        before.add(|| async { Ok::<_, Error>(()) }, 1).await.unwrap();
        assert!(store.load(&config.storage_key).unwrap().is_some());

        let restarted = RequestQueue::new(config, store);
        let log = Log::default();
        let start = Instant::now();
        restarted.add(record(&log, "after"), 1).await.unwrap();

        assert!(offsets(&log, start)[0] >= Duration::from_millis(1900));
    }

    #[tokio::test(start_paused = true)]
    async fn no_stored_time_means_no_initial_delay() {
        let q = RequestQueue::in_memory(QueueConfig::default());
        let log = Log::default();
        let start = Instant::now();

        q.add(record(&log, "first"), 1).await.unwrap();
        assert!(offsets(&log, start)[0] < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_settles_as_abandoned() {
        let q = queue();
        let log = Log::default();

        let boom = q.add(
            || async {
                if true {
                    panic!("task blew up");
                }
                Ok::<(), Error>(())
            },
            5,
        );
        let after = q.add(record(&log, "after"), 1);

        let (boom, after) = tokio::join!(boom, after);
        assert!(matches!(boom, Err(Error::Queue(QueueError::Abandoned))));
        assert_eq!(after.unwrap(), "after");
    }

    #[tokio::test(start_paused = true)]
    async fn loop_rearms_after_draining() {
        let q = queue();
        let log = Log::default();

        q.add(record(&log, "one"), 1).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(!q.is_dispatching());
        assert_eq!(q.pending(), 0);

        let resumed = Instant::now();
        q.add(record(&log, "two"), 1).await.unwrap();
        assert_eq!(labels(&log), vec!["one", "two"]);
        assert!(offsets(&log, resumed)[1] < Duration::from_millis(10));
    }

    fn paused_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn queue_recovers_after_its_runtime_shuts_down() {
        let q = queue();

        let first = paused_runtime();
        let stranded = first.block_on(async {
            let a = q.add(|| async { Ok::<_, Error>("a") }, 1);
            let b = q.add(|| async { Ok::<_, Error>("b") }, 1);
            assert_eq!(a.await.unwrap(), "a");
            // The loop is now pacing before `b`.
            b
        });
        drop(first);

        assert!(!q.is_dispatching());
        assert_eq!(q.pending(), 0);

        let second = paused_runtime();
        second.block_on(async {
            assert!(matches!(
                stranded.await,
                Err(Error::Queue(QueueError::Abandoned))
            ));
            let c = q.add(|| async { Ok::<_, Error>("c") }, 1).await;
            assert_eq!(c.unwrap(), "c");
        });
    }

    #[test]
    fn add_outside_a_runtime_leaves_the_queue_untouched() {
        let q = queue();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = q.add(|| async { Ok::<_, Error>(()) }, 1);
        }));
        assert!(outcome.is_err());
        assert_eq!(q.pending(), 0);
        assert!(!q.is_dispatching());
    }

    #[tokio::test]
    async fn dispatch_time_is_written_off_the_runtime_thread() {
        struct ThreadRecordingStore(Mutex<Option<std::thread::ThreadId>>);

        impl DispatchStore for ThreadRecordingStore {
            fn load(&self, _key: &str) -> Result<Option<SystemTime>, StoreError> {
                Ok(None)
            }

            fn save(&self, _key: &str, _at: SystemTime) -> Result<(), StoreError> {
                *self.0.lock().unwrap() = Some(std::thread::current().id());
                Ok(())
            }
        }

        let store = Arc::new(ThreadRecordingStore(Mutex::new(None)));
        let q = RequestQueue::new(QueueConfig::default().min_delay(GAP), store.clone());
        q.add(|| async { Ok::<_, Error>(()) }, 1).await.unwrap();

        // The current-thread runtime drives everything on the test thread.
        let writer = store.0.lock().unwrap().expect("dispatch time was saved");
        assert_ne!(writer, std::thread::current().id());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_counts_waiting_entries() {
        let q = queue();
        let a = q.add(|| async { Ok::<_, Error>(()) }, 1);
        let b = q.add(|| async { Ok::<_, Error>(()) }, 1);
        assert_eq!(q.pending(), 2);
        assert!(q.is_dispatching());

        let _ = tokio::join!(a, b);
        assert_eq!(q.pending(), 0);
    }
}
