//! # Worker Pool
//!
//! A fixed-but-resizable set of executors draining one shared FIFO queue.
//!
//! ## Locking
//!
//! Three independent locks, never held across an `.await`:
//! - `state`: running flag and the executor list
//! - `queue`: tasks waiting for an executor
//! - `executing`: tasks an executor is currently running (its length is the
//!   running-task counter)
//!
//! When two are needed the order is `state -> queue -> executing`. A task moves
//! from `queue` to `executing` while the queue lock is held, so it is always
//! visible in exactly one of the two.
//!
//! ## Executor Loop
//!
//! Each executor is a tokio task that pops the oldest queued task, runs it to
//! completion and repeats. An idle executor waits on a shared [`Notify`] with a
//! timeout so a missed wake-up only costs one re-check interval.
//!
//! Executors outlive a pause: while the pool is stopped they keep their slot
//! but pick nothing, so a pause followed by a start never runs more tasks than
//! there are slots. An executor only exits once it is removed from the pool
//! or the pool is dropped, and always after its current task.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::task::{same_task, TaskRef};
use crate::common::error::CapacityError;

/// Default interval after which an idle executor re-checks the queue.
pub const DEFAULT_IDLE_RECHECK: Duration = Duration::from_millis(100);

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolLoad {
    pub running: usize,
    pub waiting: usize,
}

impl PoolLoad {
    pub fn total(&self) -> usize {
        self.running + self.waiting
    }
}

/// Callback invoked after every enqueue, dequeue and completion.
pub type LoadListener = Arc<dyn Fn(PoolLoad) + Send + Sync>;

/// Bounded-concurrency task executor with a shared queue, live resizing and
/// cooperative pause.
///
/// Must be started from within a tokio runtime.
///
/// # Example
/// ```ignore
/// let pool = WorkerPool::new(4);
/// pool.start();
/// pool.add_task(Arc::new(MyTask::new()));
/// pool.pause();
/// pool.wait_until_paused().await;
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<PoolState>,
    queue: Mutex<VecDeque<TaskRef>>,
    executing: Mutex<Vec<TaskRef>>,
    /// Signalled when a task is queued or executors must re-check their stop flag
    available: Notify,
    /// Signalled when the last executing task completes
    drained: Notify,
    listener: Mutex<Option<LoadListener>>,
    idle_recheck: Duration,
}

struct PoolState {
    running: bool,
    executors: Vec<Arc<Executor>>,
    next_executor_id: usize,
}

struct Executor {
    id: usize,
    stop: AtomicBool,
    spawned: AtomicBool,
}

impl Executor {
    fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            stop: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
        })
    }

    /// Marks the executor as spawned; true only for the first caller.
    fn claim_spawn(&self) -> bool {
        !self.spawned.swap(true, Ordering::AcqRel)
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl PoolState {
    fn new_executor(&mut self) -> Arc<Executor> {
        let executor = Executor::new(self.next_executor_id);
        self.next_executor_id += 1;
        executor
    }
}

impl WorkerPool {
    /// Create a stopped pool with `size` executors (at least one).
    pub fn new(size: usize) -> Self {
        Self::with_idle_recheck(size, DEFAULT_IDLE_RECHECK)
    }

    pub fn with_idle_recheck(size: usize, idle_recheck: Duration) -> Self {
        let mut state = PoolState {
            running: false,
            executors: Vec::new(),
            next_executor_id: 0,
        };
        for _ in 0..size.max(1) {
            let executor = state.new_executor();
            state.executors.push(executor);
        }

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                queue: Mutex::new(VecDeque::new()),
                executing: Mutex::new(Vec::new()),
                available: Notify::new(),
                drained: Notify::new(),
                listener: Mutex::new(None),
                idle_recheck,
            }),
        }
    }

    /// Register the callback that observes every load change.
    pub fn set_load_listener(&self, listener: LoadListener) {
        *self.shared.listener.lock() = Some(listener);
    }

    /// Start every executor. Has no effect if the pool is already running.
    pub fn start(&self) {
        let mut state = self.shared.state.lock();
        if state.running {
            return;
        }
        state.running = true;

        for executor in &state.executors {
            spawn_executor(&self.shared, executor);
        }
        info!("▶️  Worker pool started with {} executor(s)", state.executors.len());
        drop(state);

        self.shared.available.notify_waiters();
    }

    /// Stop picking new work. Executors finish their current task first;
    /// queued tasks stay queued until the next [`start`](Self::start).
    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        drop(state);

        info!("⏸️  Worker pool paused");
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// True iff the pool is stopped and no task is executing.
    pub fn is_paused(&self) -> bool {
        let state = self.shared.state.lock();
        !state.running && self.shared.executing.lock().is_empty()
    }

    /// Wait until [`is_paused`](Self::is_paused) holds.
    pub async fn wait_until_paused(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.is_paused() {
                return;
            }
            let _ = tokio::time::timeout(self.shared.idle_recheck, drained).await;
        }
    }

    /// Queue `task` unless the same task is already queued.
    ///
    /// Returns `true` if the task was queued.
    pub fn add_task(&self, task: TaskRef) -> bool {
        {
            let mut queue = self.shared.queue.lock();
            if queue.iter().any(|queued| same_task(queued, &task)) {
                debug!("Task '{}' already queued, ignoring", task.label());
                return false;
            }
            queue.push_back(task);
        }
        self.shared.available.notify_one();
        self.shared.publish_load();
        true
    }

    /// Remove a queued task. A task that is currently executing is not removed.
    pub fn remove_task(&self, task: &TaskRef) -> bool {
        let removed = {
            let mut queue = self.shared.queue.lock();
            let executing = self.shared.executing.lock();
            if executing.iter().any(|running| same_task(running, task)) {
                false
            } else if let Some(position) = queue.iter().position(|queued| same_task(queued, task)) {
                queue.remove(position);
                true
            } else {
                false
            }
        };

        if removed {
            self.shared.publish_load();
        }
        removed
    }

    /// Drop every queued (not executing) task; returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let dropped: Vec<TaskRef> = self.shared.queue.lock().drain(..).collect();
        if !dropped.is_empty() {
            self.shared.publish_load();
        }
        dropped.len()
    }

    pub fn is_task_running(&self, task: &TaskRef) -> bool {
        self.shared
            .executing
            .lock()
            .iter()
            .any(|running| same_task(running, task))
    }

    /// Add executors; they start immediately if the pool is running.
    pub fn add_executors(&self, count: usize) {
        let mut state = self.shared.state.lock();
        for _ in 0..count {
            let executor = state.new_executor();
            if state.running {
                spawn_executor(&self.shared, &executor);
            }
            state.executors.push(executor);
        }
        info!("➕ Worker pool resized to {} executor(s)", state.executors.len());
    }

    /// Remove executors. Refuses any request that would leave the pool empty;
    /// removed executors finish their current task before stopping.
    pub fn remove_executors(&self, count: usize) -> Result<(), CapacityError> {
        let mut state = self.shared.state.lock();
        let size = state.executors.len();
        if count >= size {
            let err = CapacityError::MinExecutors {
                requested: count,
                size,
            };
            warn!("⚠️  {}", err);
            return Err(err);
        }

        for _ in 0..count {
            if let Some(executor) = state.executors.pop() {
                executor.stop();
            }
        }
        info!("➖ Worker pool resized to {} executor(s)", state.executors.len());
        drop(state);

        self.shared.available.notify_waiters();
        Ok(())
    }

    /// Number of executors.
    pub fn size(&self) -> usize {
        self.shared.state.lock().executors.len()
    }

    pub fn running_tasks(&self) -> usize {
        self.shared.executing.lock().len()
    }

    pub fn waiting_tasks(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn load(&self) -> PoolLoad {
        self.shared.load()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.running = false;
        for executor in state.executors.drain(..) {
            executor.stop();
        }
        drop(state);

        self.shared.available.notify_waiters();
    }
}

impl Shared {
    fn load(&self) -> PoolLoad {
        let running = self.executing.lock().len();
        let waiting = self.queue.lock().len();
        PoolLoad { running, waiting }
    }

    fn publish_load(&self) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(self.load());
        }
    }

    /// Pop the oldest task and mark it executing in one step. Picks nothing
    /// while the pool is paused.
    fn pick_next(&self) -> Option<TaskRef> {
        let state = self.state.lock();
        if !state.running {
            return None;
        }
        let mut queue = self.queue.lock();
        let task = queue.pop_front()?;
        self.executing.lock().push(task.clone());
        Some(task)
    }

    fn finish(&self, task: &TaskRef) {
        let now_empty = {
            let mut executing = self.executing.lock();
            if let Some(position) = executing.iter().position(|running| same_task(running, task)) {
                executing.swap_remove(position);
            }
            executing.is_empty()
        };
        if now_empty {
            self.drained.notify_waiters();
        }
    }
}

fn spawn_executor(shared: &Arc<Shared>, executor: &Arc<Executor>) {
    if executor.claim_spawn() {
        tokio::spawn(run_executor(shared.clone(), executor.clone()));
    }
}

async fn run_executor(shared: Arc<Shared>, executor: Arc<Executor>) {
    debug!("Executor {} started", executor.id);

    while !executor.is_stopped() {
        let idle = shared.available.notified();
        let task = match shared.pick_next() {
            Some(task) => task,
            None => {
                let _ = tokio::time::timeout(shared.idle_recheck, idle).await;
                continue;
            }
        };

        shared.publish_load();

        let label = task.label();
        // Run on its own tokio task so a panic is contained and reported here.
        if let Err(e) = tokio::spawn(task.clone().run()).await {
            error!("❌ Executor {} task '{}' failed: {}", executor.id, label, e);
        }

        shared.finish(&task);
        shared.publish_load();
    }

    debug!("Executor {} stopped", executor.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::task::{PoolTask, TaskFuture};
    use tokio::sync::Semaphore;

    /// Records its id when it runs; blocks on `gate` first if one is given.
    struct Recorder {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
        gate: Option<Arc<Semaphore>>,
    }

    impl PoolTask for Recorder {
        fn run(self: Arc<Self>) -> TaskFuture {
            Box::pin(async move {
                if let Some(gate) = &self.gate {
                    let _permit = gate.acquire().await.unwrap();
                }
                self.log.lock().push(self.id);
            })
        }
    }

    struct Panics;

    impl PoolTask for Panics {
        fn run(self: Arc<Self>) -> TaskFuture {
            Box::pin(async { panic!("task blew up") })
        }
    }

    fn recorded(id: usize, log: &Arc<Mutex<Vec<usize>>>, gate: Option<&Arc<Semaphore>>) -> TaskRef {
        Arc::new(Recorder {
            id,
            log: log.clone(),
            gate: gate.cloned(),
        })
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached within 5s");
    }

    fn small_pool(size: usize) -> WorkerPool {
        WorkerPool::with_idle_recheck(size, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_same_task_is_queued_once() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = recorded(1, &log, None);

        assert!(pool.add_task(task.clone()));
        assert!(!pool.add_task(task.clone()));
        assert_eq!(pool.waiting_tasks(), 1);

        // A different task with identical contents is a different task.
        assert!(pool.add_task(recorded(1, &log, None)));
        assert_eq!(pool.waiting_tasks(), 2);
    }

    #[tokio::test]
    async fn test_remove_executors_keeps_at_least_one() {
        let pool = small_pool(2);

        assert_eq!(
            pool.remove_executors(2),
            Err(CapacityError::MinExecutors { requested: 2, size: 2 })
        );
        assert_eq!(pool.size(), 2);

        assert!(pool.remove_executors(1).is_ok());
        assert_eq!(pool.size(), 1);
        assert!(pool.remove_executors(1).is_err());
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_removed_executor_finishes_current_task() {
        let pool = small_pool(2);
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        let blocker = recorded(1, &log, Some(&gate));

        pool.start();
        pool.add_task(blocker.clone());
        eventually(|| pool.is_task_running(&blocker)).await;

        assert!(pool.remove_executors(1).is_ok());
        assert_eq!(pool.size(), 1);
        assert!(pool.is_task_running(&blocker));

        gate.add_permits(1);
        eventually(|| log.lock().contains(&1)).await;
        eventually(|| pool.running_tasks() == 0).await;

        // The remaining executor still serves new work.
        pool.add_task(recorded(2, &log, None));
        eventually(|| log.lock().len() == 2).await;
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_task_wakes_one_idle_executor() {
        // Re-checks are too slow to matter: only the wake-up can start work.
        let pool = WorkerPool::with_idle_recheck(3, Duration::from_secs(30));
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));

        pool.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = recorded(1, &log, Some(&gate));
        pool.add_task(first.clone());
        eventually(|| pool.is_task_running(&first)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.running_tasks(), 1);
        assert_eq!(pool.waiting_tasks(), 0);

        // Each later task still finds an idle executor to wake.
        let second = recorded(2, &log, Some(&gate));
        pool.add_task(second.clone());
        eventually(|| pool.is_task_running(&second)).await;
        assert_eq!(pool.running_tasks(), 2);

        let third = recorded(3, &log, Some(&gate));
        pool.add_task(third.clone());
        eventually(|| pool.is_task_running(&third)).await;
        assert_eq!(pool.running_tasks(), 3);

        gate.add_permits(3);
        eventually(|| log.lock().len() == 3).await;
    }

    #[tokio::test]
    async fn test_zero_size_pool_gets_one_executor() {
        assert_eq!(small_pool(0).size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_executor_runs_fifo() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..5 {
            pool.add_task(recorded(id, &log, None));
        }

        pool.start();
        eventually(|| log.lock().len() == 5).await;
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_is_paused_waits_for_running_task() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        let task = recorded(7, &log, Some(&gate));

        pool.start();
        pool.add_task(task.clone());
        eventually(|| pool.is_task_running(&task)).await;

        pool.pause();
        assert!(!pool.is_running());
        assert!(!pool.is_paused(), "a task is still executing");

        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), pool.wait_until_paused())
            .await
            .unwrap();
        assert!(pool.is_paused());
        assert_eq!(*log.lock(), vec![7]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_during_drain_keeps_concurrency_bound() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        let blocker = recorded(1, &log, Some(&gate));

        pool.start();
        pool.add_task(blocker.clone());
        eventually(|| pool.is_task_running(&blocker)).await;

        pool.pause();
        pool.start();
        pool.add_task(recorded(2, &log, None));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.running_tasks(), 1);
        assert_eq!(pool.waiting_tasks(), 1);
        assert!(log.lock().is_empty());

        gate.add_permits(1);
        eventually(|| log.lock().len() == 2).await;
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_paused_pool_keeps_queue_until_restart() {
        let pool = small_pool(2);
        let log = Arc::new(Mutex::new(Vec::new()));

        pool.start();
        pool.pause();
        pool.wait_until_paused().await;

        pool.add_task(recorded(1, &log, None));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().is_empty());
        assert_eq!(pool.waiting_tasks(), 1);

        pool.start();
        eventually(|| log.lock().len() == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_task_refuses_running_task() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        let blocker = recorded(1, &log, Some(&gate));
        let queued = recorded(2, &log, None);

        pool.start();
        pool.add_task(blocker.clone());
        eventually(|| pool.is_task_running(&blocker)).await;
        pool.add_task(queued.clone());

        assert!(!pool.remove_task(&blocker));
        assert!(pool.remove_task(&queued));
        assert!(!pool.remove_task(&queued));

        gate.add_permits(1);
        eventually(|| pool.running_tasks() == 0).await;
        assert_eq!(*log.lock(), vec![1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_added_executor_starts_while_running() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        let blocker = recorded(1, &log, Some(&gate));

        pool.start();
        pool.add_task(blocker.clone());
        eventually(|| pool.is_task_running(&blocker)).await;
        pool.add_task(recorded(2, &log, None));

        pool.add_executors(1);
        assert_eq!(pool.size(), 2);
        eventually(|| log.lock().contains(&2)).await;

        gate.add_permits(1);
        eventually(|| log.lock().len() == 2).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_task_does_not_kill_executor() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        pool.start();
        pool.add_task(Arc::new(Panics));
        pool.add_task(recorded(3, &log, None));

        eventually(|| log.lock().len() == 1).await;
        eventually(|| pool.running_tasks() == 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_listener_sees_queue_and_completion() {
        let pool = small_pool(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pool.set_load_listener(Arc::new(move |load| sink.lock().push(load)));

        let log = Arc::new(Mutex::new(Vec::new()));
        pool.add_task(recorded(1, &log, None));
        assert_eq!(seen.lock()[0], PoolLoad { running: 0, waiting: 1 });

        pool.start();
        eventually(|| seen.lock().last() == Some(&PoolLoad::default())).await;
        assert!(seen.lock().contains(&PoolLoad { running: 1, waiting: 0 }));
    }

    #[tokio::test]
    async fn test_clear_queue_drops_waiting_tasks() {
        let pool = small_pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        pool.add_task(recorded(1, &log, None));
        pool.add_task(recorded(2, &log, None));

        assert_eq!(pool.clear_queue(), 2);
        assert_eq!(pool.load(), PoolLoad::default());
    }
}
