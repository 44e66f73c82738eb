use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by [`PoolTask::run`].
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A unit of work a [`WorkerPool`](super::WorkerPool) can execute.
///
/// Tasks are shared as [`TaskRef`]s and compared by identity: two handles are
/// the same task iff they point to the same allocation. Failures are the
/// task's own business; the pool only logs a panic.
pub trait PoolTask: Send + Sync + 'static {
    fn run(self: Arc<Self>) -> TaskFuture;

    /// Label used in pool logs.
    fn label(&self) -> String {
        "task".to_string()
    }
}

pub type TaskRef = Arc<dyn PoolTask>;

/// Identity comparison that ignores vtable pointers.
pub(crate) fn same_task(a: &TaskRef, b: &TaskRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
