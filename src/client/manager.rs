//! # Job Manager
//!
//! Keeps the client's [`Dispatcher`]s by name so several images can be
//! prepared, started and cancelled independently while sharing one fleet.
//!
//! Names are unique. Jobs are kept in the order they were added, which is
//! also the order `start_all` and `cancel_all` visit them in.
//!
//! ```rust,ignore
//! let jobs = JobManager::new(sink);
//! jobs.add(Dispatcher::new("cat", cat, 2, 2, registry.clone(), options.clone(), sink.clone())?)?;
//! jobs.add(Dispatcher::new("dog", dog, 2, 2, registry, options, sink.clone())?)?;
//! jobs.start_all();
//! for job in jobs.jobs() {
//!     job.wait().await;
//! }
//! ```

use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::JobState;
use crate::common::error::DispatchError;
use crate::common::events::{Event, SharedSink};

pub struct JobManager {
    jobs: Mutex<Vec<Arc<Dispatcher>>>,
    sink: SharedSink,
}

impl JobManager {
    pub fn new(sink: SharedSink) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// Register a prepared job under its own name.
    ///
    /// # Errors
    /// [`DispatchError::DuplicateJob`] if a job with that name is already held.
    pub fn add(&self, dispatcher: Dispatcher) -> Result<Arc<Dispatcher>, DispatchError> {
        let mut jobs = self.jobs.lock();
        if jobs.iter().any(|job| job.name() == dispatcher.name()) {
            return Err(DispatchError::DuplicateJob(dispatcher.name().to_string()));
        }

        let job = Arc::new(dispatcher);
        info!("📥 Added job {}", job.name());
        jobs.push(job.clone());
        Ok(job)
    }

    /// Start the named job. `false` if it is unknown or its previous run still
    /// has live workers.
    pub fn start(&self, name: &str) -> bool {
        match self.get(name) {
            Some(job) => job.start(),
            None => {
                self.unknown(name);
                false
            }
        }
    }

    pub fn cancel(&self, name: &str) -> bool {
        match self.get(name) {
            Some(job) => {
                job.cancel();
                true
            }
            None => {
                self.unknown(name);
                false
            }
        }
    }

    /// Drop the named job, cancelling it first if it is running.
    pub fn remove(&self, name: &str) -> Option<Arc<Dispatcher>> {
        let mut jobs = self.jobs.lock();
        let Some(index) = jobs.iter().position(|job| job.name() == name) else {
            drop(jobs);
            self.unknown(name);
            return None;
        };

        let job = jobs.remove(index);
        if job.state() == JobState::Running {
            job.cancel();
        }
        info!("🗑️  Removed job {}", name);
        Some(job)
    }

    /// Start every job that is not already running. Returns how many started.
    pub fn start_all(&self) -> usize {
        let mut started = 0;
        for job in self.jobs() {
            if job.state() != JobState::Running && job.start() {
                started += 1;
            }
        }
        info!("🚀 Started {} job(s)", started);
        started
    }

    /// Cancel every running job. Returns how many were asked to stop.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for job in self.jobs() {
            if job.state() == JobState::Running {
                job.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn get(&self, name: &str) -> Option<Arc<Dispatcher>> {
        self.jobs.lock().iter().find(|job| job.name() == name).cloned()
    }

    /// Snapshot of the held jobs, in insertion order.
    pub fn jobs(&self) -> Vec<Arc<Dispatcher>> {
        self.jobs.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.jobs.lock().iter().map(|job| job.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    fn unknown(&self, name: &str) {
        warn!("⚠️  No job named {}", name);
        self.sink.publish(Event::Warning {
            message: format!("no job named {}", name),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DispatchOptions;
    use crate::common::events::null_sink;
    use crate::processing::codec::tests::gradient;
    use crate::registry::LoadRegistry;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn options(dir: &TempDir) -> DispatchOptions {
        DispatchOptions {
            output_dir: dir.path().join("out"),
            request_timeout: Duration::from_secs(60),
            retry_rounds: 1,
            retry_delay: Duration::from_millis(10),
        }
    }

    /// A registry whose only server accepts connections and never answers,
    /// so started jobs stay `Running` until cancelled.
    async fn stalled_registry(dir: &TempDir) -> (TcpListener, Arc<LoadRegistry>) {
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Arc::new(LoadRegistry::open(dir.path().join("load")).await.unwrap());
        registry
            .add_entry(silent.local_addr().unwrap().port(), 0, 0)
            .await
            .unwrap();
        (silent, registry)
    }

    fn job(name: &str, registry: &Arc<LoadRegistry>, dir: &TempDir) -> Dispatcher {
        Dispatcher::new(name, gradient(2, 2), 1, 1, registry.clone(), options(dir), null_sink()).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (_silent, registry) = stalled_registry(&dir).await;
        let jobs = JobManager::new(null_sink());

        jobs.add(job("cat", &registry, &dir)).unwrap();
        assert!(matches!(
            jobs.add(job("cat", &registry, &dir)),
            Err(DispatchError::DuplicateJob(name)) if name == "cat"
        ));
        jobs.add(job("dog", &registry, &dir)).unwrap();
        assert_eq!(jobs.names(), vec!["cat".to_string(), "dog".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_name_is_a_warning() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let jobs = JobManager::new(Arc::new(tx));

        assert!(!jobs.start("ghost"));
        assert!(!jobs.cancel("ghost"));
        assert!(jobs.remove("ghost").is_none());

        let warnings = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| matches!(event, Event::Warning { .. }))
            .count();
        assert_eq!(warnings, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_refused_while_running_and_cancel_by_name() {
        let dir = TempDir::new().unwrap();
        let (_silent, registry) = stalled_registry(&dir).await;
        let jobs = JobManager::new(null_sink());
        let cat = jobs.add(job("cat", &registry, &dir)).unwrap();

        assert!(jobs.start("cat"));
        assert!(!jobs.start("cat"));
        assert_eq!(cat.state(), JobState::Running);

        assert!(jobs.cancel("cat"));
        let state = tokio::time::timeout(Duration::from_secs(5), cat.wait()).await.unwrap();
        assert_eq!(state, JobState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_cancels_running_job() {
        let dir = TempDir::new().unwrap();
        let (_silent, registry) = stalled_registry(&dir).await;
        let jobs = JobManager::new(null_sink());
        jobs.add(job("cat", &registry, &dir)).unwrap();

        assert!(jobs.start("cat"));
        let removed = jobs.remove("cat").unwrap();
        assert!(jobs.is_empty());

        let state = tokio::time::timeout(Duration::from_secs(5), removed.wait()).await.unwrap();
        assert_eq!(state, JobState::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_all_and_cancel_all() {
        let dir = TempDir::new().unwrap();
        let (_silent, registry) = stalled_registry(&dir).await;
        let jobs = JobManager::new(null_sink());
        for name in ["a", "b", "c"] {
            jobs.add(job(name, &registry, &dir)).unwrap();
        }

        assert!(jobs.start("b"));
        assert_eq!(jobs.start_all(), 2);
        assert_eq!(jobs.start_all(), 0);
        assert_eq!(jobs.cancel_all(), 3);

        for job in jobs.jobs() {
            let state = tokio::time::timeout(Duration::from_secs(5), job.wait()).await.unwrap();
            assert_eq!(state, JobState::Cancelled);
        }
        assert_eq!(jobs.cancel_all(), 0);
    }
}
