//! Bounded background task execution.
//!
//! A semaphore caps dataset-level concurrency; submissions beyond the cap
//! queue instead of erroring. Terminal outcomes are write-once per dataset
//! id, and only the most recent ones are retained.

use crate::ml::processor::MlProcessor;
use crate::structs::{Error, ProcessingConfig, ProcessingResult, Result, TaskStatus};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_MAX_RESULTS: usize = 10;

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct StoredResult {
    dataset_id: String,
    status: TaskStatus,
    completed: Instant,
}

pub struct AsyncTaskManager {
    semaphore: Arc<Semaphore>,
    running: Mutex<HashMap<String, RunningTask>>,
    /// Terminal outcomes in completion order, trimmed to `max_results`.
    results: Mutex<Vec<StoredResult>>,
    max_results: usize,
}

impl AsyncTaskManager {
    #[must_use]
    pub fn new(max_concurrent: usize, max_results: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: Mutex::new(HashMap::new()),
            results: Mutex::new(Vec::new()),
            max_results: max_results.max(1),
        })
    }

    #[must_use]
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RESULTS)
    }

    /// Submit a full processing run for background execution.
    ///
    /// # Errors
    /// Returns `Error::TaskConflict` when the id is already running or has
    /// a stored result.
    pub fn submit_processing(
        self: &Arc<Self>,
        dataset_id: &str,
        config: ProcessingConfig,
        records: Vec<Map<String, Value>>,
    ) -> Result<()> {
        let id = dataset_id.to_string();
        self.submit(dataset_id, move |token| async move {
            MlProcessor::new(config)
                .with_cancel(token)
                .process(&id, records)
                .await
        })
    }

    /// Submit arbitrary work under the concurrency cap. The work future
    /// receives the task's cancellation token.
    ///
    /// # Errors
    /// Returns `Error::TaskConflict` for duplicate ids.
    pub fn submit<F, Fut>(self: &Arc<Self>, dataset_id: &str, work: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<ProcessingResult>> + Send + 'static,
    {
        // The registry lock is held across the duplicate check, the spawn,
        // and the insert: a fast task cannot finish before its entry exists.
        let mut running = lock_poisoned(&self.running)?;
        if running.contains_key(dataset_id) {
            return Err(Error::TaskConflict(format!(
                "{dataset_id} is already running"
            )));
        }
        {
            let results = lock_poisoned(&self.results)?;
            if results.iter().any(|r| r.dataset_id == dataset_id) {
                return Err(Error::TaskConflict(format!(
                    "{dataset_id} already has a stored result"
                )));
            }
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let manager = Arc::clone(self);
        let id = dataset_id.to_string();
        let handle = tokio::spawn(async move {
            // Acquire inside the task so over-submission queues, never errors
            let permit = Arc::clone(&manager.semaphore).acquire_owned().await;
            let status = match permit {
                Err(e) => TaskStatus::Failed(format!("worker pool closed: {e}")),
                Ok(_permit) => match work(task_token.clone()).await {
                    Ok(result) => TaskStatus::Completed(Box::new(result)),
                    Err(Error::Cancelled(_)) => TaskStatus::Cancelled,
                    Err(e) => {
                        warn!(dataset_id = %id, error = %e, "task failed");
                        TaskStatus::Failed(e.to_string())
                    }
                },
            };
            manager.finish(&id, status);
        });

        running.insert(
            dataset_id.to_string(),
            RunningTask {
                handle,
                cancel: token,
            },
        );
        debug!(dataset_id, "task submitted");
        Ok(())
    }

    /// Current status for a dataset id.
    #[must_use]
    pub fn status(&self, dataset_id: &str) -> TaskStatus {
        if let Ok(results) = self.results.lock() {
            if let Some(stored) = results.iter().find(|r| r.dataset_id == dataset_id) {
                return stored.status.clone();
            }
        }
        if let Ok(running) = self.running.lock() {
            if running.contains_key(dataset_id) {
                return TaskStatus::Running;
            }
        }
        TaskStatus::NotFound
    }

    /// Cancel a running task: fires its token, aborts the handle, records
    /// the Cancelled outcome. In-flight numeric work finishes on its worker
    /// thread and is discarded.
    #[must_use]
    pub fn cancel(&self, dataset_id: &str) -> TaskStatus {
        let task = match self.running.lock() {
            Ok(mut running) => running.remove(dataset_id),
            Err(_) => None,
        };
        let Some(task) = task else {
            return self.status(dataset_id);
        };

        task.cancel.cancel();
        task.handle.abort();
        self.store(dataset_id, TaskStatus::Cancelled);
        info!(dataset_id, "task cancelled");
        TaskStatus::Cancelled
    }

    /// Number of currently registered (queued or executing) tasks.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.lock().map_or(0, |r| r.len())
    }

    fn finish(&self, dataset_id: &str, status: TaskStatus) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(dataset_id);
        }
        self.store(dataset_id, status);
    }

    /// Write-once store plus retention trim.
    fn store(&self, dataset_id: &str, status: TaskStatus) {
        let Ok(mut results) = self.results.lock() else {
            return;
        };
        if results.iter().any(|r| r.dataset_id == dataset_id) {
            return;
        }
        results.push(StoredResult {
            dataset_id: dataset_id.to_string(),
            status,
            completed: Instant::now(),
        });
        if results.len() > self.max_results {
            results.sort_by_key(|r| r.completed);
            let excess = results.len() - self.max_results;
            results.drain(..excess);
        }
    }
}

fn lock_poisoned<'a, T>(mutex: &'a Mutex<T>) -> Result<std::sync::MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::TaskConflict("task registry lock poisoned".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::ProcessingMetadata;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn empty_result() -> ProcessingResult {
        ProcessingResult {
            points: vec![],
            clusters: vec![],
            anomalies: vec![],
            metadata: ProcessingMetadata {
                total_points: 0,
                processing_time: 0.0,
                reduction_method: "pca".into(),
                clustering_method: "kmeans".into(),
                features_used: vec![],
                preprocessing_steps: vec![],
                performance: BTreeMap::new(),
            },
        }
    }

    async fn wait_terminal(manager: &Arc<AsyncTaskManager>, id: &str) -> TaskStatus {
        for _ in 0..200 {
            let status = manager.status(id);
            if !matches!(status, TaskStatus::Running) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.status(id)
    }

    #[tokio::test]
    async fn test_concurrency_cap_never_exceeded() {
        let manager = AsyncTaskManager::new(3, 10);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            manager
                .submit(&format!("task-{i}"), move |_token| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(empty_result())
                })
                .unwrap();
        }

        for i in 0..8 {
            wait_terminal(&manager, &format!("task-{i}")).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_over_submission_queues_without_error() {
        let manager = AsyncTaskManager::new(1, 10);
        for i in 0..5 {
            let outcome = manager.submit(&format!("q-{i}"), |_token| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(empty_result())
            });
            assert!(outcome.is_ok());
        }
        for i in 0..5 {
            let status = wait_terminal(&manager, &format!("q-{i}")).await;
            assert!(matches!(status, TaskStatus::Completed(_)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fast_completions_leave_registry_empty() {
        // Tasks that finish immediately must still clear their registry
        // entry, even when they complete before submit returns
        let manager = AsyncTaskManager::new(3, 10);
        for i in 0..500 {
            manager
                .submit(&format!("fast-{i}"), |_token| async { Ok(empty_result()) })
                .unwrap();
        }
        for i in 0..500 {
            wait_terminal(&manager, &format!("fast-{i}")).await;
        }
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_submit_conflicts() {
        let manager = AsyncTaskManager::with_defaults();
        manager
            .submit("dup", |_token| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(empty_result())
            })
            .unwrap();
        let second = manager.submit("dup", |_token| async { Ok(empty_result()) });
        assert!(matches!(second, Err(Error::TaskConflict(_))));
    }

    #[tokio::test]
    async fn test_cancel_records_cancelled() {
        let manager = AsyncTaskManager::with_defaults();
        manager
            .submit("slow", |token| async move {
                tokio::select! {
                    () = token.cancelled() => Err(Error::Cancelled("slow".into())),
                    () = tokio::time::sleep(Duration::from_secs(30)) => Ok(empty_result()),
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(manager.cancel("slow"), TaskStatus::Cancelled));
        assert!(matches!(manager.status("slow"), TaskStatus::Cancelled));
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_not_found() {
        let manager = AsyncTaskManager::with_defaults();
        assert!(matches!(manager.cancel("ghost"), TaskStatus::NotFound));
    }

    #[tokio::test]
    async fn test_failed_task_stores_error() {
        let manager = AsyncTaskManager::with_defaults();
        manager
            .submit("boom", |_token| async {
                Err(Error::Algorithm("numerical blowup".into()))
            })
            .unwrap();
        let status = wait_terminal(&manager, "boom").await;
        match status {
            TaskStatus::Failed(message) => assert!(message.contains("numerical blowup")),
            other => panic!("expected Failed, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_result_retention_keeps_most_recent() {
        let manager = AsyncTaskManager::new(3, 4);
        for i in 0..6 {
            manager
                .submit(&format!("r-{i}"), |_token| async { Ok(empty_result()) })
                .unwrap();
            wait_terminal(&manager, &format!("r-{i}")).await;
        }
        // Only 4 outcomes retained; the oldest two are gone
        let retained = (0..6)
            .filter(|i| !matches!(manager.status(&format!("r-{i}")), TaskStatus::NotFound))
            .count();
        assert_eq!(retained, 4);
        assert!(matches!(manager.status("r-0"), TaskStatus::NotFound));
    }

    #[tokio::test]
    async fn test_status_unknown_not_found() {
        let manager = AsyncTaskManager::with_defaults();
        assert!(matches!(manager.status("nope"), TaskStatus::NotFound));
    }
}
