//! Job manager: bounded-concurrency dispatch with parent/child ordering
//!
//! The executor queues one job per propagated operation. At most `pool_size`
//! jobs run at once; a job given a parent id waits until the parent reports
//! success. Completion lands on the executor's terminated-jobs channel.

use super::types::{FinishedJob, JobId, JobOutput, JobResult};
use crate::shared::SyncResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

type StatusTx = watch::Sender<Option<bool>>;

/// Dispatches jobs on the tokio runtime with a fixed concurrency budget.
pub struct JobManager {
    pool: Arc<Semaphore>,
    pool_size: usize,
    cancel: watch::Sender<bool>,
    statuses: Arc<Mutex<HashMap<JobId, StatusTx>>>,
    managed: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl JobManager {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        let (cancel, _) = watch::channel(false);
        Self {
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            cancel,
            statuses: Arc::new(Mutex::new(HashMap::new())),
            managed: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Jobs queued or running right now.
    pub fn managed_count(&self) -> usize {
        self.managed.load(Ordering::SeqCst)
    }

    /// True while the executor should stop queueing new jobs.
    pub fn saturated(&self) -> bool {
        self.managed_count() > self.pool_size * 2
    }

    /// Queue a job. The future runs once a worker slot (and the parent's
    /// success, when given) is available; its terminal state is sent on
    /// `done`.
    pub fn queue<F>(
        &self,
        parent: Option<JobId>,
        job: F,
        done: mpsc::UnboundedSender<FinishedJob>,
    ) -> JobId
    where
        F: Future<Output = SyncResult<JobOutput>> + Send + 'static,
    {
        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (status_tx, _) = watch::channel(None);
        let parent_rx = parent.and_then(|parent_id| {
            let statuses = self.statuses.lock().unwrap();
            statuses.get(&parent_id).map(StatusTx::subscribe)
        });
        self.statuses.lock().unwrap().insert(job_id, status_tx);
        self.managed.fetch_add(1, Ordering::SeqCst);

        let pool = self.pool.clone();
        let mut cancel = self.cancel.subscribe();
        let statuses = self.statuses.clone();
        let managed = self.managed.clone();

        tokio::spawn(async move {
            let result = run_job(job_id, parent_rx, pool, &mut cancel, job).await;
            let success = matches!(result, JobResult::Done(_));
            if let Some(status) = statuses.lock().unwrap().get(&job_id) {
                let _ = status.send(Some(success));
            }
            managed.fetch_sub(1, Ordering::SeqCst);
            if done.send(FinishedJob { job_id, result }).is_err() {
                warn!(job_id, "Terminated-jobs queue dropped before completion");
            }
        });
        job_id
    }

    /// Abort queued-but-not-running jobs first, then running ones.
    pub fn cancel_all(&self) {
        let _ = self.cancel.send(true);
    }

    /// Arm the manager for the next pass after a cancellation.
    pub fn reset(&self) {
        let _ = self.cancel.send(false);
        self.statuses.lock().unwrap().clear();
    }

    /// Forget per-job bookkeeping of a finished pass.
    pub fn clear_statuses(&self) {
        self.statuses.lock().unwrap().clear();
    }
}

async fn run_job<F>(
    job_id: JobId,
    parent_rx: Option<watch::Receiver<Option<bool>>>,
    pool: Arc<Semaphore>,
    cancel: &mut watch::Receiver<bool>,
    job: F,
) -> JobResult
where
    F: Future<Output = SyncResult<JobOutput>> + Send + 'static,
{
    if *cancel.borrow() {
        return JobResult::Canceled;
    }

    // Parent-then-child: wait for the parent's terminal state.
    if let Some(mut parent_rx) = parent_rx {
        loop {
            let state = *parent_rx.borrow();
            match state {
                Some(true) => break,
                Some(false) => {
                    debug!(job_id, "Parent job failed, child canceled");
                    return JobResult::Canceled;
                }
                None => tokio::select! {
                    changed = parent_rx.changed() => {
                        if changed.is_err() {
                            return JobResult::Canceled;
                        }
                    }
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            return JobResult::Canceled;
                        }
                    }
                },
            }
        }
    }

    // Wait for a worker slot; abort-before-start leaves no side effect.
    let permit = tokio::select! {
        permit = pool.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return JobResult::Canceled,
        },
        _ = wait_for_cancel(cancel) => return JobResult::Canceled,
    };

    // Abort-during: dropping the future stops streaming without finalizing.
    let result = tokio::select! {
        result = job => match result {
            Ok(output) => JobResult::Done(output),
            Err(err) => JobResult::Failed(err),
        },
        _ = wait_for_cancel(cancel) => JobResult::Canceled,
    };
    drop(permit);
    result
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Manager gone; never resolve so the job runs to completion.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{ExitCause, SyncError};
    use std::time::Duration;

    fn manager() -> JobManager {
        JobManager::new(2)
    }

    #[tokio::test]
    async fn jobs_complete_and_report() {
        let manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = manager.queue(None, async { Ok(JobOutput::empty()) }, tx);

        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.job_id, id);
        assert!(matches!(finished.result, JobResult::Done(_)));
        assert_eq!(manager.managed_count(), 0);
    }

    #[tokio::test]
    async fn child_waits_for_parent_success() {
        let manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        let parent = manager.queue(
            None,
            async move {
                let _ = gate_rx.await;
                Ok(JobOutput::empty())
            },
            tx.clone(),
        );
        let child = manager.queue(Some(parent), async { Ok(JobOutput::empty()) }, tx);

        // Child cannot finish before the parent.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        gate_tx.send(()).unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.job_id, parent);
        assert_eq!(second.job_id, child);
    }

    #[tokio::test]
    async fn child_canceled_when_parent_fails() {
        let manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let parent = manager.queue(
            None,
            async { Err(SyncError::system(ExitCause::FileAccessError)) },
            tx.clone(),
        );
        let child = manager.queue(Some(parent), async { Ok(JobOutput::empty()) }, tx);

        let mut results = HashMap::new();
        for _ in 0..2 {
            let finished = rx.recv().await.unwrap();
            results.insert(finished.job_id, finished.result);
        }
        assert!(matches!(results[&parent], JobResult::Failed(_)));
        assert!(matches!(results[&child], JobResult::Canceled));
    }

    #[tokio::test]
    async fn cancel_all_aborts_queued_jobs() {
        let manager = JobManager::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Occupies the single slot until canceled
        let blocker = manager.queue(
            None,
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(JobOutput::empty())
            },
            tx.clone(),
        );
        let queued = manager.queue(None, async { Ok(JobOutput::empty()) }, tx);

        manager.cancel_all();
        let mut canceled = 0;
        for _ in 0..2 {
            let finished = rx.recv().await.unwrap();
            assert!(matches!(finished.result, JobResult::Canceled), "{blocker} {queued}");
            canceled += 1;
        }
        assert_eq!(canceled, 2);
    }

    #[tokio::test]
    async fn concurrency_stays_bounded() {
        let manager = JobManager::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            manager.queue(
                None,
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(JobOutput::empty())
                },
                tx.clone(),
            );
        }
        drop(tx);
        while rx.recv().await.is_some() {}
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
