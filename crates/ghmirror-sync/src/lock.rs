//! Process-wide job lock shared by every job type.

use std::future::Future;
use std::sync::{Mutex as StdMutex, PoisonError};

use ghmirror_core::JobType;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Full mutual exclusion across all job types. Waiters are admitted strictly
/// in request order (tokio's mutex queues waiters FIFO).
#[derive(Debug, Default)]
pub struct JobLock {
    gate: Mutex<()>,
    holder: StdMutex<Option<JobType>>,
}

/// Held while a job runs; releases on drop whether the job succeeded, failed
/// or panicked.
#[derive(Debug)]
pub struct JobLockGuard<'a> {
    _permit: MutexGuard<'a, ()>,
    holder: &'a StdMutex<Option<JobType>>,
    job: JobType,
}

impl JobLockGuard<'_> {
    pub fn job(&self) -> JobType {
        self.job
    }
}

impl Drop for JobLockGuard<'_> {
    fn drop(&mut self) {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(job = %self.job, "job lock released");
    }
}

impl JobLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Job type currently inside the critical section.
    pub fn current_holder(&self) -> Option<JobType> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn acquire(&self, job: JobType) -> JobLockGuard<'_> {
        if let Some(holder) = self.current_holder() {
            debug!(job = %job, holder = %holder, "job lock busy; queueing");
        }
        let permit = self.gate.lock().await;
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = Some(job);
        debug!(job = %job, "job lock acquired");
        JobLockGuard {
            _permit: permit,
            holder: &self.holder,
            job,
        }
    }

    /// Runs `work` inside the critical section. The result (including any
    /// error) goes back to this caller only; the next waiter proceeds either way.
    pub async fn with_lock<F, T>(&self, job: JobType, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(job).await;
        work.await
    }
}
