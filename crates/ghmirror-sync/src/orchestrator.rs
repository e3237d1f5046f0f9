//! The single owner of job scheduling state for this process.
//!
//! Per job type it keeps at most one armed one-shot timer, recomputed from the
//! stored local-time schedule after every run and on every reconfiguration.
//! Runs of one type are serialized by a per-type gate, and every run passes
//! through the process-wide [`JobLock`] and then the store's cross-process
//! run lease, all within one bounded waiting window.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use ghmirror_core::{JobStatus, JobTrigger, JobType, ScheduleConfig, ScheduleError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::jobs::{JobContext, JobHandler, JobParams};
use crate::lock::JobLock;
use crate::realign::{RealignOptions, RealignReport};
use crate::schedule::{compute_next_run, delay_until};
use crate::status::{DerivationOutcome, StatusDerivationEngine};
use crate::store::{JobRunRecord, RunLease, SchedulerStore};

/// Default waiting window before a queued run is failed.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(15 * 60);

/// How often a queued run retries a lease held by another process.
const LEASE_POLL: Duration = Duration::from_millis(250);

const INTERRUPTED: &str = "interrupted by restart";

#[derive(Debug, Error)]
pub enum JobError {
    #[error("no handler registered for {0} jobs")]
    NoHandler(JobType),
    #[error(transparent)]
    InvalidSchedule(#[from] ScheduleError),
    #[error("{job} run {run_id} timed out waiting for job lock after {}s", waited.as_secs())]
    LockWaitTimeout {
        job: JobType,
        run_id: Uuid,
        waited: Duration,
    },
    #[error("{job} run {run_id} failed: {message}")]
    Failed {
        job: JobType,
        run_id: Uuid,
        message: String,
    },
    #[error("timer: {0}")]
    Timer(String),
    #[error("{0} is not configured in this process")]
    Unavailable(&'static str),
    #[error(transparent)]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRunSummary {
    pub run_id: Uuid,
    pub job: JobType,
    pub trigger: JobTrigger,
    pub status: JobStatus,
    pub summary: String,
    pub details: Value,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRuntimeInfo {
    pub job: JobType,
    pub schedule: Option<ScheduleConfig>,
    /// `None` when the schedule is disabled, invalid or missing. Computed from
    /// the stored schedule when no timer is armed in this process.
    pub next_run: Option<DateTime<Utc>>,
    pub waiting: usize,
    pub running: bool,
    pub lock_holder: Option<JobType>,
    pub last_run: Option<JobRunRecord>,
}

#[derive(Debug, Default)]
struct TimerSlot {
    timer_id: Option<Uuid>,
    next_run: Option<DateTime<Utc>>,
    /// Stored schedule the current timer came from; compared against the
    /// store to notice changes written by other processes.
    armed_from: Option<ScheduleConfig>,
}

/// Aborts the spawned handler when the awaiting run is dropped, so a handler
/// never outlives the locks held for it.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The schedule a timer should be armed from: enabled and valid.
fn armable(schedule: Option<ScheduleConfig>) -> Option<(ScheduleConfig, Tz)> {
    let schedule = schedule.filter(|s| s.enabled)?;
    let tz = schedule.validate().ok()?;
    Some((schedule, tz))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[derive(Debug, Default)]
struct RunFlags {
    waiting: AtomicUsize,
    running: AtomicBool,
}

struct JobState {
    handler: Option<Arc<dyn JobHandler>>,
    slot: Mutex<TimerSlot>,
    gate: Arc<Mutex<()>>,
    flags: RunFlags,
}

pub struct OrchestratorBuilder {
    store: Arc<dyn SchedulerStore>,
    handlers: Vec<Arc<dyn JobHandler>>,
    lock_wait: Duration,
    status: Option<StatusDerivationEngine>,
}

impl OrchestratorBuilder {
    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn status_engine(mut self, engine: StatusDerivationEngine) -> Self {
        self.status = Some(engine);
        self
    }

    pub async fn build(self) -> Result<Arc<Orchestrator>, JobError> {
        let timers = JobScheduler::new().await.map_err(|e| JobError::Timer(e.to_string()))?;
        let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
        for handler in self.handlers {
            handlers.insert(handler.job_type(), handler);
        }
        let jobs = JobType::ALL
            .into_iter()
            .map(|job| {
                let state = JobState {
                    handler: handlers.remove(&job),
                    slot: Mutex::new(TimerSlot::default()),
                    gate: Arc::new(Mutex::new(())),
                    flags: RunFlags::default(),
                };
                (job, state)
            })
            .collect();

        Ok(Arc::new_cyclic(|self_ref| Orchestrator {
            store: self.store,
            lock: JobLock::new(),
            jobs,
            timers,
            lock_wait: self.lock_wait,
            status: self.status,
            self_ref: self_ref.clone(),
        }))
    }
}

pub struct Orchestrator {
    store: Arc<dyn SchedulerStore>,
    lock: JobLock,
    jobs: HashMap<JobType, JobState>,
    timers: JobScheduler,
    lock_wait: Duration,
    status: Option<StatusDerivationEngine>,
    self_ref: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn builder(store: Arc<dyn SchedulerStore>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            handlers: Vec::new(),
            lock_wait: DEFAULT_LOCK_WAIT,
            status: None,
        }
    }

    fn state(&self, job: JobType) -> &JobState {
        // every JobType is inserted by the builder
        &self.jobs[&job]
    }

    /// Seeds default schedules for job types that have none stored yet.
    pub async fn seed_schedules<'a>(
        &self,
        defaults: impl IntoIterator<Item = (&'a JobType, &'a ScheduleConfig)>,
    ) -> Result<(), JobError> {
        for (job, schedule) in defaults {
            schedule.validate()?;
            if self.store.seed_schedule(*job, schedule).await.map_err(JobError::Store)? {
                info!(job = %job, hour = schedule.hour, minute = schedule.minute, timezone = %schedule.timezone, "seeded default schedule");
            }
        }
        Ok(())
    }

    /// Fails runs left over by a previous process, starts the timer wheel and
    /// arms every enabled schedule. Leftover runs are only swept while no
    /// other process holds the run lease.
    pub async fn start(&self) -> Result<(), JobError> {
        match self.store.try_acquire_run_lease().await.map_err(JobError::Store)? {
            Some(lease) => {
                let swept = self.store.fail_interrupted_runs(INTERRUPTED).await;
                if let Err(err) = lease.release().await {
                    warn!(error = %format!("{err:#}"), "could not release run lease after sweep");
                }
                let failed = swept.map_err(JobError::Store)?;
                if failed > 0 {
                    warn!(failed, "failed runs interrupted by the previous process");
                }
            }
            None => info!("another process is running a job; leaving unfinished runs alone"),
        }
        self.timers.start().await.map_err(|e| JobError::Timer(e.to_string()))?;
        for job in JobType::ALL {
            self.reschedule(job).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), JobError> {
        let mut timers = self.timers.clone();
        timers.shutdown().await.map_err(|e| JobError::Timer(e.to_string()))
    }

    /// Cancels any armed timer for `job`, then arms a new one from the stored
    /// schedule. Returns the next run, `None` when disabled.
    pub async fn reschedule(&self, job: JobType) -> Result<Option<DateTime<Utc>>, JobError> {
        let mut slot = self.state(job).slot.lock().await;
        let stored = self.store.load_schedule(job).await.map_err(JobError::Store)?;
        self.rearm(job, &mut slot, stored).await
    }

    /// Re-arms every job type whose stored schedule differs from the one its
    /// timer was armed from, picking up changes made by other processes.
    /// Returns the job types that were re-armed.
    pub async fn reload_schedules(&self) -> Result<Vec<JobType>, JobError> {
        let mut changed = Vec::new();
        for job in JobType::ALL {
            let mut slot = self.state(job).slot.lock().await;
            let stored = self.store.load_schedule(job).await.map_err(JobError::Store)?;
            let wanted = armable(stored.clone()).map(|(schedule, _)| schedule);
            if wanted != slot.armed_from {
                info!(job = %job, "stored schedule changed; re-arming");
                self.rearm(job, &mut slot, stored).await?;
                changed.push(job);
            }
        }
        Ok(changed)
    }

    async fn rearm(
        &self,
        job: JobType,
        slot: &mut TimerSlot,
        stored: Option<ScheduleConfig>,
    ) -> Result<Option<DateTime<Utc>>, JobError> {
        self.disarm(job, slot).await;
        slot.armed_from = None;

        let Some(schedule) = stored.filter(|s| s.enabled) else {
            debug!(job = %job, "schedule disabled; no timer armed");
            return Ok(None);
        };
        let tz = match schedule.validate() {
            Ok(tz) => tz,
            Err(err) => {
                warn!(job = %job, error = %err, "stored schedule is invalid; leaving job unscheduled");
                return Ok(None);
            }
        };

        let now = Utc::now();
        let next_run = compute_next_run(schedule.hour, schedule.minute, tz, now);
        self.arm(job, slot, delay_until(next_run, now), next_run).await?;
        info!(job = %job, next_run = %next_run, timezone = %schedule.timezone, "job scheduled");
        slot.armed_from = Some(schedule);
        Ok(Some(next_run))
    }

    async fn disarm(&self, job: JobType, slot: &mut TimerSlot) {
        if let Some(timer_id) = slot.timer_id.take() {
            // a timer that already fired is gone from the wheel
            if let Err(err) = self.timers.remove(&timer_id).await {
                debug!(job = %job, timer_id = %timer_id, error = %err, "timer already cleared");
            }
        }
        slot.next_run = None;
    }

    async fn arm(
        &self,
        job: JobType,
        slot: &mut TimerSlot,
        delay: Duration,
        next_run: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let owner = self.self_ref.clone();
        let timer = Job::new_one_shot_async(delay, move |timer_id, _timers| {
            let owner = owner.clone();
            Box::pin(async move {
                if let Some(orchestrator) = owner.upgrade() {
                    tokio::spawn(orchestrator.fire_boxed(job, timer_id));
                }
            })
        })
        .map_err(|e| JobError::Timer(e.to_string()))?;
        let timer_id = self.timers.add(timer).await.map_err(|e| JobError::Timer(e.to_string()))?;
        slot.timer_id = Some(timer_id);
        slot.next_run = Some(next_run);
        Ok(())
    }

    fn fire_boxed(self: Arc<Self>, job: JobType, timer_id: Uuid) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.fire(job, timer_id).await })
    }

    async fn fire(&self, job: JobType, timer_id: Uuid) {
        {
            let mut slot = self.state(job).slot.lock().await;
            if slot.timer_id != Some(timer_id) {
                // superseded by a re-arm that raced the wheel
                debug!(job = %job, timer_id = %timer_id, "stale timer ignored");
                return;
            }
            slot.timer_id = None;
            slot.next_run = None;

            match self.store.load_schedule(job).await {
                Ok(stored) => {
                    let wanted = armable(stored.clone()).map(|(schedule, _)| schedule);
                    if wanted != slot.armed_from {
                        info!(job = %job, "schedule changed since this timer was armed; skipping run");
                        if let Err(err) = self.rearm(job, &mut slot, stored).await {
                            error!(job = %job, error = %err, "could not re-arm schedule");
                        }
                        return;
                    }
                }
                Err(err) => warn!(job = %job, error = %format!("{err:#}"), "could not re-read schedule; running as armed"),
            }
        }
        match self.run_job(job, JobTrigger::Automatic, JobParams::None).await {
            Ok(summary) => info!(job = %job, run_id = %summary.run_id, "scheduled run finished"),
            Err(err) => warn!(job = %job, error = %err, "scheduled run did not succeed"),
        }
        if let Err(err) = self.reschedule(job).await {
            error!(job = %job, error = %err, "could not re-arm schedule");
        }
    }

    /// Validates and stores a new schedule, then re-arms the timer. Invalid
    /// input is rejected before anything changes.
    pub async fn update_schedule(&self, job: JobType, schedule: ScheduleConfig) -> Result<JobRuntimeInfo, JobError> {
        schedule.validate()?;
        self.store.save_schedule(job, &schedule).await.map_err(JobError::Store)?;
        self.reschedule(job).await?;
        self.runtime_info(job).await
    }

    /// Runs `job` now and waits for it to finish.
    pub async fn trigger(&self, job: JobType, params: JobParams) -> Result<JobRunSummary, JobError> {
        self.run_job(job, JobTrigger::Manual, params).await
    }

    /// Identity realignment through the job lock.
    pub async fn realign(&self, options: RealignOptions) -> Result<RealignReport, JobError> {
        let summary = self.trigger(JobType::Transfer, JobParams::Realign(options)).await?;
        serde_json::from_value(summary.details).map_err(|e| JobError::Failed {
            job: JobType::Transfer,
            run_id: summary.run_id,
            message: format!("unreadable realignment report: {e}"),
        })
    }

    /// Status derivation outside the job lock; the engine serializes itself
    /// with a database advisory lock.
    pub async fn derive_statuses(&self, force: bool) -> Result<DerivationOutcome, JobError> {
        let engine = self.status.as_ref().ok_or(JobError::Unavailable("status derivation"))?;
        engine.run(force, None).await.map_err(JobError::Store)
    }

    pub async fn runtime_info(&self, job: JobType) -> Result<JobRuntimeInfo, JobError> {
        let state = self.state(job);
        let armed = state.slot.lock().await.next_run;
        let schedule = self.store.load_schedule(job).await.map_err(JobError::Store)?;
        let next_run = armed.or_else(|| {
            armable(schedule.clone()).map(|(s, tz)| compute_next_run(s.hour, s.minute, tz, Utc::now()))
        });
        Ok(JobRuntimeInfo {
            job,
            schedule,
            next_run,
            waiting: state.flags.waiting.load(Ordering::SeqCst),
            running: state.flags.running.load(Ordering::SeqCst),
            lock_holder: self.lock.current_holder(),
            last_run: self.store.last_run(job).await.map_err(JobError::Store)?,
        })
    }

    pub async fn runtime_overview(&self) -> Result<Vec<JobRuntimeInfo>, JobError> {
        let mut out = Vec::with_capacity(JobType::ALL.len());
        for job in JobType::ALL {
            out.push(self.runtime_info(job).await?);
        }
        Ok(out)
    }

    async fn run_job(&self, job: JobType, trigger: JobTrigger, params: JobParams) -> Result<JobRunSummary, JobError> {
        let state = self.state(job);
        let handler = state.handler.clone().ok_or(JobError::NoHandler(job))?;
        let record = self.store.create_run(job, trigger).await.map_err(JobError::Store)?;
        let run_id = record.id;
        let span = info_span!("job_run", job = %job, run_id = %run_id, trigger = %trigger);

        async move {
            let requested = Instant::now();
            state.flags.waiting.fetch_add(1, Ordering::SeqCst);
            let admitted = tokio::time::timeout(self.lock_wait, async {
                let same_type = state.gate.clone().lock_owned().await;
                let lock = self.lock.acquire(job).await;
                let lease = self.acquire_lease().await?;
                Ok::<_, anyhow::Error>((same_type, lock, lease))
            })
            .await;
            state.flags.waiting.fetch_sub(1, Ordering::SeqCst);

            let (_same_type, _lock, lease) = match admitted {
                Ok(Ok(admitted)) => admitted,
                Ok(Err(err)) => {
                    let message = format!("could not acquire run lease: {err:#}");
                    warn!("{message}");
                    self.close_run(run_id, job, JobStatus::Failed, None, Some(&message)).await;
                    return Err(JobError::Store(err));
                }
                Err(_) => {
                    let waited = requested.elapsed();
                    let message = format!("timed out waiting for job lock after {}s", waited.as_secs());
                    warn!(holder = ?self.lock.current_holder(), "{message}");
                    self.close_run(run_id, job, JobStatus::Failed, None, Some(&message)).await;
                    return Err(JobError::LockWaitTimeout { job, run_id, waited });
                }
            };

            if let Err(err) = self.store.mark_running(run_id).await {
                warn!(error = %format!("{err:#}"), "could not mark run as running");
            }
            state.flags.running.store(true, Ordering::SeqCst);
            info!("job admitted");

            let ctx = JobContext::new(run_id, job, trigger, params, self.store.clone());
            let started = Instant::now();
            let task = tokio::spawn(async move { handler.run(&ctx).await }.in_current_span());
            let _abort = AbortOnDrop(task.abort_handle());
            let result = match task.await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    let payload = err.into_panic();
                    Err(anyhow::anyhow!("job panicked: {}", panic_message(payload.as_ref())))
                }
                Err(err) => Err(anyhow::anyhow!("job task ended: {err}")),
            };
            state.flags.running.store(false, Ordering::SeqCst);
            if let Err(err) = lease.release().await {
                warn!(error = %format!("{err:#}"), "could not release run lease");
            }
            let elapsed_ms = started.elapsed().as_millis();

            match result {
                Ok(outcome) => {
                    info!(elapsed_ms, summary = %outcome.summary, "job succeeded");
                    self.close_run(run_id, job, JobStatus::Success, Some(&outcome.summary), None).await;
                    Ok(JobRunSummary {
                        run_id,
                        job,
                        trigger,
                        status: JobStatus::Success,
                        summary: outcome.summary,
                        details: outcome.details,
                        elapsed_ms,
                    })
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(elapsed_ms, error = %message, "job failed");
                    self.close_run(run_id, job, JobStatus::Failed, None, Some(&message)).await;
                    Err(JobError::Failed { job, run_id, message })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Polls the cross-process lease until granted; the caller's waiting
    /// window bounds the loop.
    async fn acquire_lease(&self) -> anyhow::Result<Box<dyn RunLease>> {
        let mut announced = false;
        loop {
            if let Some(lease) = self.store.try_acquire_run_lease().await? {
                return Ok(lease);
            }
            if !announced {
                info!("run lease held by another process; waiting");
                announced = true;
            }
            tokio::time::sleep(LEASE_POLL).await;
        }
    }

    async fn close_run(&self, run_id: Uuid, job: JobType, status: JobStatus, summary: Option<&str>, error: Option<&str>) {
        if let Err(err) = self.store.finish_run(run_id, job, status, summary, error).await {
            error!(run_id = %run_id, error = %format!("{err:#}"), "could not record run outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use chrono::Timelike;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::jobs::JobOutcome;
    use crate::store::memory::MemoryStore;

    struct TestHandler {
        job: JobType,
        delay: Duration,
        fail: bool,
        panic: bool,
        calls: AtomicUsize,
        inside: AtomicUsize,
        max_inside: AtomicUsize,
        release: Option<Arc<Notify>>,
    }

    impl TestHandler {
        fn new(job: JobType) -> Self {
            Self {
                job,
                delay: Duration::ZERO,
                fail: false,
                panic: false,
                calls: AtomicUsize::new(0),
                inside: AtomicUsize::new(0),
                max_inside: AtomicUsize::new(0),
                release: None,
            }
        }
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        fn job_type(&self) -> JobType {
            self.job
        }

        async fn run(&self, ctx: &JobContext) -> anyhow::Result<JobOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_inside = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_inside.fetch_max(now_inside, Ordering::SeqCst);
            if let Some(release) = &self.release {
                release.notified().await;
            }
            tokio::time::sleep(self.delay).await;
            self.inside.fetch_sub(1, Ordering::SeqCst);
            if self.panic {
                panic!("index out of bounds in fixture");
            }
            if self.fail {
                bail!("upstream returned 502");
            }
            Ok(JobOutcome {
                summary: format!("{} done", ctx.job),
                details: Value::Null,
            })
        }
    }

    async fn orchestrator(store: Arc<MemoryStore>, handlers: Vec<Arc<TestHandler>>) -> Arc<Orchestrator> {
        let mut builder = Orchestrator::builder(store).lock_wait(Duration::from_millis(200));
        for handler in handlers {
            builder = builder.handler(handler);
        }
        builder.build().await.unwrap()
    }

    fn seoul(enabled: bool) -> ScheduleConfig {
        ScheduleConfig {
            enabled,
            hour: 2,
            minute: 0,
            timezone: "Asia/Seoul".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_schedule_is_rejected_before_any_change() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(store.clone(), vec![]).await;
        orch.update_schedule(JobType::Sync, seoul(true)).await.unwrap();

        let mut bad = seoul(true);
        bad.timezone = "Asia/Atlantis".into();
        let err = orch.update_schedule(JobType::Sync, bad).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidSchedule(ScheduleError::UnknownTimezone(_))));

        let mut bad = seoul(true);
        bad.hour = 24;
        assert!(orch.update_schedule(JobType::Sync, bad).await.is_err());

        assert_eq!(store.load_schedule(JobType::Sync).await.unwrap(), Some(seoul(true)));
        assert!(orch.runtime_info(JobType::Sync).await.unwrap().next_run.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enabling_and_disabling_rearms_the_single_timer() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(store, vec![]).await;

        let info = orch.update_schedule(JobType::Backup, seoul(true)).await.unwrap();
        let next = info.next_run.expect("armed");
        assert!(next > Utc::now());
        let first_timer = orch.state(JobType::Backup).slot.lock().await.timer_id;
        assert!(first_timer.is_some());

        let mut later = seoul(true);
        later.minute = 30;
        let info = orch.update_schedule(JobType::Backup, later).await.unwrap();
        let second_timer = orch.state(JobType::Backup).slot.lock().await.timer_id;
        assert_ne!(first_timer, second_timer);
        let moved = info.next_run.unwrap();
        assert_ne!(moved, next);
        assert_eq!(moved.with_timezone(&chrono_tz::Asia::Seoul).minute(), 30);

        let info = orch.update_schedule(JobType::Backup, seoul(false)).await.unwrap();
        assert_eq!(info.next_run, None);
        assert!(orch.state(JobType::Backup).slot.lock().await.timer_id.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rearming_cancels_the_previous_timer() {
        let store = Arc::new(MemoryStore::default());
        let handler = Arc::new(TestHandler::new(JobType::Sync));
        let orch = orchestrator(store.clone(), vec![handler.clone()]).await;
        orch.timers.start().await.unwrap();

        {
            let state = orch.state(JobType::Sync);
            let mut slot = state.slot.lock().await;
            orch.arm(JobType::Sync, &mut slot, Duration::from_millis(300), Utc::now()).await.unwrap();
            orch.disarm(JobType::Sync, &mut slot).await;
            orch.arm(JobType::Sync, &mut slot, Duration::from_millis(600), Utc::now()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1, "only the surviving timer fired");
        let runs = store.runs_for(JobType::Sync);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, JobTrigger::Automatic);
        assert_eq!(runs[0].status, JobStatus::Success);
        // no stored schedule, so nothing is re-armed after the run
        assert!(orch.state(JobType::Sync).slot.lock().await.timer_id.is_none());
        orch.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn superseded_timer_does_not_run_the_job() {
        let store = Arc::new(MemoryStore::default());
        let handler = Arc::new(TestHandler::new(JobType::Backup));
        let orch = orchestrator(store.clone(), vec![handler.clone()]).await;
        orch.update_schedule(JobType::Backup, seoul(true)).await.unwrap();

        orch.fire(JobType::Backup, Uuid::new_v4()).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(store.runs_for(JobType::Backup).is_empty());
        assert!(orch.runtime_info(JobType::Backup).await.unwrap().next_run.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lock_wait_timeout_fails_the_waiting_run_only() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(store.clone(), vec![Arc::new(TestHandler::new(JobType::Backup))]).await;

        let holder = orch.lock.acquire(JobType::Sync).await;
        let err = orch.trigger(JobType::Backup, JobParams::None).await.unwrap_err();
        let JobError::LockWaitTimeout { run_id, .. } = err else {
            panic!("expected lock wait timeout, got {err}");
        };
        assert_eq!(orch.lock.current_holder(), Some(JobType::Sync));

        let run = store.run(run_id).unwrap();
        assert_eq!(run.status, JobStatus::Failed);
        assert!(run.started_at.is_none(), "never admitted");
        assert!(run.error.unwrap().contains("timed out waiting for job lock"));

        drop(holder);
        let ok = orch.trigger(JobType::Backup, JobParams::None).await.unwrap();
        assert_eq!(ok.status, JobStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_handler_is_recorded_and_releases_the_lock() {
        let store = Arc::new(MemoryStore::default());
        let mut failing = TestHandler::new(JobType::Restore);
        failing.fail = true;
        let orch = orchestrator(
            store.clone(),
            vec![Arc::new(failing), Arc::new(TestHandler::new(JobType::Sync))],
        )
        .await;

        let err = orch.trigger(JobType::Restore, JobParams::None).await.unwrap_err();
        assert!(matches!(err, JobError::Failed { job: JobType::Restore, .. }));
        let last = orch.runtime_info(JobType::Restore).await.unwrap().last_run.unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert_eq!(last.error.as_deref(), Some("upstream returned 502"));

        assert!(orch.trigger(JobType::Sync, JobParams::None).await.is_ok());
        assert_eq!(orch.lock.current_holder(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_triggers_of_one_type_run_back_to_back() {
        let store = Arc::new(MemoryStore::default());
        let mut slow = TestHandler::new(JobType::Sync);
        slow.delay = Duration::from_millis(50);
        let slow = Arc::new(slow);
        let orch = orchestrator(store.clone(), vec![slow.clone()]).await;

        let (a, b) = tokio::join!(
            orch.trigger(JobType::Sync, JobParams::None),
            orch.trigger(JobType::Sync, JobParams::None)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
        assert_eq!(slow.max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(store.runs_for(JobType::Sync).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runtime_info_reports_running_and_waiting_jobs() {
        let store = Arc::new(MemoryStore::default());
        let release = Arc::new(Notify::new());
        let mut blocking = TestHandler::new(JobType::Transfer);
        blocking.release = Some(release.clone());
        let blocking = Arc::new(blocking);
        let orch = Orchestrator::builder(store.clone())
            .lock_wait(Duration::from_secs(10))
            .handler(blocking.clone())
            .handler(Arc::new(TestHandler::new(JobType::Backup)))
            .build()
            .await
            .unwrap();

        let running = tokio::spawn({
            let orch = orch.clone();
            async move { orch.trigger(JobType::Transfer, JobParams::None).await }
        });
        while blocking.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let queued = tokio::spawn({
            let orch = orch.clone();
            async move { orch.trigger(JobType::Backup, JobParams::None).await }
        });
        while orch.runtime_info(JobType::Backup).await.unwrap().waiting == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let transfer = orch.runtime_info(JobType::Transfer).await.unwrap();
        assert!(transfer.running);
        assert_eq!(transfer.lock_holder, Some(JobType::Transfer));
        let backup = orch.runtime_info(JobType::Backup).await.unwrap();
        assert_eq!(backup.waiting, 1);
        assert!(!backup.running);
        assert_eq!(backup.last_run.unwrap().status, JobStatus::Waiting);

        release.notify_one();
        assert!(running.await.unwrap().is_ok());
        assert!(queued.await.unwrap().is_ok());
        let overview = orch.runtime_overview().await.unwrap();
        assert!(overview.iter().all(|info| !info.running && info.waiting == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_fails_interrupted_runs_and_arms_enabled_schedules() {
        let store = Arc::new(MemoryStore::default());
        let stale = store.create_run(JobType::Sync, JobTrigger::Automatic).await.unwrap();
        store.save_schedule(JobType::Backup, &seoul(true)).await.unwrap();
        store.save_schedule(JobType::Restore, &seoul(false)).await.unwrap();

        let orch = orchestrator(store.clone(), vec![]).await;
        orch.start().await.unwrap();

        assert_eq!(store.run(stale.id).unwrap().status, JobStatus::Failed);
        assert_eq!(store.run(stale.id).unwrap().error.as_deref(), Some(INTERRUPTED));
        let overview = orch.runtime_overview().await.unwrap();
        let armed: Vec<_> = overview.iter().filter(|i| i.next_run.is_some()).map(|i| i.job).collect();
        assert_eq!(armed, vec![JobType::Backup]);
        orch.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_job_handler_is_reported() {
        let orch = orchestrator(Arc::new(MemoryStore::default()), vec![]).await;
        let err = orch.trigger(JobType::Restore, JobParams::None).await.unwrap_err();
        assert!(matches!(err, JobError::NoHandler(JobType::Restore)));
        assert!(matches!(orch.derive_statuses(false).await, Err(JobError::Unavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seeding_validates_and_keeps_existing_rows() {
        let store = Arc::new(MemoryStore::default());
        store.save_schedule(JobType::Sync, &seoul(false)).await.unwrap();
        let orch = orchestrator(store.clone(), vec![]).await;

        let mut defaults = std::collections::BTreeMap::new();
        defaults.insert(JobType::Sync, seoul(true));
        defaults.insert(JobType::Backup, seoul(true));
        orch.seed_schedules(&defaults).await.unwrap();
        assert_eq!(store.load_schedule(JobType::Sync).await.unwrap(), Some(seoul(false)));
        assert_eq!(store.load_schedule(JobType::Backup).await.unwrap(), Some(seoul(true)));

        let mut invalid = std::collections::BTreeMap::new();
        let mut bad = seoul(true);
        bad.minute = 75;
        invalid.insert(JobType::Transfer, bad);
        assert!(orch.seed_schedules(&invalid).await.is_err());
        assert_eq!(store.load_schedule(JobType::Transfer).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn next_run_is_reported_before_timers_are_armed() {
        let store = Arc::new(MemoryStore::default());
        store.save_schedule(JobType::Sync, &seoul(true)).await.unwrap();
        store.save_schedule(JobType::Backup, &seoul(false)).await.unwrap();
        let orch = orchestrator(store, vec![]).await;

        let sync = orch.runtime_info(JobType::Sync).await.unwrap();
        let next = sync.next_run.expect("computed from the stored schedule");
        assert!(next > Utc::now());
        let local = next.with_timezone(&chrono_tz::Asia::Seoul);
        assert_eq!((local.hour(), local.minute()), (2, 0));
        assert!(orch.state(JobType::Sync).slot.lock().await.timer_id.is_none());

        assert_eq!(orch.runtime_info(JobType::Backup).await.unwrap().next_run, None);
        assert_eq!(orch.runtime_info(JobType::Transfer).await.unwrap().next_run, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_handler_fails_the_run_and_rearms() {
        let store = Arc::new(MemoryStore::default());
        let mut exploding = TestHandler::new(JobType::Backup);
        exploding.panic = true;
        let orch = orchestrator(
            store.clone(),
            vec![Arc::new(exploding), Arc::new(TestHandler::new(JobType::Sync))],
        )
        .await;
        orch.update_schedule(JobType::Backup, seoul(true)).await.unwrap();
        let timer_id = orch.state(JobType::Backup).slot.lock().await.timer_id.unwrap();

        orch.fire(JobType::Backup, timer_id).await;

        let runs = store.runs_for(JobType::Backup);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, JobStatus::Failed);
        assert!(runs[0].error.as_deref().unwrap().contains("job panicked: index out of bounds in fixture"));
        let info = orch.runtime_info(JobType::Backup).await.unwrap();
        assert!(!info.running);
        assert_eq!(info.lock_holder, None);
        let rearmed = orch.state(JobType::Backup).slot.lock().await.timer_id;
        assert!(rearmed.is_some() && rearmed != Some(timer_id));
        assert!(!store.lease.load(Ordering::SeqCst));

        let err = orch.trigger(JobType::Backup, JobParams::None).await.unwrap_err();
        assert!(matches!(err, JobError::Failed { job: JobType::Backup, .. }));
        assert!(orch.trigger(JobType::Sync, JobParams::None).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_wait_for_a_lease_held_by_another_process() {
        let store = Arc::new(MemoryStore::default());
        let handler = Arc::new(TestHandler::new(JobType::Sync));
        let orch = orchestrator(store.clone(), vec![handler.clone()]).await;

        store.lease.store(true, Ordering::SeqCst);
        let err = orch.trigger(JobType::Sync, JobParams::None).await.unwrap_err();
        assert!(matches!(err, JobError::LockWaitTimeout { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(store.lease.load(Ordering::SeqCst), "other holder untouched");

        let patient = Orchestrator::builder(store.clone())
            .lock_wait(Duration::from_secs(5))
            .handler(handler.clone())
            .build()
            .await
            .unwrap();
        let other = store.lease.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            other.store(false, Ordering::SeqCst);
        });
        let summary = patient.trigger(JobType::Sync, JobParams::None).await.unwrap();
        assert_eq!(summary.status, JobStatus::Success);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(!store.lease.load(Ordering::SeqCst), "released after the run");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_leaves_runs_of_a_busy_process_alone() {
        let store = Arc::new(MemoryStore::default());
        let elsewhere = store.create_run(JobType::Backup, JobTrigger::Manual).await.unwrap();
        store.mark_running(elsewhere.id).await.unwrap();
        store.lease.store(true, Ordering::SeqCst);

        let orch = orchestrator(store.clone(), vec![]).await;
        orch.start().await.unwrap();
        assert_eq!(store.run(elsewhere.id).unwrap().status, JobStatus::Running);
        orch.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn schedules_written_by_another_process_are_reloaded() {
        let store = Arc::new(MemoryStore::default());
        let orch = orchestrator(store.clone(), vec![]).await;
        orch.start().await.unwrap();
        assert!(orch.reload_schedules().await.unwrap().is_empty());

        store.save_schedule(JobType::Backup, &seoul(true)).await.unwrap();
        assert_eq!(orch.reload_schedules().await.unwrap(), vec![JobType::Backup]);
        assert!(orch.state(JobType::Backup).slot.lock().await.timer_id.is_some());
        assert!(orch.reload_schedules().await.unwrap().is_empty(), "unchanged schedules keep their timer");

        store.save_schedule(JobType::Backup, &seoul(false)).await.unwrap();
        assert_eq!(orch.reload_schedules().await.unwrap(), vec![JobType::Backup]);
        assert!(orch.state(JobType::Backup).slot.lock().await.timer_id.is_none());
        orch.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_for_an_outdated_schedule_rearms_instead_of_running() {
        let store = Arc::new(MemoryStore::default());
        let handler = Arc::new(TestHandler::new(JobType::Backup));
        let orch = orchestrator(store.clone(), vec![handler.clone()]).await;
        orch.update_schedule(JobType::Backup, seoul(true)).await.unwrap();
        let timer_id = orch.state(JobType::Backup).slot.lock().await.timer_id.unwrap();

        let mut moved = seoul(true);
        moved.minute = 30;
        store.save_schedule(JobType::Backup, &moved).await.unwrap();
        orch.fire(JobType::Backup, timer_id).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(store.runs_for(JobType::Backup).is_empty());
        let next = orch.runtime_info(JobType::Backup).await.unwrap().next_run.unwrap();
        assert_eq!(next.with_timezone(&chrono_tz::Asia::Seoul).minute(), 30);
        assert!(orch.state(JobType::Backup).slot.lock().await.timer_id.is_some());
    }
}
