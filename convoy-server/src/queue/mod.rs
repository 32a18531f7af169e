//! Work queue
//!
//! Holds every job known to the server, hands pending jobs to agents under a
//! lease, and broadcasts cancellation to whoever is watching a job.
//!
//! All state lives behind a single mutex that is never held across an
//! `.await`. Agents blocked in [`Queue::pull`] are woken through a
//! [`Notify`]; watchers blocked in [`Queue::wait_for_cancel`] subscribe to a
//! per-job `watch` channel. The channel is replaced each time the job is
//! handed back to the queue so that watchers of a stale delivery see
//! [`WaitOutcome::Revoked`] while the next holder starts clean.

mod error;

pub use error::QueueError;

use chrono::{DateTime, Utc};
use convoy_core::domain::artifact::Artifact;
use convoy_core::domain::job::{Job, JobStatus};
use convoy_core::domain::lease::{Lease, LeaseClaim};
use convoy_core::domain::log::LogLine;
use convoy_core::domain::state::{ExecutionState, exit_code};
use convoy_core::dto::job::Work;
use convoy_core::dto::rpc::{QueueStats, WaitOutcome};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use crate::notify::{JobEvent, Notifier};
use crate::storage::Storage;

/// Default time a lease stays valid without renewal
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Default number of deliveries before a job is failed
pub const DEFAULT_MAX_DELIVERIES: u32 = 3;

/// Default time a finished job stays in memory before only storage has it
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// Queue tuning
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub lease_ttl: Duration,
    pub max_deliveries: u32,
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            retention: DEFAULT_RETENTION,
        }
    }
}

pub struct Queue {
    inner: Mutex<Inner>,
    ready: Notify,
    storage: Arc<dyn Storage>,
    notifier: Notifier,
    config: QueueConfig,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Entry>,
    /// Pending job ids, oldest first
    pending: VecDeque<Uuid>,
}

struct Entry {
    job: Job,
    lease: Option<Lease>,
    signal: watch::Sender<Option<WaitOutcome>>,
}

impl Entry {
    fn new(job: Job) -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            job,
            lease: None,
            signal,
        }
    }

    /// The lease, if `claim` is its current, unexpired holder
    fn holder(&mut self, claim: &LeaseClaim, now: DateTime<Utc>) -> Result<&mut Lease, QueueError> {
        let id = self.job.id;
        if self.job.status.is_terminal() {
            return Err(QueueError::LeaseLost(id));
        }
        match self.lease.as_mut() {
            Some(lease) if lease.is_held_by(claim) && !lease.is_expired(now) => Ok(lease),
            _ => Err(QueueError::LeaseLost(id)),
        }
    }
}

/// What a watcher of a job in `status` learns without waiting
fn settled_outcome(status: JobStatus) -> Option<WaitOutcome> {
    match status {
        JobStatus::Cancelled => Some(WaitOutcome::Cancelled),
        status if status.is_terminal() => Some(WaitOutcome::Finished),
        _ => None,
    }
}

/// Terminal status of a job completed with `state`
pub fn terminal_status(cancel_requested: bool, state: &ExecutionState) -> JobStatus {
    if cancel_requested {
        JobStatus::Cancelled
    } else if state.exit_code == exit_code::KILLED && state.error.is_none() {
        JobStatus::Killed
    } else if state.error.is_some() {
        JobStatus::Error
    } else if state.exit_code == exit_code::SUCCESS {
        JobStatus::Success
    } else {
        JobStatus::Failure
    }
}

impl Queue {
    pub fn new(storage: Arc<dyn Storage>, notifier: Notifier, config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
            storage,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a pending job
    ///
    /// Pushing an id that is already known never creates a second entry: a
    /// still pending entry gets the new payload, anything else is returned
    /// untouched.
    pub async fn push(&self, job: Job) -> Result<Job, QueueError> {
        job.pipeline.validate()?;

        let stored = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.jobs.get_mut(&job.id) {
                Some(entry) if entry.job.status == JobStatus::Pending => {
                    entry.job.pipeline = job.pipeline;
                    entry.job.labels = job.labels;
                    entry.job.environment = job.environment;
                    entry.job.secrets = job.secrets;
                    entry.job.timeout_secs = job.timeout_secs;
                    entry.job.inactivity_secs = job.inactivity_secs;
                    entry.job.updated_at = Utc::now();
                    entry.job.clone()
                }
                Some(entry) => return Ok(entry.job.clone()),
                None => {
                    let mut job = job;
                    job.status = JobStatus::Pending;
                    job.agent_id = None;
                    job.state = None;
                    inner.pending.push_back(job.id);
                    inner.jobs.insert(job.id, Entry::new(job.clone()));
                    job
                }
            }
        };

        tracing::info!(job_id = %stored.id, build_id = %stored.build_id, "Job enqueued");
        self.persist(&stored).await;
        self.ready.notify_waiters();
        Ok(stored)
    }

    /// Waits up to `wait` for a pending job whose labels match, assigns it
    /// to `agent_id` and grants a lease
    pub async fn pull(
        &self,
        agent_id: &str,
        labels: &HashMap<String, String>,
        wait: Duration,
    ) -> Option<Work> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(work) = self.assign(agent_id, labels) {
                tracing::info!(
                    job_id = %work.job.id,
                    agent_id,
                    delivery = work.job.deliveries,
                    "Job assigned"
                );
                self.persist(&work.job).await;
                if work.job.deliveries > 1 {
                    if let Err(e) = self.storage.discard_output(work.job.id).await {
                        tracing::warn!(job_id = %work.job.id, "Failed to discard previous output: {}", e);
                    }
                }
                return Some(work);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn assign(&self, agent_id: &str, labels: &HashMap<String, String>) -> Option<Work> {
        let now = Utc::now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let position = inner.pending.iter().position(|id| {
            inner
                .jobs
                .get(id)
                .is_some_and(|e| e.job.status == JobStatus::Pending && e.job.matches_labels(labels))
        })?;
        let id = inner.pending.remove(position)?;
        let entry = inner.jobs.get_mut(&id)?;

        let lease = Lease::grant(id, agent_id, now, self.config.lease_ttl);
        entry.job.status = JobStatus::Assigned;
        entry.job.deliveries += 1;
        entry.job.agent_id = Some(agent_id.to_string());
        entry.job.updated_at = now;
        entry.lease = Some(lease.clone());

        Some(Work {
            job: entry.job.clone(),
            lease,
        })
    }

    /// Renews the lease of its current holder
    pub fn extend(&self, job_id: Uuid, claim: &LeaseClaim) -> Result<Lease, QueueError> {
        let now = Utc::now();
        let mut guard = self.lock();
        let entry = guard
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        let lease = entry.holder(claim, now)?;
        lease.renew(now, self.config.lease_ttl);
        Ok(lease.clone())
    }

    /// Records an intermediate execution state; the first one moves the
    /// job from Assigned to Running
    pub async fn update(
        &self,
        job_id: Uuid,
        claim: &LeaseClaim,
        state: ExecutionState,
    ) -> Result<JobStatus, QueueError> {
        let (job, transitioned) = {
            let now = Utc::now();
            let mut guard = self.lock();
            let entry = guard
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::NotFound(job_id))?;
            entry.holder(claim, now)?;

            let transitioned = entry.job.status == JobStatus::Assigned;
            if transitioned {
                entry.job.status = JobStatus::Running;
            }
            entry.job.state = Some(state);
            entry.job.updated_at = now;
            (entry.job.clone(), transitioned)
        };

        if transitioned {
            tracing::info!(job_id = %job_id, agent_id = %claim.agent_id, "Job running");
            self.persist(&job).await;
        } else if let Some(state) = &job.state {
            if let Err(e) = self.storage.persist_execution_state(job_id, state).await {
                tracing::warn!(job_id = %job_id, "Failed to persist execution state: {}", e);
            }
        }

        Ok(job.status)
    }

    /// Finishes a job with its final state and releases the lease
    pub async fn complete(
        &self,
        job_id: Uuid,
        claim: &LeaseClaim,
        state: ExecutionState,
    ) -> Result<JobStatus, QueueError> {
        let job = {
            let now = Utc::now();
            let mut guard = self.lock();
            let entry = guard
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::NotFound(job_id))?;
            entry.holder(claim, now)?;

            let status = terminal_status(entry.job.cancel_requested, &state);
            entry.job.status = status;
            entry.job.state = Some(state);
            entry.job.updated_at = now;
            entry.lease = None;
            if status != JobStatus::Cancelled {
                entry.signal.send_replace(Some(WaitOutcome::Finished));
            }
            entry.job.clone()
        };

        tracing::info!(job_id = %job_id, agent_id = %claim.agent_id, status = %job.status, "Job completed");
        self.finish(&job).await;
        Ok(job.status)
    }

    /// Requests cancellation of a job
    ///
    /// A pending job is cancelled on the spot; an assigned or running job is
    /// cancelled once its agent reports back or its lease runs out. Calling
    /// this on a finished job changes nothing.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobStatus, QueueError> {
        let found = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.jobs.get_mut(&job_id) {
                None => None,
                Some(entry) if entry.job.status.is_terminal() => return Ok(entry.job.status),
                Some(entry) => {
                    entry.job.cancel_requested = true;
                    entry.job.updated_at = Utc::now();
                    entry.signal.send_replace(Some(WaitOutcome::Cancelled));

                    let finished = entry.job.status == JobStatus::Pending;
                    if finished {
                        entry.job.status = JobStatus::Cancelled;
                        inner.pending.retain(|id| *id != job_id);
                    }
                    Some((entry.job.clone(), finished))
                }
            }
        };

        // Only finished jobs leave memory
        let Some((job, finished)) = found else {
            return Ok(self.find(job_id).await?.status);
        };

        tracing::info!(job_id = %job_id, status = %job.status, "Cancellation requested");
        if finished {
            self.finish(&job).await;
        } else {
            self.persist(&job).await;
        }
        Ok(job.status)
    }

    /// Suspends until the job is cancelled, finishes, or its current
    /// delivery is revoked
    pub async fn wait_for_cancel(&self, job_id: Uuid) -> Result<WaitOutcome, QueueError> {
        let watched = {
            let guard = self.lock();
            guard
                .jobs
                .get(&job_id)
                .map(|e| (settled_outcome(e.job.status), e.signal.subscribe()))
        };
        let mut rx = match watched {
            Some((Some(outcome), _)) => return Ok(outcome),
            Some((None, rx)) => rx,
            None => {
                let job = self.find(job_id).await?;
                return settled_outcome(job.status).ok_or(QueueError::NotFound(job_id));
            }
        };

        loop {
            if let Some(outcome) = *rx.borrow_and_update() {
                return Ok(outcome);
            }
            if rx.changed().await.is_err() {
                return Ok((*rx.borrow()).unwrap_or(WaitOutcome::Revoked));
            }
        }
    }

    /// Reclaims every job whose lease expired before `now`
    ///
    /// Cancel-requested jobs become Cancelled, jobs that used up their
    /// deliveries become Error, the rest go back to the front of the queue.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Vec<(Uuid, JobStatus)> {
        let mut requeued = Vec::new();
        let mut finished = Vec::new();

        {
            let mut guard = self.lock();
            let inner = &mut *guard;

            for entry in inner.jobs.values_mut() {
                let expired = entry.lease.as_ref().is_some_and(|l| l.is_expired(now));
                if !expired || entry.job.status.is_terminal() {
                    continue;
                }

                let holder = entry.lease.take().map(|l| l.agent_id).unwrap_or_default();
                entry.job.updated_at = now;

                if entry.job.cancel_requested {
                    entry.job.status = JobStatus::Cancelled;
                    finished.push(entry.job.clone());
                } else if entry.job.deliveries >= self.config.max_deliveries {
                    let message = format!("lease expired {} times", entry.job.deliveries);
                    let state = entry.job.state.take().unwrap_or_default();
                    entry.job.state = Some(state.exited(now, exit_code::ERROR, Some(message)));
                    entry.job.status = JobStatus::Error;
                    entry.signal.send_replace(Some(WaitOutcome::Finished));
                    finished.push(entry.job.clone());
                } else {
                    entry.job.status = JobStatus::Pending;
                    entry.job.agent_id = None;
                    entry.job.state = None;
                    entry.signal.send_replace(Some(WaitOutcome::Revoked));
                    entry.signal = watch::channel(None).0;
                    requeued.push(entry.job.clone());
                }

                tracing::warn!(
                    job_id = %entry.job.id,
                    agent_id = %holder,
                    status = %entry.job.status,
                    "Lease expired"
                );
            }

            requeued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            for job in requeued.iter().rev() {
                inner.pending.push_front(job.id);
            }
        }

        for job in &requeued {
            self.persist(job).await;
        }
        for job in &finished {
            self.finish(job).await;
        }
        if !requeued.is_empty() {
            self.ready.notify_waiters();
        }

        requeued
            .iter()
            .chain(finished.iter())
            .map(|j| (j.id, j.status))
            .collect()
    }

    /// Reloads unfinished jobs from storage
    ///
    /// Leases do not survive a restart: jobs that were assigned or running
    /// go back to pending and their previous holders lose ownership.
    pub async fn restore(&self) -> Result<usize, QueueError> {
        let stored = self.storage.incomplete_jobs().await?;
        let mut requeued = Vec::new();
        let mut finished = Vec::new();

        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            for mut job in stored {
                if inner.jobs.contains_key(&job.id) {
                    continue;
                }
                job.agent_id = None;
                job.updated_at = Utc::now();
                if job.cancel_requested {
                    job.status = JobStatus::Cancelled;
                    finished.push(job.clone());
                } else {
                    job.status = JobStatus::Pending;
                    job.state = None;
                    inner.pending.push_back(job.id);
                    requeued.push(job.clone());
                }
                inner.jobs.insert(job.id, Entry::new(job));
            }
        }

        for job in &requeued {
            self.persist(job).await;
        }
        for job in &finished {
            self.finish(job).await;
        }
        self.ready.notify_waiters();

        tracing::info!("Restored {} pending job(s) from storage", requeued.len());
        Ok(requeued.len())
    }

    /// Stores log lines sent by the lease holder
    pub async fn append_logs(
        &self,
        job_id: Uuid,
        claim: &LeaseClaim,
        lines: &[LogLine],
    ) -> Result<(), QueueError> {
        self.check_holder(job_id, claim)?;
        self.storage.persist_log_lines(job_id, lines).await?;
        Ok(())
    }

    /// Stores the artifact of a step sent by the lease holder
    pub async fn save_artifact(
        &self,
        job_id: Uuid,
        claim: &LeaseClaim,
        step: &str,
        name: &str,
        mime: &str,
        data: &[u8],
    ) -> Result<Artifact, QueueError> {
        let job = self.check_holder(job_id, claim)?;
        if !job.pipeline.steps.iter().any(|s| s.name == step) {
            return Err(QueueError::UnknownStep {
                job: job_id,
                step: step.to_string(),
            });
        }

        let artifact = Artifact {
            job_id,
            step: step.to_string(),
            name: name.to_string(),
            mime: mime.to_string(),
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        self.storage.persist_artifact(&artifact, data).await?;
        tracing::debug!(job_id = %job_id, step, size = artifact.size, "Artifact saved");
        Ok(artifact)
    }

    /// Drops finished jobs whose last change is older than the retention
    /// window; storage keeps their record
    pub fn evict_finished(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let mut guard = self.lock();
        let before = guard.jobs.len();
        guard
            .jobs
            .retain(|_, e| !e.job.status.is_terminal() || now - e.job.updated_at < retention);
        let evicted = before - guard.jobs.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} finished job(s) from memory", evicted);
        }
        evicted
    }

    fn check_holder(&self, job_id: Uuid, claim: &LeaseClaim) -> Result<Job, QueueError> {
        let mut guard = self.lock();
        let entry = guard
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        entry.holder(claim, Utc::now())?;
        Ok(entry.job.clone())
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.lock().jobs.get(&job_id).map(|e| e.job.clone())
    }

    /// A job held in memory or, once evicted, its stored record
    pub async fn find(&self, job_id: Uuid) -> Result<Job, QueueError> {
        if let Some(job) = self.get(job_id) {
            return Ok(job);
        }
        self.storage
            .find_job(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))
    }

    /// Jobs held in memory, newest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().jobs.values().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn stats(&self) -> QueueStats {
        let guard = self.lock();
        let mut stats = QueueStats::default();
        for entry in guard.jobs.values() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Assigned => stats.assigned += 1,
                JobStatus::Running => stats.running += 1,
                _ => {}
            }
        }
        stats
    }

    pub async fn logs(&self, job_id: Uuid) -> Result<Vec<LogLine>, QueueError> {
        self.find(job_id).await?;
        Ok(self.storage.logs(job_id).await?)
    }

    pub async fn artifacts(&self, job_id: Uuid) -> Result<Vec<Artifact>, QueueError> {
        self.find(job_id).await?;
        Ok(self.storage.artifacts(job_id).await?)
    }

    pub async fn artifact(
        &self,
        job_id: Uuid,
        step: &str,
    ) -> Result<Option<(Artifact, Vec<u8>)>, QueueError> {
        self.find(job_id).await?;
        Ok(self.storage.artifact_data(job_id, step).await?)
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.storage.persist_job(job).await {
            tracing::warn!(job_id = %job.id, "Failed to persist job: {}", e);
        }
    }

    /// Persists a job that just reached a terminal status and notifies
    async fn finish(&self, job: &Job) {
        self.persist(job).await;
        if let Err(e) = self.notifier.send(&JobEvent::from_job(job)).await {
            tracing::warn!(job_id = %job.id, "Notification failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use convoy_core::domain::pipeline::{Pipeline, Step};

    fn queue() -> Arc<Queue> {
        Arc::new(Queue::new(
            Arc::new(MemoryStorage::new()),
            Notifier::Log,
            QueueConfig::default(),
        ))
    }

    fn job() -> Job {
        Job::new(
            Uuid::new_v4(),
            Pipeline::new(
                "ci",
                vec![Step::new("build", "alpine", vec!["make".to_string()])],
            ),
        )
    }

    fn no_labels() -> HashMap<String, String> {
        HashMap::new()
    }

    const SHORT: Duration = Duration::from_millis(20);

    fn exited(code: i32, error: Option<&str>) -> ExecutionState {
        ExecutionState::started(Utc::now()).exited(Utc::now(), code, error.map(String::from))
    }

    fn after_ttl() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(61)
    }

    #[tokio::test]
    async fn test_pull_assigns_pending_job() {
        let queue = queue();
        let pushed = queue.push(job()).await.unwrap();

        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        assert_eq!(work.job.id, pushed.id);
        assert_eq!(work.job.status, JobStatus::Assigned);
        assert_eq!(work.job.deliveries, 1);
        assert_eq!(work.lease.agent_id, "agent-1");
        assert_eq!(queue.get(pushed.id).unwrap().status, JobStatus::Assigned);

        assert!(queue.pull("agent-2", &no_labels(), SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let queue = queue();
        let mut job = job();
        queue.push(job.clone()).await.unwrap();

        job.timeout_secs = 5;
        queue.push(job.clone()).await.unwrap();
        assert_eq!(queue.stats().pending, 1);
        assert_eq!(queue.get(job.id).unwrap().timeout_secs, 5);

        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        job.timeout_secs = 99;
        let again = queue.push(job.clone()).await.unwrap();
        assert_eq!(again.status, JobStatus::Assigned);
        assert_eq!(again.timeout_secs, 5);
        assert_eq!(work.job.id, job.id);
        assert!(queue.pull("agent-2", &no_labels(), SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_push_rejects_invalid_pipeline() {
        let queue = queue();
        let job = Job::new(Uuid::new_v4(), Pipeline::new("empty", vec![]));
        assert!(matches!(
            queue.push(job).await,
            Err(QueueError::InvalidPipeline(_))
        ));
    }

    #[tokio::test]
    async fn test_pull_times_out_when_empty() {
        let queue = queue();
        let started = tokio::time::Instant::now();
        assert!(queue.pull("agent-1", &no_labels(), SHORT).await.is_none());
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn test_pull_wakes_on_push() {
        let queue = queue();
        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .pull("agent-1", &HashMap::new(), Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let pushed = queue.push(job()).await.unwrap();

        let work = puller.await.unwrap().unwrap();
        assert_eq!(work.job.id, pushed.id);
    }

    #[tokio::test]
    async fn test_pull_filters_by_labels() {
        let queue = queue();
        let arm = queue.push(job().with_label("arch", "arm64")).await.unwrap();
        let any = queue.push(job()).await.unwrap();

        let work = queue.pull("x86", &no_labels(), SHORT).await.unwrap();
        assert_eq!(work.job.id, any.id);
        assert!(queue.pull("x86", &no_labels(), SHORT).await.is_none());

        let labels = HashMap::from([("arch".to_string(), "arm64".to_string())]);
        let work = queue.pull("arm", &labels, SHORT).await.unwrap();
        assert_eq!(work.job.id, arm.id);
    }

    #[tokio::test]
    async fn test_pull_serves_oldest_first() {
        let queue = queue();
        let first = queue.push(job()).await.unwrap();
        let second = queue.push(job()).await.unwrap();

        assert_eq!(queue.pull("a", &no_labels(), SHORT).await.unwrap().job.id, first.id);
        assert_eq!(queue.pull("a", &no_labels(), SHORT).await.unwrap().job.id, second.id);
    }

    #[tokio::test]
    async fn test_concurrent_pulls_assign_each_job_once() {
        let queue = queue();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(queue.push(job()).await.unwrap().id);
        }

        let mut handles = Vec::new();
        for i in 0..10 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .pull(&format!("agent-{}", i), &HashMap::new(), Duration::from_millis(50))
                    .await
            }));
        }

        let mut assigned = Vec::new();
        for handle in handles {
            if let Some(work) = handle.await.unwrap() {
                assigned.push(work.job.id);
            }
        }
        assigned.sort();
        ids.sort();
        assert_eq!(assigned, ids);
    }

    #[tokio::test]
    async fn test_extend_requires_current_holder() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();
        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();

        let renewed = queue.extend(job.id, &work.lease.claim()).unwrap();
        assert!(renewed.expires_at >= work.lease.expires_at);

        let stranger = LeaseClaim {
            agent_id: "agent-2".to_string(),
            token: work.lease.token,
        };
        assert!(matches!(
            queue.extend(job.id, &stranger),
            Err(QueueError::LeaseLost(_))
        ));
        assert!(matches!(
            queue.extend(Uuid::new_v4(), &stranger),
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_moves_job_to_running() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();
        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();

        let status = queue
            .update(job.id, &work.lease.claim(), ExecutionState::started(Utc::now()))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Running);
        assert_eq!(queue.stats().running, 1);
    }

    #[tokio::test]
    async fn test_complete_derives_status_and_releases_lease() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();
        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        let claim = work.lease.claim();

        let status = queue.complete(job.id, &claim, exited(2, None)).await.unwrap();
        assert_eq!(status, JobStatus::Failure);

        let stored = queue.get(job.id).unwrap();
        assert_eq!(stored.state.unwrap().exit_code, 2);
        assert!(matches!(
            queue.extend(job.id, &claim),
            Err(QueueError::LeaseLost(_))
        ));
        assert!(matches!(
            queue.complete(job.id, &claim, exited(0, None)).await,
            Err(QueueError::LeaseLost(_))
        ));
    }

    #[test]
    fn test_terminal_status_derivation() {
        assert_eq!(terminal_status(false, &exited(0, None)), JobStatus::Success);
        assert_eq!(terminal_status(false, &exited(1, None)), JobStatus::Failure);
        assert_eq!(terminal_status(false, &exited(137, None)), JobStatus::Killed);
        assert_eq!(
            terminal_status(false, &exited(137, Some("exceeded memory limit"))),
            JobStatus::Error
        );
        assert_eq!(terminal_status(false, &exited(1, Some("boom"))), JobStatus::Error);
        assert_eq!(terminal_status(true, &exited(0, None)), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();

        assert_eq!(queue.cancel(job.id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(queue.cancel(job.id).await.unwrap(), JobStatus::Cancelled);
        assert!(queue.pull("agent-1", &no_labels(), SHORT).await.is_none());
        assert_eq!(queue.wait_for_cancel(job.id).await.unwrap(), WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_running_job_wakes_watcher() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();
        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();

        let watcher = {
            let queue = queue.clone();
            let id = job.id;
            tokio::spawn(async move { queue.wait_for_cancel(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.cancel(job.id).await.unwrap(), JobStatus::Assigned);
        assert_eq!(watcher.await.unwrap().unwrap(), WaitOutcome::Cancelled);

        let status = queue
            .complete(job.id, &work.lease.claim(), exited(137, None))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_watcher_sees_finished_job() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();
        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();

        let watcher = {
            let queue = queue.clone();
            let id = job.id;
            tokio::spawn(async move { queue.wait_for_cancel(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue
            .complete(job.id, &work.lease.claim(), exited(0, None))
            .await
            .unwrap();
        assert_eq!(watcher.await.unwrap().unwrap(), WaitOutcome::Finished);
        assert_eq!(queue.wait_for_cancel(job.id).await.unwrap(), WaitOutcome::Finished);
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers_to_another_agent() {
        let queue = queue();
        let first = queue.push(job()).await.unwrap();
        let second = queue.push(job()).await.unwrap();
        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        assert_eq!(work.job.id, first.id);

        let watcher = {
            let queue = queue.clone();
            let id = first.id;
            tokio::spawn(async move { queue.wait_for_cancel(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reaped = queue.reap_expired(after_ttl()).await;
        assert_eq!(reaped, vec![(first.id, JobStatus::Pending)]);
        assert_eq!(watcher.await.unwrap().unwrap(), WaitOutcome::Revoked);

        assert!(matches!(
            queue.extend(first.id, &work.lease.claim()),
            Err(QueueError::LeaseLost(_))
        ));

        let redelivered = queue.pull("agent-2", &no_labels(), SHORT).await.unwrap();
        assert_eq!(redelivered.job.id, first.id);
        assert_eq!(redelivered.job.deliveries, 2);
        assert_ne!(redelivered.lease.token, work.lease.token);
        assert_eq!(queue.get(second.id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_reap_ignores_live_leases() {
        let queue = queue();
        queue.push(job()).await.unwrap();
        queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();

        assert!(queue.reap_expired(Utc::now()).await.is_empty());
        assert_eq!(queue.stats().assigned, 1);
    }

    #[tokio::test]
    async fn test_reap_fails_job_after_max_deliveries() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();

        for _ in 0..DEFAULT_MAX_DELIVERIES {
            queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
            queue.reap_expired(after_ttl()).await;
        }

        let failed = queue.get(job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Error);
        assert_eq!(
            failed.state.unwrap().error.as_deref(),
            Some("lease expired 3 times")
        );
        assert!(queue.pull("agent-1", &no_labels(), SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_reap_cancels_cancel_requested_job() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();
        queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        queue.cancel(job.id).await.unwrap();

        let reaped = queue.reap_expired(after_ttl()).await;
        assert_eq!(reaped, vec![(job.id, JobStatus::Cancelled)]);
        assert!(queue.pull("agent-2", &no_labels(), SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_restore_requeues_unfinished_jobs() {
        let storage = Arc::new(MemoryStorage::new());
        let mut running = job();
        running.status = JobStatus::Running;
        running.agent_id = Some("gone".to_string());
        let mut done = job();
        done.status = JobStatus::Success;
        storage.persist_job(&running).await.unwrap();
        storage.persist_job(&done).await.unwrap();

        let queue = Queue::new(storage, Notifier::Log, QueueConfig::default());
        assert_eq!(queue.restore().await.unwrap(), 1);

        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        assert_eq!(work.job.id, running.id);
        assert!(queue.get(done.id).is_none());
    }

    #[tokio::test]
    async fn test_logs_and_artifacts_require_lease() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();
        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        let claim = work.lease.claim();

        let line = LogLine {
            step: "build".to_string(),
            number: 0,
            offset_secs: 0,
            message: "compiling".to_string(),
        };
        queue.append_logs(job.id, &claim, &[line]).await.unwrap();
        queue
            .save_artifact(job.id, &claim, "build", "out.txt", "text/plain", b"ok")
            .await
            .unwrap();
        assert!(matches!(
            queue
                .save_artifact(job.id, &claim, "deploy", "x", "text/plain", b"")
                .await,
            Err(QueueError::UnknownStep { .. })
        ));

        queue.complete(job.id, &claim, exited(0, None)).await.unwrap();
        assert!(matches!(
            queue.append_logs(job.id, &claim, &[]).await,
            Err(QueueError::LeaseLost(_))
        ));

        assert_eq!(queue.logs(job.id).await.unwrap().len(), 1);
        assert_eq!(queue.artifacts(job.id).await.unwrap()[0].size, 2);
    }

    #[tokio::test]
    async fn test_redelivery_discards_previous_run_output() {
        let queue = queue();
        let job = queue.push(job()).await.unwrap();
        let lines = |run: &str, count: u64| -> Vec<LogLine> {
            (0..count)
                .map(|number| LogLine {
                    step: "build".to_string(),
                    number,
                    offset_secs: 0,
                    message: format!("{} line{}", run, number),
                })
                .collect()
        };

        let first = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        let claim = first.lease.claim();
        queue.append_logs(job.id, &claim, &lines("run1", 2)).await.unwrap();
        queue
            .save_artifact(job.id, &claim, "build", "out.txt", "text/plain", b"STALE")
            .await
            .unwrap();
        queue.reap_expired(after_ttl()).await;

        let second = queue.pull("agent-2", &no_labels(), SHORT).await.unwrap();
        assert_eq!(second.job.deliveries, 2);
        assert!(queue.logs(job.id).await.unwrap().is_empty());
        assert!(queue.artifacts(job.id).await.unwrap().is_empty());

        let claim = second.lease.claim();
        queue.append_logs(job.id, &claim, &lines("run2", 3)).await.unwrap();
        queue
            .save_artifact(job.id, &claim, "build", "out.txt", "text/plain", b"FRESH")
            .await
            .unwrap();

        queue.complete(job.id, &claim, exited(0, None)).await.unwrap();

        let messages: Vec<String> = queue
            .logs(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.message)
            .collect();
        assert_eq!(messages, vec!["run2 line0", "run2 line1", "run2 line2"]);
        let (_, data) = queue.artifact(job.id, "build").await.unwrap().unwrap();
        assert_eq!(data, b"FRESH");
    }

    #[tokio::test]
    async fn test_evicted_jobs_are_served_from_storage() {
        let queue = queue();
        let done = queue.push(job()).await.unwrap();
        let waiting = queue.push(job()).await.unwrap();
        let work = queue.pull("agent-1", &no_labels(), SHORT).await.unwrap();
        assert_eq!(work.job.id, done.id);
        let claim = work.lease.claim();
        let line = LogLine {
            step: "build".to_string(),
            number: 0,
            offset_secs: 0,
            message: "ok".to_string(),
        };
        queue.append_logs(done.id, &claim, &[line]).await.unwrap();
        queue.complete(done.id, &claim, exited(0, None)).await.unwrap();

        assert_eq!(queue.evict_finished(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(queue.evict_finished(later), 1);

        assert!(queue.get(done.id).is_none());
        assert_eq!(queue.list().len(), 1);
        assert_eq!(queue.list()[0].id, waiting.id);

        assert_eq!(queue.find(done.id).await.unwrap().status, JobStatus::Success);
        assert_eq!(queue.logs(done.id).await.unwrap().len(), 1);
        assert_eq!(queue.cancel(done.id).await.unwrap(), JobStatus::Success);
        assert_eq!(queue.wait_for_cancel(done.id).await.unwrap(), WaitOutcome::Finished);
        assert!(matches!(
            queue.find(Uuid::new_v4()).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
