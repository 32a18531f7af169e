//! Execution of one leased job
//!
//! While the pipeline runs, three background tasks watch over it:
//! - the heartbeat renews the lease every `heartbeat_interval`
//! - the cancel watcher long-polls `wait` for cancellation or revocation
//! - the deadline aborts the pipeline once the job timeout passes
//!
//! Losing the lease aborts the pipeline and discards its results; the server
//! has already handed the job to someone else.

use chrono::Utc;
use convoy_core::domain::job::{Job, JobStatus};
use convoy_core::domain::lease::LeaseClaim;
use convoy_core::domain::state::{ExecutionState, exit_code};
use convoy_core::dto::job::Work;
use convoy_core::dto::rpc::{StateReport, WaitOutcome};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::peer::{Peer, PeerError};
use crate::pipeline::{Execution, Executor, ExecutorError, PipelineOutcome};
use crate::reporter::{PeerSink, ReportLimits, Reporter};
use crate::retry::RetryPolicy;

pub struct JobRunner {
    peer: Arc<dyn Peer>,
    executor: Executor,
    heartbeat_interval: Duration,
    retry: RetryPolicy,
    limits: ReportLimits,
}

impl JobRunner {
    pub fn new(config: &Config, peer: Arc<dyn Peer>, executor: Executor) -> Self {
        Self {
            peer,
            executor,
            heartbeat_interval: config.heartbeat_interval,
            retry: config.retry.clone(),
            limits: config.limits,
        }
    }

    /// Executes the job and reports its final state
    ///
    /// Returns the status derived by the server, or `None` when the lease
    /// was lost and the results were discarded. Only exhausted retries are
    /// errors.
    pub async fn run(&self, work: Work) -> Result<Option<JobStatus>, PeerError> {
        let job = Arc::new(work.job);
        let claim = work.lease.claim();
        info!(
            job_id = %job.id,
            delivery = job.deliveries,
            "Running pipeline '{}' ({} steps)",
            job.pipeline.name,
            job.pipeline.steps.len()
        );

        let abort = CancellationToken::new();
        let stop = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        let watcher = tokio::spawn(watch_cancel(
            self.peer.clone(),
            job.id,
            abort.clone(),
            stop.clone(),
            lost.clone(),
            self.retry.base,
        ));
        let heartbeat = tokio::spawn(heartbeat(
            self.peer.clone(),
            job.id,
            claim.clone(),
            self.heartbeat_interval,
            self.retry.clone(),
            abort.clone(),
            stop.clone(),
            lost.clone(),
        ));
        let deadline = tokio::spawn(deadline(job.id, job.timeout(), abort.clone(), stop.clone()));

        let status = match self.drive(&job, &claim, &abort, &lost).await {
            Ok(Some(state)) if !lost.load(Ordering::SeqCst) => {
                self.complete(job.id, &claim, state).await
            }
            Ok(_) => Ok(None),
            Err(e) => Err(e),
        };

        stop.cancel();
        let _ = watcher.await;
        let _ = deadline.await;
        if let Ok(Err(e)) = heartbeat.await {
            return Err(e);
        }

        if let Ok(None) = status {
            warn!(job_id = %job.id, "Lease lost, results discarded");
        }
        status
    }

    /// Reports the start, runs the pipeline and builds the final state
    async fn drive(
        &self,
        job: &Arc<Job>,
        claim: &LeaseClaim,
        abort: &CancellationToken,
        lost: &AtomicBool,
    ) -> Result<Option<ExecutionState>, PeerError> {
        let started = ExecutionState::started(Utc::now());
        let report = StateReport {
            claim: claim.clone(),
            state: started.clone(),
        };
        match self
            .retry
            .run("update", || self.peer.update(job.id, &report))
            .await
        {
            Ok(()) => {}
            Err(e @ PeerError::Exhausted { .. }) => return Err(e),
            Err(e) => {
                warn!(job_id = %job.id, "Could not report start: {}", e);
                lost.store(true, Ordering::SeqCst);
                return Ok(None);
            }
        }

        let sink = Arc::new(PeerSink::new(
            self.peer.clone(),
            claim.clone(),
            self.retry.clone(),
        ));
        let reporter = Reporter::new(job.id, sink, &job.secrets, self.limits);

        let result = self.executor.run(job.clone(), &reporter, abort).await;
        reporter.flush().await;
        if reporter.failures() > 0 {
            warn!(job_id = %job.id, "{} output deliveries failed", reporter.failures());
        }

        let (code, error) = classify(result);
        info!(job_id = %job.id, exit_code = code, error = ?error, "Pipeline finished");
        Ok(Some(started.exited(Utc::now(), code, error)))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        claim: &LeaseClaim,
        state: ExecutionState,
    ) -> Result<Option<JobStatus>, PeerError> {
        let report = StateReport {
            claim: claim.clone(),
            state,
        };
        match self
            .retry
            .run("complete", || self.peer.complete(job_id, &report))
            .await
        {
            Ok(status) => {
                info!(job_id = %job_id, status = %status, "Job completed");
                Ok(Some(status))
            }
            Err(e @ PeerError::Exhausted { .. }) => Err(e),
            Err(e) => {
                warn!(job_id = %job_id, "Completion refused: {}", e);
                Ok(None)
            }
        }
    }
}

/// Maps a pipeline result to the reported exit code and error
fn classify(result: Result<Execution, ExecutorError>) -> (i32, Option<String>) {
    match result {
        Ok(execution) => match execution.outcome {
            PipelineOutcome::Exited(code) => (code, None),
            PipelineOutcome::OutOfMemory => (
                exit_code::KILLED,
                Some("exceeded memory limit".to_string()),
            ),
            PipelineOutcome::Aborted => (exit_code::KILLED, None),
        },
        Err(e) => (exit_code::ERROR, Some(e.to_string())),
    }
}

async fn watch_cancel(
    peer: Arc<dyn Peer>,
    job_id: Uuid,
    abort: CancellationToken,
    stop: CancellationToken,
    lost: Arc<AtomicBool>,
    backoff: Duration,
) {
    loop {
        let outcome = tokio::select! {
            _ = stop.cancelled() => return,
            outcome = peer.wait(job_id) => outcome,
        };

        match outcome {
            Ok(WaitOutcome::Pending) => continue,
            Ok(WaitOutcome::Cancelled) => {
                info!(job_id = %job_id, "Job cancelled, aborting pipeline");
                abort.cancel();
                return;
            }
            Ok(WaitOutcome::Revoked) => {
                warn!(job_id = %job_id, "Lease revoked, aborting pipeline");
                lost.store(true, Ordering::SeqCst);
                abort.cancel();
                return;
            }
            Ok(WaitOutcome::Finished) => return,
            Err(PeerError::NotFound(_)) => {
                warn!(job_id = %job_id, "Job no longer known to the server, aborting pipeline");
                lost.store(true, Ordering::SeqCst);
                abort.cancel();
                return;
            }
            Err(e) => {
                debug!(job_id = %job_id, "Cancel watch failed: {}, retrying in {:?}", e, backoff);
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn heartbeat(
    peer: Arc<dyn Peer>,
    job_id: Uuid,
    claim: LeaseClaim,
    interval: Duration,
    retry: RetryPolicy,
    abort: CancellationToken,
    stop: CancellationToken,
    lost: Arc<AtomicBool>,
) -> Result<(), PeerError> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let renewed = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = ticker.tick() => tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                renewed = retry.run("extend", || peer.extend(job_id, &claim)) => renewed,
            },
        };

        match renewed {
            Ok(lease) => debug!(job_id = %job_id, expires_at = %lease.expires_at, "Lease renewed"),
            Err(e @ PeerError::Exhausted { .. }) => {
                error!(job_id = %job_id, "Could not renew lease: {}", e);
                lost.store(true, Ordering::SeqCst);
                abort.cancel();
                return Err(e);
            }
            Err(e) => {
                warn!(job_id = %job_id, "Lease renewal refused: {}", e);
                lost.store(true, Ordering::SeqCst);
                abort.cancel();
                return Ok(());
            }
        }
    }
}

async fn deadline(
    job_id: Uuid,
    timeout: Duration,
    abort: CancellationToken,
    stop: CancellationToken,
) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            warn!(job_id = %job_id, "Job exceeded its timeout of {:?}, aborting pipeline", timeout);
            abort.cancel();
        }
    }
}
