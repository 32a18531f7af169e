//! Result reporting
//!
//! Step output flows through a [`StepStream`] into one forwarding task per
//! step, which masks secrets, numbers lines and delivers them in batches.
//! Delivery failures are counted and logged; they never fail the job.

mod sink;

#[cfg(test)]
pub use sink::MemorySink;
pub use sink::{PeerSink, ResultSink};

use convoy_core::domain::job::Secret;
use convoy_core::domain::log::LogLine;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::peer::ArtifactUpload;

pub const DEFAULT_MAX_LOG_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_ARTIFACT_BYTES: usize = 1024 * 1024;

/// Replacement for masked secret values
pub const MASK: &str = "********";

const BATCH_SIZE: usize = 100;
const BATCH_BYTES: usize = 1024 * 1024;
/// Longer lines are cut at a character boundary
const MAX_LINE_BYTES: usize = 64 * 1024;
const LOG_LIMIT_NOTICE: &str = "log limit exceeded, further output dropped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportLimits {
    /// Per-step log volume
    pub max_log_bytes: usize,
    /// Per-artifact size; larger artifacts are truncated
    pub max_artifact_bytes: usize,
}

impl Default for ReportLimits {
    fn default() -> Self {
        Self {
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
        }
    }
}

/// Replaces secret values in output lines
#[derive(Debug, Default)]
struct Masker {
    values: Vec<String>,
}

impl Masker {
    fn new(secrets: &[Secret]) -> Self {
        let mut values: Vec<String> = secrets
            .iter()
            .filter(|s| s.masked && !s.value.is_empty())
            .map(|s| s.value.clone())
            .collect();
        // Longest first so a secret containing another is masked whole
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        values.dedup();
        Self { values }
    }

    fn mask(&self, line: &str) -> String {
        self.values
            .iter()
            .fold(line.to_string(), |line, value| line.replace(value.as_str(), MASK))
    }
}

/// Output channel of one step
pub struct StepStream {
    tx: mpsc::UnboundedSender<String>,
}

impl StepStream {
    pub fn send(&self, line: String) {
        let _ = self.tx.send(line);
    }
}

pub struct Reporter {
    job_id: Uuid,
    sink: Arc<dyn ResultSink>,
    masker: Arc<Masker>,
    limits: ReportLimits,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    uploaded: Mutex<HashSet<String>>,
    failures: Arc<AtomicUsize>,
}

impl Reporter {
    pub fn new(
        job_id: Uuid,
        sink: Arc<dyn ResultSink>,
        secrets: &[Secret],
        limits: ReportLimits,
    ) -> Self {
        Self {
            job_id,
            sink,
            masker: Arc::new(Masker::new(secrets)),
            limits,
            tasks: Mutex::new(Vec::new()),
            uploaded: Mutex::new(HashSet::new()),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Opens the output stream of a step that is starting now
    ///
    /// Lines are delivered in the order they are sent; offsets are relative
    /// to this call.
    pub fn stream(&self, step: &str) -> StepStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = Forwarder {
            job_id: self.job_id,
            step: step.to_string(),
            sink: self.sink.clone(),
            masker: self.masker.clone(),
            max_bytes: self.limits.max_log_bytes,
            failures: self.failures.clone(),
        };
        let handle = tokio::spawn(forwarder.run(rx));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        StepStream { tx }
    }

    /// Queues the artifact of a step for upload
    ///
    /// Returns false when the step already uploaded one; only the first is kept.
    pub fn upload_artifact(&self, step: &str, name: &str, mime: &str, mut data: Vec<u8>) -> bool {
        let first = self
            .uploaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step.to_string());
        if !first {
            warn!(job_id = %self.job_id, "Step '{}' already uploaded an artifact, ignoring '{}'", step, name);
            return false;
        }

        if data.len() > self.limits.max_artifact_bytes {
            warn!(
                job_id = %self.job_id,
                "Artifact '{}' of step '{}' is {} bytes, truncating to {}",
                name,
                step,
                data.len(),
                self.limits.max_artifact_bytes
            );
            data.truncate(self.limits.max_artifact_bytes);
        }

        let upload = ArtifactUpload {
            step: step.to_string(),
            name: name.to_string(),
            mime: mime.to_string(),
            data,
        };
        let job_id = self.job_id;
        let sink = self.sink.clone();
        let failures = self.failures.clone();
        let handle = tokio::spawn(async move {
            let step = upload.step.clone();
            match sink.upload_artifact(job_id, upload).await {
                Ok(()) => debug!(job_id = %job_id, "Uploaded artifact of step '{}'", step),
                Err(e) => {
                    failures.fetch_add(1, Ordering::SeqCst);
                    warn!(job_id = %job_id, "Failed to upload artifact of step '{}': {}", step, e);
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        true
    }

    /// Waits until every opened stream is closed and all output is delivered
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(job_id = %self.job_id, "Output forwarding task failed: {}", e);
            }
        }
    }

    /// Number of deliveries that failed
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

struct Forwarder {
    job_id: Uuid,
    step: String,
    sink: Arc<dyn ResultSink>,
    masker: Arc<Masker>,
    max_bytes: usize,
    failures: Arc<AtomicUsize>,
}

impl Forwarder {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<String>) {
        let started = Instant::now();
        let mut number = 0u64;
        let mut bytes = 0usize;
        let mut capped = false;

        while let Some(first) = rx.recv().await {
            let mut batch = Vec::new();
            let mut batch_bytes = 0usize;
            let mut next = Some(first);

            while let Some(raw) = next {
                let raw = clip(raw, MAX_LINE_BYTES);
                if !capped {
                    let message = if bytes + raw.len() > self.max_bytes {
                        capped = true;
                        warn!(job_id = %self.job_id, "Step '{}' exceeded the log limit", self.step);
                        LOG_LIMIT_NOTICE.to_string()
                    } else {
                        bytes += raw.len();
                        self.masker.mask(&raw)
                    };
                    batch_bytes += message.len();
                    batch.push(LogLine {
                        step: self.step.clone(),
                        number,
                        offset_secs: started.elapsed().as_secs(),
                        message,
                    });
                    number += 1;
                }
                if batch.len() >= BATCH_SIZE || batch_bytes >= BATCH_BYTES {
                    break;
                }
                next = rx.try_recv().ok();
            }

            if batch.is_empty() {
                continue;
            }
            if let Err(e) = self.sink.append_lines(self.job_id, batch).await {
                self.failures.fetch_add(1, Ordering::SeqCst);
                warn!(job_id = %self.job_id, "Failed to deliver logs of step '{}': {}", self.step, e);
            }
        }
    }
}

fn clip(mut line: String, max: usize) -> String {
    if line.len() > max {
        let mut end = max;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        line.truncate(end);
    }
    line
}
