//! In-memory storage

use async_trait::async_trait;
use convoy_core::domain::artifact::Artifact;
use convoy_core::domain::job::Job;
use convoy_core::domain::log::LogLine;
use convoy_core::domain::state::ExecutionState;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

use super::{Storage, StorageError};

/// Storage kept in process memory
///
/// Used when no database is configured and throughout the tests.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    logs: HashMap<Uuid, BTreeMap<(String, u64), LogLine>>,
    artifacts: HashMap<(Uuid, String), (Artifact, Vec<u8>)>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn persist_job(&self, job: &Job) -> Result<(), StorageError> {
        self.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn persist_execution_state(
        &self,
        job_id: Uuid,
        state: &ExecutionState,
    ) -> Result<(), StorageError> {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.state = Some(state.clone());
        }
        Ok(())
    }

    async fn persist_log_lines(
        &self,
        job_id: Uuid,
        lines: &[LogLine],
    ) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let stored = inner.logs.entry(job_id).or_default();
        for line in lines {
            stored
                .entry((line.step.clone(), line.number))
                .or_insert_with(|| line.clone());
        }
        Ok(())
    }

    async fn persist_artifact(&self, artifact: &Artifact, data: &[u8]) -> Result<(), StorageError> {
        self.lock()
            .artifacts
            .entry((artifact.job_id, artifact.step.clone()))
            .or_insert_with(|| (artifact.clone(), data.to_vec()));
        Ok(())
    }

    async fn discard_output(&self, job_id: Uuid) -> Result<(), StorageError> {
        let mut inner = self.lock();
        inner.logs.remove(&job_id);
        inner.artifacts.retain(|(id, _), _| *id != job_id);
        Ok(())
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn logs(&self, job_id: Uuid) -> Result<Vec<LogLine>, StorageError> {
        Ok(self
            .lock()
            .logs
            .get(&job_id)
            .map(|lines| lines.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn artifacts(&self, job_id: Uuid) -> Result<Vec<Artifact>, StorageError> {
        let mut artifacts: Vec<Artifact> = self
            .lock()
            .artifacts
            .iter()
            .filter(|((id, _), _)| *id == job_id)
            .map(|(_, (artifact, _))| artifact.clone())
            .collect();
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(artifacts)
    }

    async fn artifact_data(
        &self,
        job_id: Uuid,
        step: &str,
    ) -> Result<Option<(Artifact, Vec<u8>)>, StorageError> {
        Ok(self
            .lock()
            .artifacts
            .get(&(job_id, step.to_string()))
            .cloned())
    }

    async fn incomplete_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn line(step: &str, number: u64, message: &str) -> LogLine {
        LogLine {
            step: step.to_string(),
            number,
            offset_secs: 0,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_lines_are_idempotent() {
        let storage = MemoryStorage::new();
        let job_id = Uuid::new_v4();

        storage
            .persist_log_lines(job_id, &[line("build", 0, "a"), line("build", 1, "b")])
            .await
            .unwrap();
        storage
            .persist_log_lines(job_id, &[line("build", 1, "retried"), line("build", 2, "c")])
            .await
            .unwrap();

        let logs = storage.logs(job_id).await.unwrap();
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_first_artifact_upload_wins() {
        let storage = MemoryStorage::new();
        let artifact = Artifact {
            job_id: Uuid::new_v4(),
            step: "build".to_string(),
            name: "report.xml".to_string(),
            mime: "application/xml".to_string(),
            size: 3,
            created_at: Utc::now(),
        };

        storage.persist_artifact(&artifact, b"one").await.unwrap();
        storage.persist_artifact(&artifact, b"two").await.unwrap();

        let (_, data) = storage
            .artifact_data(artifact.job_id, "build")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"one");
        assert_eq!(storage.artifacts(artifact.job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discard_output_only_touches_one_job() {
        let storage = MemoryStorage::new();
        let kept = Uuid::new_v4();
        let dropped = Uuid::new_v4();

        for job_id in [kept, dropped] {
            storage
                .persist_log_lines(job_id, &[line("build", 0, "out")])
                .await
                .unwrap();
            let artifact = Artifact {
                job_id,
                step: "build".to_string(),
                name: "out.txt".to_string(),
                mime: "text/plain".to_string(),
                size: 3,
                created_at: Utc::now(),
            };
            storage.persist_artifact(&artifact, b"out").await.unwrap();
        }

        storage.discard_output(dropped).await.unwrap();

        assert!(storage.logs(dropped).await.unwrap().is_empty());
        assert!(storage.artifacts(dropped).await.unwrap().is_empty());
        assert_eq!(storage.logs(kept).await.unwrap().len(), 1);
        assert_eq!(storage.artifacts(kept).await.unwrap().len(), 1);
    }
}
