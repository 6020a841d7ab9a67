//! Job Registry (C3): single source of truth for job lifecycle, backed by
//! the shared key-value store (grounded on `tasks`' file-backed storage
//! layer and `healer`'s reconciliation loop, generalized onto a KV seam).

mod log;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kv_store::KeyValueStore;
use scan_core::{CoreError, CoreResult, Job, JobId, JobKind, JobState};
use tracing::{info, warn};

pub use log::{DEFAULT_CAP_BYTES, PAGE_SIZE};

fn job_key(id: JobId) -> String {
    format!("job:{id}")
}

fn children_key(parent_id: JobId) -> String {
    format!("job:children:{parent_id}")
}

fn heartbeat_key(worker_id: &str) -> String {
    format!("worker:heartbeat:{worker_id}")
}

pub struct JobRegistry {
    store: Arc<dyn KeyValueStore>,
    log_cap_bytes: u64,
    worker_id: Option<String>,
}

impl JobRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, log_cap_bytes: u64) -> Self {
        Self { store, log_cap_bytes, worker_id: None }
    }

    /// Attaches this process's worker id so every `running` transition
    /// records `owner_worker_id` (spec.md §4.3 `WorkerLost` detection).
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    async fn save(&self, job: &Job) -> CoreResult<()> {
        let bytes = serde_json::to_vec(job).map_err(|e| CoreError::InvalidOutput(e.to_string()))?;
        self.store.set(&job_key(job.id), bytes).await
    }

    /// Assigns a fresh id, state `queued`, `attempt=1` (spec.md §4.3).
    pub async fn create(&self, kind: JobKind, parent_id: Option<JobId>) -> CoreResult<Job> {
        let job = Job::new(kind, parent_id);
        self.save(&job).await?;

        if let Some(parent_id) = parent_id {
            self.store.set_add(&children_key(parent_id), &job.id.to_string()).await?;
        }

        info!(job_id = %job.id, kind = ?job.kind, "job created");
        Ok(job)
    }

    /// # Errors
    /// Returns [`CoreError::NotFound`] if `id` has no registry entry.
    pub async fn get(&self, id: JobId) -> CoreResult<Job> {
        let bytes = self
            .store
            .get(&job_key(id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::InvalidOutput(e.to_string()))
    }

    /// CAS on current state; legal transitions are enforced by
    /// [`Job::transition`]. `patch` may mutate other fields (e.g. `result`,
    /// `error`, `container_name`) in the same write.
    ///
    /// # Errors
    /// Returns [`CoreError::IllegalTransition`] without persisting anything
    /// if the transition is not legal from the job's current state.
    pub async fn transition(
        &self,
        id: JobId,
        to: JobState,
        patch: impl FnOnce(&mut Job),
    ) -> CoreResult<Job> {
        let mut job = self.get(id).await?;
        job.transition(to)?;
        if to == JobState::Running {
            if let Some(worker_id) = &self.worker_id {
                job.owner_worker_id = Some(worker_id.clone());
            }
        }
        patch(&mut job);
        self.save(&job).await?;
        Ok(job)
    }

    pub async fn list_children(&self, parent_id: JobId) -> CoreResult<Vec<Job>> {
        let ids = self.store.set_members(&children_key(parent_id)).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for raw in ids {
            if let Ok(id) = raw.parse::<JobId>() {
                if let Ok(job) = self.get(id).await {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs)
    }

    pub async fn append_log(&self, id: JobId, chunk: &[u8]) -> CoreResult<()> {
        log::append(self.store.as_ref(), id, chunk, self.log_cap_bytes).await
    }

    pub async fn read_log(&self, id: JobId, from_offset: u64) -> CoreResult<(Vec<u8>, u64)> {
        log::read(self.store.as_ref(), id, from_offset).await
    }

    /// Mark a worker alive. Workers call this every `H=15s` (spec.md §5);
    /// the entry expires if the worker stops renewing it.
    pub async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> CoreResult<()> {
        self.store.set_with_ttl(&heartbeat_key(worker_id), b"1".to_vec(), ttl).await
    }

    async fn worker_is_alive(&self, worker_id: &str) -> CoreResult<bool> {
        self.store.exists(&heartbeat_key(worker_id)).await
    }

    /// On startup, transition any job left `running` by a worker whose
    /// heartbeat has since expired to `failure` with `error=WorkerLost`
    /// (spec.md §4.3 durability, §8 test 6).
    pub async fn recover_lost_jobs(&self) -> CoreResult<usize> {
        let mut recovered = 0;
        for key in self.store.scan_keys("job:*").await? {
            if key.starts_with("job:children:") {
                continue;
            }
            let Ok(id) = key.trim_start_matches("job:").parse::<JobId>() else {
                continue;
            };
            let Ok(job) = self.get(id).await else { continue };
            if job.state != JobState::Running {
                continue;
            }
            let alive = match &job.owner_worker_id {
                Some(worker_id) => self.worker_is_alive(worker_id).await?,
                None => false,
            };
            if alive {
                continue;
            }
            warn!(job_id = %id, "recovering job abandoned by a dead worker");
            self.transition(id, JobState::Failure, |j| {
                j.error = Some("WorkerLost".to_string());
            })
            .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Removes terminal jobs older than `before` and their logs, skipping
    /// anything in `protected` (e.g. jobs still referenced by an un-reaped
    /// pipeline run).
    pub async fn reap(&self, before: DateTime<Utc>, protected: &HashSet<JobId>) -> CoreResult<usize> {
        let mut reaped = 0;
        for key in self.store.scan_keys("job:*").await? {
            if key.starts_with("job:children:") {
                continue;
            }
            let Ok(id) = key.trim_start_matches("job:").parse::<JobId>() else {
                continue;
            };
            if protected.contains(&id) {
                continue;
            }
            let Ok(job) = self.get(id).await else { continue };
            let Some(finished_at) = job.finished_at else { continue };
            if !job.state.is_terminal() || finished_at >= before {
                continue;
            }
            self.store.delete(&job_key(id)).await?;
            self.store.delete(&format!("joblog:{id}:meta")).await?;
            reaped += 1;
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::InMemoryStore;
    use scan_core::{ScanPayload, TemplateSelector};

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(InMemoryStore::new()), DEFAULT_CAP_BYTES)
    }

    fn scan_kind() -> JobKind {
        JobKind::Scan(ScanPayload {
            scan_id: "client-1".into(),
            target: "https://example.com".into(),
            template_selector: TemplateSelector::All,
        })
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let reg = registry();
        let job = reg.create(scan_kind(), None).await.unwrap();
        let fetched = reg.get(job.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.state, JobState::Queued);
    }

    #[tokio::test]
    async fn get_missing_job_is_not_found() {
        let reg = registry();
        let err = reg.get(JobId::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn transition_enforces_legal_table() {
        let reg = registry();
        let job = reg.create(scan_kind(), None).await.unwrap();
        let err = reg.transition(job.id, JobState::Success, |_| {}).await.unwrap_err();
        assert!(matches!(err, CoreError::IllegalTransition { .. }));

        reg.transition(job.id, JobState::Running, |j| {
            j.owner_worker_id = Some("worker-1".into());
        })
        .await
        .unwrap();
        let job = reg.transition(job.id, JobState::Success, |j| {
            j.result = Some(serde_json::json!({"ok": true}));
        })
        .await
        .unwrap();
        assert_eq!(job.state, JobState::Success);
    }

    #[tokio::test]
    async fn list_children_returns_only_direct_children() {
        let reg = registry();
        let parent = reg.create(scan_kind(), None).await.unwrap();
        let child_a = reg.create(scan_kind(), Some(parent.id)).await.unwrap();
        let child_b = reg.create(scan_kind(), Some(parent.id)).await.unwrap();
        let _unrelated = reg.create(scan_kind(), None).await.unwrap();

        let mut children: Vec<JobId> = reg.list_children(parent.id).await.unwrap().into_iter().map(|j| j.id).collect();
        children.sort_by_key(ToString::to_string);
        let mut expected = vec![child_a.id, child_b.id];
        expected.sort_by_key(ToString::to_string);
        assert_eq!(children, expected);
    }

    #[tokio::test]
    async fn append_and_read_log_round_trip() {
        let reg = registry();
        let job = reg.create(scan_kind(), None).await.unwrap();
        reg.append_log(job.id, b"[INF] New Scan Started\n").await.unwrap();
        let (bytes, next) = reg.read_log(job.id, 0).await.unwrap();
        assert_eq!(bytes, b"[INF] New Scan Started\n");
        assert_eq!(next, bytes.len() as u64);
    }

    #[tokio::test]
    async fn recover_transitions_running_jobs_with_dead_workers_to_failure() {
        let reg = registry();
        let job = reg.create(scan_kind(), None).await.unwrap();
        reg.transition(job.id, JobState::Running, |j| {
            j.owner_worker_id = Some("worker-gone".into());
        })
        .await
        .unwrap();

        let recovered = reg.recover_lost_jobs().await.unwrap();
        assert_eq!(recovered, 1);

        let job = reg.get(job.id).await.unwrap();
        assert_eq!(job.state, JobState::Failure);
        assert_eq!(job.error.as_deref(), Some("WorkerLost"));
    }

    #[tokio::test]
    async fn recover_leaves_jobs_with_live_workers_alone() {
        let reg = registry();
        let job = reg.create(scan_kind(), None).await.unwrap();
        reg.heartbeat("worker-1", Duration::from_secs(60)).await.unwrap();
        reg.transition(job.id, JobState::Running, |j| {
            j.owner_worker_id = Some("worker-1".into());
        })
        .await
        .unwrap();

        let recovered = reg.recover_lost_jobs().await.unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(reg.get(job.id).await.unwrap().state, JobState::Running);
    }
}
