//! Redis-hash job store.
//!
//! All records live in one hash (`{prefix}:jobs`, field = job id,
//! value = JSON). Writes are last-writer-wins on the whole record, so
//! anything transitioning a job to a terminal state must re-read it
//! first to avoid clobbering a concurrent cancellation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::config::redis_key;
use crate::error::JobStoreError;
use crate::kv::Kv;

use super::{Job, JobStatus, LogEntry};

/// Filters applied to [`JobStore::list`]; matches are case-insensitive
/// and the three groups combine with AND.
#[derive(Debug, Clone, Default)]
pub struct JobFilters {
    pub toolkits: Vec<String>,
    pub modules: Vec<String>,
    pub statuses: Vec<String>,
}

impl JobFilters {
    fn is_empty(&self) -> bool {
        self.toolkits.is_empty() && self.modules.is_empty() && self.statuses.is_empty()
    }

    fn matches(&self, job: &Job) -> bool {
        let contains = |values: &[String], candidate: &str| {
            values
                .iter()
                .any(|value| value.eq_ignore_ascii_case(candidate))
        };
        if !self.toolkits.is_empty() && !contains(&self.toolkits, &job.toolkit) {
            return false;
        }
        if !self.modules.is_empty() && !contains(&self.modules, &job.module) {
            return false;
        }
        if !self.statuses.is_empty() && !contains(&self.statuses, job.status.as_str()) {
            return false;
        }
        true
    }
}

/// Durable, queryable store for [`Job`] records.
#[derive(Clone)]
pub struct JobStore {
    kv: Arc<dyn Kv>,
    jobs_key: String,
}

impl JobStore {
    pub fn new(kv: Arc<dyn Kv>, prefix: &str) -> Self {
        Self {
            kv,
            jobs_key: redis_key(prefix, &["jobs"]),
        }
    }

    /// Create and persist a fresh queued job.
    pub async fn create(
        &self,
        toolkit: &str,
        operation: &str,
        payload: Value,
    ) -> Result<Job, JobStoreError> {
        let job = Job::new(toolkit, operation, payload);
        self.write(&job).await?;
        Ok(job)
    }

    /// Overwrite the stored record. Stamps `updated_at` unless the caller
    /// opts out (idempotent restores).
    pub async fn save(&self, job: &mut Job, update_timestamp: bool) -> Result<(), JobStoreError> {
        if update_timestamp {
            job.updated_at = Utc::now();
        }
        self.write(job).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, JobStoreError> {
        let Some(raw) = self.kv.hget(&self.jobs_key, job_id).await? else {
            return Ok(None);
        };
        let mut job: Job =
            serde_json::from_str(&raw).map_err(|err| JobStoreError::Decode(err.to_string()))?;
        job.normalize();
        Ok(Some(job))
    }

    /// Full-scan listing: filter, sort by `created_at` descending, then
    /// paginate. The returned total counts matches before pagination.
    pub async fn list(
        &self,
        filters: &JobFilters,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<(Vec<Job>, usize), JobStoreError> {
        let mut jobs = Vec::new();
        for raw in self.kv.hvals(&self.jobs_key).await? {
            let mut job: Job = serde_json::from_str(&raw)
                .map_err(|err| JobStoreError::Decode(err.to_string()))?;
            job.normalize();
            if filters.is_empty() || filters.matches(&job) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = jobs.len();
        let mut page: Vec<Job> = jobs.into_iter().skip(offset).collect();
        if let Some(limit) = limit {
            page.truncate(limit);
        }
        Ok((page, total))
    }

    /// Append a timestamped log line and save.
    pub async fn append_log(&self, job: &mut Job, message: &str) -> Result<(), JobStoreError> {
        job.logs.push(LogEntry {
            ts: Utc::now(),
            message: message.to_string(),
        });
        self.save(job, true).await
    }

    /// Record the broker-side task handle and save.
    pub async fn attach_broker_task(
        &self,
        job: &mut Job,
        task_id: &str,
    ) -> Result<(), JobStoreError> {
        job.celery_task_id = Some(task_id.to_string());
        self.save(job, true).await
    }

    pub async fn mark_cancelling(
        &self,
        job: &mut Job,
        message: Option<&str>,
    ) -> Result<(), JobStoreError> {
        job.status = JobStatus::Cancelling;
        match message {
            Some(message) => self.append_log(job, message).await,
            None => self.save(job, true).await,
        }
    }

    pub async fn mark_cancelled(
        &self,
        job: &mut Job,
        message: Option<&str>,
    ) -> Result<(), JobStoreError> {
        job.status = JobStatus::Cancelled;
        match message {
            Some(message) => self.append_log(job, message).await,
            None => self.save(job, true).await,
        }
    }

    pub async fn delete(&self, job_id: &str) -> Result<bool, JobStoreError> {
        Ok(self.kv.hdel(&self.jobs_key, job_id).await?)
    }

    async fn write(&self, job: &Job) -> Result<(), JobStoreError> {
        let raw =
            serde_json::to_string(job).map_err(|err| JobStoreError::Decode(err.to_string()))?;
        self.kv.hset(&self.jobs_key, &job.id, &raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use pretty_assertions::assert_eq;

    fn store() -> JobStore {
        JobStore::new(Arc::new(MemoryKv::new()), "opsdeck")
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = store();
        let job = store
            .create("zabbix", "bulk_add_hosts", serde_json::json!({"rows": []}))
            .await
            .unwrap();

        let fetched = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.job_type, "zabbix.bulk_add_hosts");
        assert_eq!(fetched.status, JobStatus::Queued);

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = store();
        for _ in 0..3 {
            store
                .create("zabbix", "bulk_add_hosts", serde_json::json!({}))
                .await
                .unwrap();
        }
        let mut probe = store
            .create("latency-sleuth", "run_probe", serde_json::json!({}))
            .await
            .unwrap();
        probe.status = JobStatus::Running;
        store.save(&mut probe, true).await.unwrap();

        let filters = JobFilters {
            toolkits: vec!["ZABBIX".to_string()],
            ..Default::default()
        };
        let (jobs, total) = store.list(&filters, Some(2), 0).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(jobs.len(), 2);

        let filters = JobFilters {
            statuses: vec!["running".to_string()],
            ..Default::default()
        };
        let (jobs, total) = store.list(&filters, None, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(jobs[0].toolkit, "latency-sleuth");

        let (all, total) = store.list(&JobFilters::default(), None, 0).await.unwrap();
        assert_eq!(total, 4);
        // Newest first.
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn append_log_preserves_order() {
        let store = store();
        let mut job = store
            .create("zabbix", "bulk_add_hosts", serde_json::json!({}))
            .await
            .unwrap();

        store.append_log(&mut job, "first").await.unwrap();
        store.append_log(&mut job, "second").await.unwrap();

        let fetched = store.get(&job.id).await.unwrap().unwrap();
        let messages: Vec<&str> = fetched
            .logs
            .iter()
            .map(|entry| entry.message.as_str())
            .collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn save_without_timestamp_keeps_updated_at() {
        let store = store();
        let mut job = store
            .create("zabbix", "bulk_add_hosts", serde_json::json!({}))
            .await
            .unwrap();
        let stamped = job.updated_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.save(&mut job, false).await.unwrap();
        assert_eq!(job.updated_at, stamped);

        store.save(&mut job, true).await.unwrap();
        assert!(job.updated_at > stamped);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = store();
        let job = store
            .create("zabbix", "bulk_add_hosts", serde_json::json!({}))
            .await
            .unwrap();
        assert!(store.delete(&job.id).await.unwrap());
        assert!(!store.delete(&job.id).await.unwrap());
    }
}
