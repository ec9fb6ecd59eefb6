//! API-side job dispatch.
//!
//! Enqueue creates the durable record first, then sends the broker task
//! and attaches the returned task id. A broker failure marks the job
//! failed immediately so nothing is left orphaned in `queued`.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{JobStoreError, TaskBusError};
use crate::taskbus::{RUN_JOB_TASK, TaskBus};

use super::{Job, JobStatus, JobStore};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Broker(#[from] TaskBusError),
}

#[derive(Clone)]
pub struct Dispatcher {
    store: JobStore,
    bus: Arc<dyn TaskBus>,
    queue: String,
}

impl Dispatcher {
    pub fn new(store: JobStore, bus: Arc<dyn TaskBus>, queue: &str) -> Self {
        Self {
            store,
            bus,
            queue: queue.to_string(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Create a job and hand it to the broker.
    pub async fn enqueue(
        &self,
        toolkit: &str,
        operation: &str,
        payload: Value,
    ) -> Result<Job, DispatchError> {
        let mut job = self.store.create(toolkit, operation, payload).await?;

        match self
            .bus
            .send(RUN_JOB_TASK, &[job.id.clone()], &self.queue)
            .await
        {
            Ok(task_id) => {
                self.store.attach_broker_task(&mut job, &task_id).await?;
                Ok(job)
            }
            Err(err) => {
                job.status = JobStatus::Failed;
                job.error = Some(err.to_string());
                self.store
                    .append_log(&mut job, &format!("Error dispatching job: {err}"))
                    .await?;
                Err(err.into())
            }
        }
    }

    pub async fn get_status(&self, job_id: &str) -> Result<Option<Job>, DispatchError> {
        Ok(self.store.get(job_id).await?)
    }

    /// Cooperative cancellation.
    ///
    /// Terminal jobs are returned unchanged. Queued jobs are finalized
    /// here because no worker will ever see them; running jobs get a
    /// `cancelling` mark plus a broker revoke and the handler finishes
    /// the transition.
    pub async fn cancel(&self, job_id: &str) -> Result<Option<Job>, DispatchError> {
        let Some(mut job) = self.store.get(job_id).await? else {
            return Ok(None);
        };
        if job.is_terminal() {
            return Ok(Some(job));
        }

        let previous_status = job.status;
        self.store
            .mark_cancelling(&mut job, Some("Cancellation requested"))
            .await?;

        if let Some(task_id) = job.celery_task_id.clone() {
            // Broker control calls can block; bound them.
            match tokio::time::timeout(
                std::time::Duration::from_secs(5),
                self.bus.revoke(&task_id, true),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(job_id, task_id, error = %err, "broker revoke failed");
                }
                Err(_) => {
                    tracing::warn!(job_id, task_id, "broker revoke timed out");
                }
            }
        }

        if previous_status == JobStatus::Queued {
            self.store
                .mark_cancelled(&mut job, Some("Job cancelled before execution"))
                .await?;
        } else {
            self.store
                .append_log(&mut job, "Cancellation signal sent to worker")
                .await?;
        }

        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use super::super::JobFilters;
    use super::*;
    use crate::kv::MemoryKv;
    use crate::taskbus::MemoryTaskBus;
    use pretty_assertions::assert_eq;

    fn fixture() -> (Dispatcher, MemoryTaskBus, JobStore) {
        let store = JobStore::new(Arc::new(MemoryKv::new()), "opsdeck");
        let bus = MemoryTaskBus::new();
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(bus.clone()), "opsdeck");
        (dispatcher, bus, store)
    }

    #[tokio::test]
    async fn enqueue_sends_task_and_attaches_id() {
        let (dispatcher, bus, _store) = fixture();
        let job = dispatcher
            .enqueue("zabbix", "bulk_add_hosts", serde_json::json!({"rows": []}))
            .await
            .unwrap();

        let sent = bus.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].task, RUN_JOB_TASK);
        assert_eq!(sent[0].args, vec![job.id.clone()]);
        assert_eq!(job.celery_task_id.as_deref(), Some(sent[0].id.as_str()));
    }

    #[tokio::test]
    async fn broker_failure_marks_job_failed() {
        let (dispatcher, bus, store) = fixture();
        bus.fail_sends(true).await;

        let err = dispatcher
            .enqueue("zabbix", "bulk_add_hosts", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Broker(_)));

        let (jobs, total) = store
            .list(&JobFilters::default(), None, 0)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error.is_some());
    }

    #[tokio::test]
    async fn cancel_of_queued_job_finalizes_without_worker() {
        let (dispatcher, bus, _store) = fixture();
        let job = dispatcher
            .enqueue("zabbix", "bulk_add_hosts", serde_json::json!({}))
            .await
            .unwrap();

        let cancelled = dispatcher.cancel(&job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.result.is_none());
        let messages: Vec<&str> = cancelled
            .logs
            .iter()
            .map(|entry| entry.message.as_str())
            .collect();
        assert!(messages.contains(&"Cancellation requested"));
        assert!(messages.contains(&"Job cancelled before execution"));

        // The broker saw a terminate revoke for the attached task.
        let task_id = cancelled.celery_task_id.unwrap();
        assert!(bus.check_revoked(&task_id).await.unwrap().unwrap().terminate);
    }

    #[tokio::test]
    async fn cancel_of_running_job_only_signals() {
        let (dispatcher, _bus, store) = fixture();
        let mut job = dispatcher
            .enqueue("zabbix", "bulk_add_hosts", serde_json::json!({}))
            .await
            .unwrap();
        job.status = JobStatus::Running;
        store.save(&mut job, true).await.unwrap();

        let cancelling = dispatcher.cancel(&job.id).await.unwrap().unwrap();
        assert_eq!(cancelling.status, JobStatus::Cancelling);
        let messages: Vec<&str> = cancelling
            .logs
            .iter()
            .map(|entry| entry.message.as_str())
            .collect();
        assert!(messages.contains(&"Cancellation signal sent to worker"));
    }

    #[tokio::test]
    async fn cancel_of_terminal_job_is_a_noop() {
        let (dispatcher, _bus, store) = fixture();
        let mut job = dispatcher
            .enqueue("zabbix", "bulk_add_hosts", serde_json::json!({}))
            .await
            .unwrap();
        job.status = JobStatus::Succeeded;
        job.result = Some(serde_json::json!({"created": 1}));
        store.save(&mut job, true).await.unwrap();

        let unchanged = dispatcher.cancel(&job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, JobStatus::Succeeded);
        assert_eq!(unchanged.result, Some(serde_json::json!({"created": 1})));
    }

    #[tokio::test]
    async fn cancel_of_missing_job_returns_none() {
        let (dispatcher, _bus, _store) = fixture();
        assert!(dispatcher.cancel("missing").await.unwrap().is_none());
    }
}
