//! Worker-side job execution.
//!
//! The runtime consumes broker tasks, resolves a handler by job type
//! (`{toolkit}.{operation}`), and runs it. Cancellation is cooperative:
//! handlers poll the job record between units of work and finalize the
//! `cancelling` → `cancelled` transition themselves. A `terminate=true`
//! revoke additionally aborts the in-flight handler task; the job record
//! is still finalized through the cooperative path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

use crate::error::JobStoreError;
use crate::taskbus::{RUN_JOB_TASK, TaskBus};

use super::{Job, JobStatus, JobStore};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Execution context handed to handlers; gives them job-store access for
/// the cooperative cancellation poll and incremental saves.
#[derive(Clone)]
pub struct JobContext {
    pub store: JobStore,
}

impl JobContext {
    /// Re-read the job and report whether cancellation was requested.
    /// Returns the fresh record so the handler can finalize it.
    pub async fn cancellation_requested(
        &self,
        job_id: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        match self.store.get(job_id).await? {
            Some(job) if job.status == JobStatus::Cancelling => Ok(Some(job)),
            _ => Ok(None),
        }
    }
}

/// A function registered under a job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: Job, ctx: &JobContext) -> Result<Job, HandlerError>;
}

/// Mutex-guarded map from job type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .lock()
            .expect("handler registry poisoned")
            .insert(job_type.to_string(), handler);
    }

    /// Remove every handler registered under `{slug}.`.
    pub fn unregister_slug(&self, slug: &str) {
        let prefix = format!("{slug}.");
        self.handlers
            .lock()
            .expect("handler registry poisoned")
            .retain(|job_type, _| !job_type.starts_with(&prefix));
    }

    pub fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .lock()
            .expect("handler registry poisoned")
            .get(job_type)
            .cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .lock()
            .expect("handler registry poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

/// Hook the runtime uses to lazily (re)load a toolkit whose handler is
/// missing, e.g. when a bundle was enabled after the worker started.
#[async_trait]
pub trait LazyLoader: Send + Sync {
    async fn reload_slug(&self, slug: &str);
}

pub struct WorkerRuntime {
    store: JobStore,
    bus: Arc<dyn TaskBus>,
    registry: Arc<HandlerRegistry>,
    loader: OnceLock<Arc<dyn LazyLoader>>,
    queue: String,
    concurrency: usize,
    worker_name: String,
    running: Mutex<HashMap<String, AbortHandle>>,
}

impl WorkerRuntime {
    pub fn new(
        store: JobStore,
        bus: Arc<dyn TaskBus>,
        registry: Arc<HandlerRegistry>,
        queue: &str,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            loader: OnceLock::new(),
            queue: queue.to_string(),
            concurrency: concurrency.max(1),
            worker_name: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Wire the toolkit loader once it exists; the runtime and loader are
    /// constructed in dependency order, so this closes the cycle.
    pub fn set_loader(&self, loader: Arc<dyn LazyLoader>) {
        let _ = self.loader.set(loader);
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        self.registry.clone()
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            store: self.store.clone(),
        }
    }

    /// Execute a single job by id. Entry point for broker tasks.
    pub async fn run_job(&self, job_id: &str) -> Result<(), JobStoreError> {
        let Some(mut job) = self.store.get(job_id).await? else {
            tracing::debug!(job_id, "job vanished before execution");
            return Ok(());
        };

        if job.status == JobStatus::Cancelling {
            self.store
                .mark_cancelled(&mut job, Some("Cancellation acknowledged before execution"))
                .await?;
            return Ok(());
        }
        if job.is_terminal() {
            return Ok(());
        }

        job.status = JobStatus::Running;
        job.progress = 0;
        self.store.save(&mut job, true).await?;
        self.store.append_log(&mut job, "Job execution started").await?;

        let handler = match self.resolve_handler(&job.job_type).await {
            Some(handler) => handler,
            None => {
                job.status = JobStatus::Failed;
                let message = format!("No handler registered for job type {}", job.job_type);
                job.error = Some(message.clone());
                self.store
                    .append_log(&mut job, &format!("Error: {message}"))
                    .await?;
                return Ok(());
            }
        };

        let ctx = self.context();
        match handler.run(job.clone(), &ctx).await {
            Ok(mut finished) => {
                if !finished.is_terminal() {
                    finished.status = JobStatus::Succeeded;
                    finished.set_progress(100);
                }
                self.store.save(&mut finished, true).await?;
            }
            Err(err) => {
                // Re-read so a concurrent cancel is not clobbered.
                let mut current = self.store.get(job_id).await?.unwrap_or(job);
                if !current.is_terminal() {
                    current.status = JobStatus::Failed;
                    current.error = Some(err.to_string());
                    self.store
                        .append_log(&mut current, &format!("Error: {err}"))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn resolve_handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(handler) = self.registry.lookup(job_type) {
            return Some(handler);
        }
        // Lazily load the owning toolkit: the bundle may have been
        // installed or enabled after this worker process started.
        let slug = job_type.split('.').next().unwrap_or(job_type);
        if let Some(loader) = self.loader.get() {
            loader.reload_slug(slug).await;
        }
        self.registry.lookup(job_type)
    }

    /// Consume broker tasks until the process exits.
    pub async fn run_forever(self: Arc<Self>) {
        tracing::info!(
            queue = %self.queue,
            concurrency = self.concurrency,
            worker = %self.worker_name,
            "worker runtime started"
        );

        let watcher = self.clone();
        tokio::spawn(async move { watcher.watch_revocations().await });

        let permits = Arc::new(Semaphore::new(self.concurrency));
        loop {
            if let Err(err) = self.bus.register_worker(&self.worker_name).await {
                tracing::warn!(error = %err, "worker heartbeat failed");
            }

            let message = match self.bus.receive(&self.queue, Duration::from_secs(1)).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "broker receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if message.task != RUN_JOB_TASK {
                tracing::warn!(task = %message.task, "ignoring unknown task");
                continue;
            }
            let Some(job_id) = message.args.first().cloned() else {
                tracing::warn!("run_job task without a job id");
                continue;
            };

            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let runtime = self.clone();
            let task_id = message.id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = runtime.run_job(&job_id).await {
                    tracing::error!(job_id, error = %err, "job execution failed");
                }
                runtime
                    .running
                    .lock()
                    .expect("running map poisoned")
                    .remove(&task_id);
            });
            self.running
                .lock()
                .expect("running map poisoned")
                .insert(message.id, handle.abort_handle());
        }
    }

    /// Abort in-flight tasks whose broker id was revoked with terminate.
    async fn watch_revocations(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let task_ids: Vec<String> = self
                .running
                .lock()
                .expect("running map poisoned")
                .keys()
                .cloned()
                .collect();
            for task_id in task_ids {
                match self.bus.check_revoked(&task_id).await {
                    Ok(Some(revocation)) if revocation.terminate => {
                        if let Some(handle) = self
                            .running
                            .lock()
                            .expect("running map poisoned")
                            .remove(&task_id)
                        {
                            tracing::info!(task_id, "terminating revoked task");
                            handle.abort();
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "revocation check failed");
                    }
                }
            }
        }
    }
}
