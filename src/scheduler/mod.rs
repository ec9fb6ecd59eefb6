//! Periodic probe dispatch for the latency-sleuth toolkit.
//!
//! The scheduler runs on the worker process every 30 seconds and makes
//! two passes: dispatch templates whose `next_run_at` has arrived, and
//! resubmit queued probe jobs the broker apparently lost. Template
//! reservation is an atomic compare-and-set on the serialized record, so
//! two scheduler instances observing the same template dispatch at most
//! one job per interval; the loser's swap fails and a retry finds the
//! template no longer due.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::redis_key;
use crate::error::KvError;
use crate::jobs::{JobFilters, JobStatus, JobStore};
use crate::kv::Kv;
use crate::taskbus::{RUN_JOB_TASK, TaskBus};

pub const SCHEDULE_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_SCHEDULE_SAMPLE_SIZE: u32 = 3;
pub const STALE_JOB_GRACE_SECONDS: i64 = 120;

pub const PROBE_TOOLKIT: &str = "latency-sleuth";
pub const PROBE_OPERATION: &str = "run_probe";

const MAX_HISTORY_ENTRIES: i64 = 96;
const RESERVE_RETRIES: usize = 4;

/// Notification rule attached to a probe template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRule {
    pub channel: String,
    /// `breach` fires only on SLA violations, `always` on every run.
    #[serde(default = "default_trigger")]
    pub trigger: String,
}

fn default_trigger() -> String {
    "breach".to_string()
}

/// A periodic latency probe definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTemplate {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub sla_ms: f64,
    pub interval_seconds: u32,
    #[serde(default)]
    pub notification_rules: Vec<NotificationRule>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Fields accepted when creating a template.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeTemplateCreate {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub sla_ms: f64,
    pub interval_seconds: u32,
    #[serde(default)]
    pub notification_rules: Vec<NotificationRule>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One latency sample within a probe run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSample {
    pub attempt: u32,
    pub latency_ms: f64,
    pub breach: bool,
    pub timestamp: DateTime<Utc>,
}

/// Result summary for a completed probe run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeExecutionSummary {
    pub template_id: String,
    pub template_name: String,
    pub sla_ms: f64,
    pub samples: Vec<ProbeSample>,
    pub breach_count: u32,
    pub notified_channels: Vec<String>,
}

/// Recorded run, newest first in the history list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeHistoryEntry {
    pub template_id: String,
    pub recorded_at: DateTime<Utc>,
    pub summary: ProbeExecutionSummary,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("interval_seconds must be between 30 and 3600")]
    InvalidInterval,

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Template storage in a KV hash plus capped per-template history lists.
#[derive(Clone)]
pub struct TemplateStore {
    kv: Arc<dyn Kv>,
    templates_key: String,
    history_prefix: String,
}

impl TemplateStore {
    pub fn new(kv: Arc<dyn Kv>, prefix: &str) -> Self {
        Self {
            kv,
            templates_key: redis_key(prefix, &["toolkits", "latency_sleuth", "templates"]),
            history_prefix: redis_key(prefix, &["toolkits", "latency_sleuth", "history"]),
        }
    }

    fn history_key(&self, template_id: &str) -> String {
        format!("{}:{}", self.history_prefix, template_id)
    }

    pub async fn create(
        &self,
        payload: ProbeTemplateCreate,
    ) -> Result<ProbeTemplate, TemplateError> {
        if !(30..=3600).contains(&payload.interval_seconds) {
            return Err(TemplateError::InvalidInterval);
        }
        let now = Utc::now();
        let template = ProbeTemplate {
            id: Uuid::new_v4().to_string(),
            name: payload.name,
            url: payload.url,
            method: payload.method,
            sla_ms: payload.sla_ms,
            interval_seconds: payload.interval_seconds,
            notification_rules: payload.notification_rules,
            tags: payload.tags,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        self.write(&template).await?;
        Ok(template)
    }

    pub async fn list(&self) -> Result<Vec<ProbeTemplate>, TemplateError> {
        let mut templates = Vec::new();
        for raw in self.kv.hvals(&self.templates_key).await? {
            templates.push(decode(&raw)?);
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    pub async fn get(&self, template_id: &str) -> Result<Option<ProbeTemplate>, TemplateError> {
        match self.kv.hget(&self.templates_key, template_id).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, template_id: &str) -> Result<bool, TemplateError> {
        let removed = self.kv.hdel(&self.templates_key, template_id).await?;
        self.kv.del(&self.history_key(template_id)).await?;
        Ok(removed)
    }

    /// Templates due at `now`: `next_run_at` unset or in the past.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ProbeTemplate>, TemplateError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|template| template.next_run_at.is_none_or(|at| at <= now))
            .collect())
    }

    /// Claim a template for this tick by atomically advancing its
    /// `next_run_at` to `now + interval`. Returns false when the
    /// template is gone, no longer due, or another instance won the race
    /// on every retry.
    pub async fn reserve(
        &self,
        template_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, TemplateError> {
        for _ in 0..RESERVE_RETRIES {
            let Some(raw) = self.kv.hget(&self.templates_key, template_id).await? else {
                return Ok(false);
            };
            let mut template = decode(&raw)?;
            if template.next_run_at.is_some_and(|at| at > now) {
                // Someone else reserved it since we listed it.
                return Ok(false);
            }
            template.next_run_at = Some(now + Duration::seconds(template.interval_seconds as i64));
            template.updated_at = now;
            let updated = serde_json::to_string(&template)
                .map_err(|err| KvError::Decode(err.to_string()))?;
            if self
                .kv
                .hset_if_equals(&self.templates_key, template_id, Some(&raw), &updated)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stamp `next_run_at = now` on templates that never ran.
    pub async fn bootstrap_schedule(&self, now: DateTime<Utc>) -> Result<(), TemplateError> {
        for template in self.list().await? {
            if template.next_run_at.is_none() {
                let raw = self
                    .kv
                    .hget(&self.templates_key, &template.id)
                    .await?;
                let Some(raw) = raw else { continue };
                let mut stamped = decode(&raw)?;
                if stamped.next_run_at.is_some() {
                    continue;
                }
                stamped.next_run_at = Some(now);
                let updated = serde_json::to_string(&stamped)
                    .map_err(|err| KvError::Decode(err.to_string()))?;
                let _ = self
                    .kv
                    .hset_if_equals(&self.templates_key, &template.id, Some(&raw), &updated)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn record_result(
        &self,
        summary: &ProbeExecutionSummary,
    ) -> Result<(), TemplateError> {
        let entry = ProbeHistoryEntry {
            template_id: summary.template_id.clone(),
            recorded_at: Utc::now(),
            summary: summary.clone(),
        };
        let raw =
            serde_json::to_string(&entry).map_err(|err| KvError::Decode(err.to_string()))?;
        let key = self.history_key(&summary.template_id);
        self.kv.lpush(&key, &raw).await?;
        self.kv.ltrim(&key, 0, MAX_HISTORY_ENTRIES - 1).await?;
        Ok(())
    }

    pub async fn history(
        &self,
        template_id: &str,
        limit: i64,
    ) -> Result<Vec<ProbeHistoryEntry>, TemplateError> {
        let raw_entries = self
            .kv
            .lrange(&self.history_key(template_id), 0, limit - 1)
            .await?;
        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            entries.push(
                serde_json::from_str(&raw).map_err(|err| KvError::Decode(err.to_string()))?,
            );
        }
        Ok(entries)
    }

    async fn write(&self, template: &ProbeTemplate) -> Result<(), TemplateError> {
        let raw =
            serde_json::to_string(template).map_err(|err| KvError::Decode(err.to_string()))?;
        self.kv.hset(&self.templates_key, &template.id, &raw).await?;
        Ok(())
    }
}

fn decode(raw: &str) -> Result<ProbeTemplate, TemplateError> {
    Ok(serde_json::from_str(raw).map_err(|err| KvError::Decode(err.to_string()))?)
}

/// The scheduler itself: one instance per worker process.
pub struct ProbeScheduler {
    templates: TemplateStore,
    jobs: JobStore,
    bus: Arc<dyn TaskBus>,
    queue: String,
}

impl ProbeScheduler {
    pub fn new(
        templates: TemplateStore,
        jobs: JobStore,
        bus: Arc<dyn TaskBus>,
        queue: &str,
    ) -> Self {
        Self {
            templates,
            jobs,
            bus,
            queue: queue.to_string(),
        }
    }

    /// Run both passes once. Split out from the loop for tests.
    pub async fn tick(&self, now: DateTime<Utc>) {
        if let Err(err) = self.resubmit_stale_jobs(now).await {
            tracing::error!(error = %err, "stale probe resubmission failed");
        }
        if let Err(err) = self.dispatch_due_probes(now).await {
            tracing::error!(error = %err, "probe dispatch failed");
        }
    }

    pub async fn run_forever(self: Arc<Self>) {
        if let Err(err) = self.templates.bootstrap_schedule(Utc::now()).await {
            tracing::error!(error = %err, "schedule bootstrap failed");
        }
        tracing::info!("latency-sleuth scheduler loop started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SCHEDULE_INTERVAL_SECONDS));
        loop {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    async fn dispatch_due_probes(&self, now: DateTime<Utc>) -> Result<(), TemplateError> {
        for template in self.templates.list_due(now).await? {
            if self.has_active_job(&template.id).await {
                continue;
            }
            if !self.templates.reserve(&template.id, now).await? {
                continue;
            }

            let mut job = match self
                .jobs
                .create(
                    PROBE_TOOLKIT,
                    PROBE_OPERATION,
                    serde_json::json!({
                        "template_id": template.id,
                        "sample_size": DEFAULT_SCHEDULE_SAMPLE_SIZE,
                    }),
                )
                .await
            {
                Ok(job) => job,
                Err(err) => {
                    tracing::error!(template_id = %template.id, error = %err, "probe job create failed");
                    continue;
                }
            };
            let _ = self
                .jobs
                .append_log(&mut job, "Scheduled run enqueued by Latency Sleuth interval")
                .await;

            match self
                .bus
                .send(RUN_JOB_TASK, &[job.id.clone()], &self.queue)
                .await
            {
                Ok(task_id) => {
                    let _ = self.jobs.attach_broker_task(&mut job, &task_id).await;
                    let _ = self
                        .jobs
                        .append_log(
                            &mut job,
                            &format!("Scheduled job submitted to worker task {task_id}"),
                        )
                        .await;
                }
                Err(err) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(err.to_string());
                    let _ = self
                        .jobs
                        .append_log(&mut job, &format!("Error dispatching scheduled run: {err}"))
                        .await;
                    tracing::error!(
                        template_id = %template.id,
                        error = %err,
                        "scheduler failed to dispatch probe run"
                    );
                }
            }
        }
        Ok(())
    }

    async fn has_active_job(&self, template_id: &str) -> bool {
        let filters = JobFilters {
            toolkits: vec![PROBE_TOOLKIT.to_string()],
            ..Default::default()
        };
        let Ok((jobs, _total)) = self.jobs.list(&filters, Some(200), 0).await else {
            // Listing failure: err on the safe side and skip dispatch.
            return true;
        };
        jobs.iter().any(|job| {
            job.job_type == format!("{PROBE_TOOLKIT}.{PROBE_OPERATION}")
                && job
                    .payload
                    .get("template_id")
                    .and_then(|value| value.as_str())
                    == Some(template_id)
                && !job.is_terminal()
        })
    }

    /// Resubmit queued probe jobs older than the grace window; the
    /// broker may have dropped their tasks across a restart.
    async fn resubmit_stale_jobs(&self, now: DateTime<Utc>) -> Result<(), TemplateError> {
        let filters = JobFilters {
            toolkits: vec![PROBE_TOOLKIT.to_string()],
            ..Default::default()
        };
        let Ok((jobs, _total)) = self.jobs.list(&filters, Some(200), 0).await else {
            return Ok(());
        };
        for mut job in jobs {
            if job.job_type != format!("{PROBE_TOOLKIT}.{PROBE_OPERATION}")
                || job.status != JobStatus::Queued
            {
                continue;
            }
            if (now - job.updated_at).num_seconds() < STALE_JOB_GRACE_SECONDS {
                continue;
            }

            match self
                .bus
                .send(RUN_JOB_TASK, &[job.id.clone()], &self.queue)
                .await
            {
                Ok(task_id) => {
                    let _ = self.jobs.attach_broker_task(&mut job, &task_id).await;
                    let _ = self
                        .jobs
                        .append_log(
                            &mut job,
                            &format!("Resubmitted queued probe to worker task {task_id}"),
                        )
                        .await;
                }
                Err(err) => {
                    job.status = JobStatus::Failed;
                    job.error = Some(err.to_string());
                    let _ = self
                        .jobs
                        .append_log(&mut job, &format!("Error resubmitting scheduled run: {err}"))
                        .await;
                    tracing::error!(job_id = %job.id, error = %err, "scheduler failed to resubmit job");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::taskbus::MemoryTaskBus;
    use pretty_assertions::assert_eq;

    fn template_create(name: &str, interval: u32) -> ProbeTemplateCreate {
        ProbeTemplateCreate {
            name: name.into(),
            url: "https://svc.example/health".into(),
            method: "GET".into(),
            sla_ms: 250.0,
            interval_seconds: interval,
            notification_rules: vec![],
            tags: vec![],
        }
    }

    fn fixture() -> (ProbeScheduler, TemplateStore, JobStore, MemoryTaskBus) {
        let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
        let templates = TemplateStore::new(kv.clone(), "opsdeck");
        let jobs = JobStore::new(kv, "opsdeck");
        let bus = MemoryTaskBus::new();
        let scheduler = ProbeScheduler::new(
            templates.clone(),
            jobs.clone(),
            Arc::new(bus.clone()),
            "opsdeck",
        );
        (scheduler, templates, jobs, bus)
    }

    #[tokio::test]
    async fn interval_bounds_are_enforced() {
        let (_scheduler, templates, _jobs, _bus) = fixture();
        assert!(templates.create(template_create("fast", 29)).await.is_err());
        assert!(templates.create(template_create("slow", 3601)).await.is_err());
        assert!(templates.create(template_create("ok", 30)).await.is_ok());
    }

    #[tokio::test]
    async fn reserve_advances_next_run_at() {
        let (_scheduler, templates, _jobs, _bus) = fixture();
        let template = templates.create(template_create("t", 120)).await.unwrap();
        let now = Utc::now();

        assert!(templates.reserve(&template.id, now).await.unwrap());
        let reserved = templates.get(&template.id).await.unwrap().unwrap();
        assert_eq!(reserved.next_run_at, Some(now + Duration::seconds(120)));

        // A second reservation at the same instant finds it not due.
        assert!(!templates.reserve(&template.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_reservations_produce_one_winner() {
        let (_scheduler, templates, _jobs, _bus) = fixture();
        let template = templates.create(template_create("t", 120)).await.unwrap();
        let now = Utc::now();

        let a = templates.reserve(&template.id, now);
        let b = templates.reserve(&template.id, now);
        let (a, b) = tokio::join!(a, b);
        let wins = [a.unwrap(), b.unwrap()];
        assert_eq!(wins.iter().filter(|won| **won).count(), 1);
    }

    #[tokio::test]
    async fn dispatch_creates_one_job_and_sends_one_task() {
        let (scheduler, templates, jobs, bus) = fixture();
        templates.create(template_create("t", 120)).await.unwrap();

        let now = Utc::now();
        scheduler.tick(now).await;

        let sent = bus.sent().await;
        assert_eq!(sent.len(), 1);

        let (records, total) = jobs.list(&JobFilters::default(), None, 0).await.unwrap();
        assert_eq!(total, 1);
        let job = &records[0];
        assert_eq!(job.job_type, "latency-sleuth.run_probe");
        assert_eq!(job.payload["sample_size"], 3);
        assert!(job.logs.iter().any(|entry| {
            entry.message == "Scheduled run enqueued by Latency Sleuth interval"
        }));
        assert_eq!(job.celery_task_id.as_deref(), Some(sent[0].id.as_str()));

        // A second tick inside the interval does nothing: the template is
        // no longer due and the first job is still in flight.
        scheduler.tick(now + Duration::seconds(1)).await;
        assert_eq!(bus.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn in_flight_job_suppresses_dispatch_even_when_due() {
        let (scheduler, templates, jobs, bus) = fixture();
        templates.create(template_create("t", 30)).await.unwrap();

        scheduler.tick(Utc::now()).await;
        assert_eq!(bus.sent().await.len(), 1);

        // Force the template due again while the job is still queued.
        let later = Utc::now() + Duration::seconds(60);
        scheduler.tick(later).await;
        assert_eq!(bus.sent().await.len(), 1);

        // Finish the job; the next tick dispatches again.
        let (records, _) = jobs.list(&JobFilters::default(), None, 0).await.unwrap();
        let mut job = records[0].clone();
        job.status = JobStatus::Succeeded;
        jobs.save(&mut job, true).await.unwrap();

        scheduler.tick(later).await;
        assert_eq!(bus.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn two_due_templates_both_dispatch_in_one_pass() {
        let (scheduler, templates, _jobs, bus) = fixture();
        templates.create(template_create("a", 60)).await.unwrap();
        templates.create(template_create("b", 60)).await.unwrap();

        scheduler.tick(Utc::now()).await;
        assert_eq!(bus.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn stale_queued_jobs_are_resubmitted() {
        let (scheduler, _templates, jobs, bus) = fixture();
        let mut job = jobs
            .create(
                PROBE_TOOLKIT,
                PROBE_OPERATION,
                serde_json::json!({"template_id": "t1", "sample_size": 3}),
            )
            .await
            .unwrap();
        // Age the record past the grace window.
        job.updated_at = Utc::now() - Duration::seconds(STALE_JOB_GRACE_SECONDS + 10);
        jobs.save(&mut job, false).await.unwrap();

        scheduler.tick(Utc::now()).await;

        let sent = bus.sent().await;
        assert_eq!(sent.len(), 1);
        let refreshed = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(refreshed.celery_task_id.as_deref(), Some(sent[0].id.as_str()));
        assert!(refreshed.logs.iter().any(|entry| {
            entry
                .message
                .starts_with("Resubmitted queued probe to worker task")
        }));
    }

    #[tokio::test]
    async fn fresh_queued_jobs_are_left_alone() {
        let (scheduler, _templates, jobs, bus) = fixture();
        jobs.create(
            PROBE_TOOLKIT,
            PROBE_OPERATION,
            serde_json::json!({"template_id": "t1", "sample_size": 3}),
        )
        .await
        .unwrap();

        scheduler.tick(Utc::now()).await;
        assert!(bus.sent().await.is_empty());
    }

    #[tokio::test]
    async fn broker_failure_marks_scheduled_job_failed() {
        let (scheduler, templates, jobs, bus) = fixture();
        templates.create(template_create("t", 60)).await.unwrap();
        bus.fail_sends(true).await;

        scheduler.tick(Utc::now()).await;

        let (records, total) = jobs.list(&JobFilters::default(), None, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].status, JobStatus::Failed);
        assert!(records[0].error.is_some());
    }

    #[tokio::test]
    async fn bootstrap_stamps_missing_next_run_at() {
        let (_scheduler, templates, _jobs, _bus) = fixture();
        let template = templates.create(template_create("t", 60)).await.unwrap();
        assert!(template.next_run_at.is_none());

        let now = Utc::now();
        templates.bootstrap_schedule(now).await.unwrap();
        let stamped = templates.get(&template.id).await.unwrap().unwrap();
        assert_eq!(stamped.next_run_at, Some(now));
    }

    #[tokio::test]
    async fn history_is_capped_and_newest_first() {
        let (_scheduler, templates, _jobs, _bus) = fixture();
        let template = templates.create(template_create("t", 60)).await.unwrap();

        for attempt in 0..3 {
            let summary = ProbeExecutionSummary {
                template_id: template.id.clone(),
                template_name: template.name.clone(),
                sla_ms: 250.0,
                samples: vec![ProbeSample {
                    attempt,
                    latency_ms: 100.0 + attempt as f64,
                    breach: false,
                    timestamp: Utc::now(),
                }],
                breach_count: 0,
                notified_channels: vec![],
            };
            templates.record_result(&summary).await.unwrap();
        }

        let history = templates.history(&template.id, 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].summary.samples[0].attempt, 2);
    }
}
