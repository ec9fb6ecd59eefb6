//! Bundled Latency Sleuth toolkit.
//!
//! Runs latency probes against HTTP endpoints, records per-sample SLA
//! breaches, and owns the periodic scheduler that enqueues probe runs.
//! Test payloads may carry `latency_overrides` to skip real network
//! calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::jobs::{HandlerError, HandlerRegistry, Job, JobContext, JobHandler, JobStatus};
use crate::scheduler::{
    DEFAULT_SCHEDULE_SAMPLE_SIZE, ProbeExecutionSummary, ProbeSample, ProbeScheduler,
    ProbeTemplate, TemplateStore,
};
use crate::toolkits::DashboardCard;

use super::{PluginEnv, ToolkitPlugin};

pub const SLUG: &str = "latency-sleuth";
pub const WORKER_MODULE: &str = "latency_sleuth_worker";

/// Probe request timeout.
const PROBE_TIMEOUT_SECONDS: u64 = 10;

/// One scheduler per worker process, across re-activations.
static SCHEDULER_STARTED: AtomicBool = AtomicBool::new(false);

pub fn dashboard_cards() -> Vec<DashboardCard> {
    vec![DashboardCard {
        title: "Latency Sleuth".to_string(),
        body: "Track endpoint latency against SLA budgets.".to_string(),
        link_text: Some("Open toolkit".to_string()),
        link_href: Some("/toolkits/latency-sleuth".to_string()),
        icon: Some("timer".to_string()),
    }]
}

pub struct LatencySleuthPlugin {
    env: PluginEnv,
    templates: TemplateStore,
}

impl LatencySleuthPlugin {
    pub fn new(env: &PluginEnv) -> Self {
        Self {
            env: env.clone(),
            templates: TemplateStore::new(env.kv.clone(), &env.prefix),
        }
    }
}

impl ToolkitPlugin for LatencySleuthPlugin {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn register_handlers(&self, registry: &HandlerRegistry) {
        registry.register(
            "latency-sleuth.run_probe",
            Arc::new(RunProbeHandler {
                templates: self.templates.clone(),
            }),
        );
    }

    fn on_activate(&self) {
        if !self.env.worker_side {
            return;
        }
        if SCHEDULER_STARTED.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::new(ProbeScheduler::new(
            self.templates.clone(),
            self.env.jobs.clone(),
            self.env.bus.clone(),
            &self.env.queue,
        ));
        tokio::spawn(scheduler.run_forever());
    }

    fn dashboard_context(&self) -> serde_json::Value {
        serde_json::json!({ "scheduler_interval_seconds": crate::scheduler::SCHEDULE_INTERVAL_SECONDS })
    }
}

struct RunProbeHandler {
    templates: TemplateStore,
}

#[async_trait]
impl JobHandler for RunProbeHandler {
    async fn run(&self, mut job: Job, ctx: &JobContext) -> Result<Job, HandlerError> {
        let payload = job.payload.clone();
        let template_id = payload
            .get("template_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| HandlerError::msg("template_id is required"))?
            .to_string();

        let template = self
            .templates
            .get(&template_id)
            .await
            .map_err(|err| HandlerError::msg(err.to_string()))?
            .ok_or_else(|| {
                HandlerError::msg(format!("Probe template {template_id} not found"))
            })?;

        let sample_size = match payload.get("sample_size") {
            None | Some(serde_json::Value::Null) => DEFAULT_SCHEDULE_SAMPLE_SIZE as usize,
            Some(value) => value
                .as_u64()
                .filter(|size| *size > 0)
                .ok_or_else(|| HandlerError::msg("sample_size must be positive"))?
                as usize,
        };
        let overrides = parse_overrides(&payload)?;

        ctx.store
            .append_log(
                &mut job,
                &format!(
                    "Running latency probe '{}' ({sample_size} samples)",
                    template.name
                ),
            )
            .await?;

        let mut samples = Vec::with_capacity(sample_size);
        for attempt in 1..=sample_size {
            if let Some(mut fresh) = ctx.cancellation_requested(&job.id).await? {
                ctx.store
                    .mark_cancelled(
                        &mut fresh,
                        Some("Probe cancellation requested; stopping remaining samples"),
                    )
                    .await?;
                return Ok(fresh);
            }

            let latency_ms = match overrides
                .as_ref()
                .and_then(|values| values.get(attempt - 1))
            {
                Some(value) => *value,
                None => measure_latency(&template).await?,
            };
            let breach = latency_ms > template.sla_ms;
            samples.push(ProbeSample {
                attempt: attempt as u32,
                latency_ms,
                breach,
                timestamp: Utc::now(),
            });

            job.set_progress((attempt * 100 / sample_size) as u8);
            ctx.store
                .append_log(
                    &mut job,
                    &format!(
                        "Attempt {attempt}: {latency_ms:.2} ms — {}",
                        if breach { "BREACH" } else { "OK" }
                    ),
                )
                .await?;
        }

        let breach_count = samples.iter().filter(|sample| sample.breach).count() as u32;
        let notified_channels = notified_channels(&template, breach_count);
        let summary = ProbeExecutionSummary {
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            sla_ms: template.sla_ms,
            samples,
            breach_count,
            notified_channels: notified_channels.clone(),
        };
        self.templates
            .record_result(&summary)
            .await
            .map_err(|err| HandlerError::msg(err.to_string()))?;

        if !notified_channels.is_empty() {
            ctx.store
                .append_log(
                    &mut job,
                    &format!(
                        "Notifications dispatched to: {}",
                        notified_channels.join(", ")
                    ),
                )
                .await?;
        }

        job.status = JobStatus::Succeeded;
        job.set_progress(100);
        job.result = Some(
            serde_json::to_value(&summary)
                .map_err(|err| HandlerError::msg(err.to_string()))?,
        );
        Ok(job)
    }
}

fn parse_overrides(payload: &serde_json::Value) -> Result<Option<Vec<f64>>, HandlerError> {
    match payload.get("latency_overrides") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Array(values)) => {
            let mut parsed = Vec::with_capacity(values.len());
            for value in values {
                parsed.push(
                    value
                        .as_f64()
                        .ok_or_else(|| HandlerError::msg("latency_overrides must be numeric"))?,
                );
            }
            Ok(Some(parsed))
        }
        Some(_) => Err(HandlerError::msg(
            "latency_overrides must be a sequence of numbers",
        )),
    }
}

async fn measure_latency(template: &ProbeTemplate) -> Result<f64, HandlerError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(PROBE_TIMEOUT_SECONDS))
        .build()
        .map_err(|err| HandlerError::msg(err.to_string()))?;
    let method = reqwest::Method::from_bytes(template.method.as_bytes())
        .map_err(|_| HandlerError::msg(format!("invalid probe method {}", template.method)))?;

    let started = Instant::now();
    client
        .request(method, &template.url)
        .send()
        .await
        .map_err(|err| HandlerError::msg(format!("probe request failed: {err}")))?;
    Ok(started.elapsed().as_secs_f64() * 1000.0)
}

fn notified_channels(template: &ProbeTemplate, breach_count: u32) -> Vec<String> {
    template
        .notification_rules
        .iter()
        .filter(|rule| rule.trigger == "always" || (rule.trigger == "breach" && breach_count > 0))
        .map(|rule| rule.channel.clone())
        .collect()
}
