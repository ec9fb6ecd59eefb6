//! Bundled Zabbix toolkit.
//!
//! Handlers simulate the Zabbix API calls so the job pipeline can be
//! exercised end to end without a live instance: per-row progress,
//! append-only logs, and the cooperative cancellation poll between rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::jobs::{HandlerError, HandlerRegistry, Job, JobContext, JobHandler, JobStatus};
use crate::toolkits::DashboardCard;

use super::{PluginEnv, ToolkitPlugin};

pub const SLUG: &str = "zabbix";
pub const WORKER_MODULE: &str = "zabbix_worker";

/// Pause per simulated API call.
const SIMULATED_CALL_DELAY_MS: u64 = 100;

const EXPORT_STEPS: u32 = 5;

pub fn dashboard_cards() -> Vec<DashboardCard> {
    vec![DashboardCard {
        title: "Zabbix".to_string(),
        body: "Bulk-create hosts and export monitored objects.".to_string(),
        link_text: Some("Open toolkit".to_string()),
        link_href: Some("/toolkits/zabbix".to_string()),
        icon: Some("radar".to_string()),
    }]
}

pub struct ZabbixPlugin;

impl ZabbixPlugin {
    pub fn new(_env: &PluginEnv) -> Self {
        Self
    }
}

impl ToolkitPlugin for ZabbixPlugin {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn register_handlers(&self, registry: &HandlerRegistry) {
        registry.register("zabbix.bulk_add_hosts", Arc::new(BulkAddHostsHandler));
        registry.register("zabbix.bulk_export", Arc::new(BulkExportHandler));
    }
}

struct BulkAddHostsHandler;

#[async_trait]
impl JobHandler for BulkAddHostsHandler {
    async fn run(&self, mut job: Job, ctx: &JobContext) -> Result<Job, HandlerError> {
        let payload = job.payload.clone();
        let instance_id = payload
            .get("instance_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| HandlerError::msg("Missing instance_id in payload"))?
            .to_string();
        let rows = payload
            .get("rows")
            .and_then(|value| value.as_array())
            .cloned()
            .unwrap_or_default();

        ctx.store
            .append_log(&mut job, &format!("Preparing to create {} host(s)", rows.len()))
            .await?;

        let total = rows.len().max(1);
        for (idx, row) in rows.iter().enumerate() {
            let attempt = idx + 1;
            if let Some(mut fresh) = ctx.cancellation_requested(&job.id).await? {
                let processed = idx;
                fresh.set_progress((processed * 100 / total) as u8);
                fresh.result = Some(serde_json::json!({
                    "created": processed,
                    "instance_id": instance_id,
                    "cancelled": true,
                }));
                ctx.store
                    .mark_cancelled(&mut fresh, Some("Cancellation acknowledged during execution"))
                    .await?;
                return Ok(fresh);
            }

            let host = row
                .get("host")
                .and_then(|value| value.as_str())
                .unwrap_or("unknown");
            tokio::time::sleep(Duration::from_millis(SIMULATED_CALL_DELAY_MS)).await;
            job.set_progress((attempt * 100 / total) as u8);
            ctx.store.save(&mut job, true).await?;
            ctx.store
                .append_log(
                    &mut job,
                    &format!("Simulated create for host '{host}' ({attempt}/{total})"),
                )
                .await?;
        }

        job.status = JobStatus::Succeeded;
        job.set_progress(100);
        job.result = Some(serde_json::json!({
            "created": rows.len(),
            "instance_id": instance_id,
        }));
        Ok(job)
    }
}

struct BulkExportHandler;

#[async_trait]
impl JobHandler for BulkExportHandler {
    async fn run(&self, mut job: Job, ctx: &JobContext) -> Result<Job, HandlerError> {
        let payload = job.payload.clone();
        let instance_id = payload
            .get("instance_id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| HandlerError::msg("Missing instance_id in payload"))?
            .to_string();
        let target = payload
            .get("target")
            .and_then(|value| value.as_str())
            .unwrap_or("hosts")
            .to_string();
        let format = payload
            .get("format")
            .and_then(|value| value.as_str())
            .unwrap_or("json")
            .to_string();

        ctx.store
            .append_log(&mut job, &format!("Preparing export for target '{target}'"))
            .await?;

        for step in 1..=EXPORT_STEPS {
            if let Some(mut fresh) = ctx.cancellation_requested(&job.id).await? {
                ctx.store
                    .mark_cancelled(&mut fresh, Some("Cancellation acknowledged during export setup"))
                    .await?;
                return Ok(fresh);
            }
            tokio::time::sleep(Duration::from_millis(SIMULATED_CALL_DELAY_MS)).await;
            job.set_progress((step * 100 / EXPORT_STEPS) as u8);
            ctx.store.save(&mut job, true).await?;
            ctx.store
                .append_log(&mut job, &format!("Export progress {step}/{EXPORT_STEPS}"))
                .await?;
        }

        job.status = JobStatus::Succeeded;
        job.set_progress(100);
        job.result = Some(serde_json::json!({
            "target": target,
            "format": format,
            "instance_id": instance_id,
        }));
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStore;
    use crate::kv::MemoryKv;
    use pretty_assertions::assert_eq;

    fn context() -> JobContext {
        JobContext {
            store: JobStore::new(Arc::new(MemoryKv::new()), "opsdeck"),
        }
    }

    #[tokio::test]
    async fn bulk_add_hosts_simulates_each_row() {
        let ctx = context();
        let job = ctx
            .store
            .create(
                "zabbix",
                "bulk_add_hosts",
                serde_json::json!({
                    "instance_id": "i1",
                    "rows": [{"host": "h1", "ip": "10.0.0.1"}],
                }),
            )
            .await
            .unwrap();

        let finished = BulkAddHostsHandler.run(job, &ctx).await.unwrap();
        assert_eq!(finished.status, JobStatus::Succeeded);
        assert_eq!(finished.progress, 100);
        assert_eq!(finished.result.as_ref().unwrap()["created"], 1);

        let persisted = ctx.store.get(&finished.id).await.unwrap().unwrap();
        assert!(persisted.logs.iter().any(|entry| {
            entry.message == "Simulated create for host 'h1' (1/1)"
        }));
    }

    #[tokio::test]
    async fn bulk_add_hosts_requires_instance_id() {
        let ctx = context();
        let job = ctx
            .store
            .create("zabbix", "bulk_add_hosts", serde_json::json!({"rows": []}))
            .await
            .unwrap();
        let err = BulkAddHostsHandler.run(job, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("instance_id"));
    }

    #[tokio::test]
    async fn bulk_add_hosts_honours_cancellation_between_rows() {
        let ctx = context();
        let mut job = ctx
            .store
            .create(
                "zabbix",
                "bulk_add_hosts",
                serde_json::json!({
                    "instance_id": "i1",
                    "rows": [{"host": "h1"}, {"host": "h2"}],
                }),
            )
            .await
            .unwrap();
        // Cancellation arrives before the handler's first poll.
        ctx.store.mark_cancelling(&mut job, None).await.unwrap();

        let finished = BulkAddHostsHandler
            .run(ctx.store.get(&job.id).await.unwrap().unwrap(), &ctx)
            .await
            .unwrap();
        assert_eq!(finished.status, JobStatus::Cancelled);
        assert_eq!(finished.result.as_ref().unwrap()["cancelled"], true);
        assert_eq!(finished.result.as_ref().unwrap()["created"], 0);
    }

    #[tokio::test]
    async fn bulk_export_walks_five_steps() {
        let ctx = context();
        let job = ctx
            .store
            .create(
                "zabbix",
                "bulk_export",
                serde_json::json!({"instance_id": "i1", "target": "templates"}),
            )
            .await
            .unwrap();

        let finished = BulkExportHandler.run(job, &ctx).await.unwrap();
        assert_eq!(finished.status, JobStatus::Succeeded);
        assert_eq!(finished.result.as_ref().unwrap()["target"], "templates");

        let persisted = ctx.store.get(&finished.id).await.unwrap().unwrap();
        let steps = persisted
            .logs
            .iter()
            .filter(|entry| entry.message.starts_with("Export progress"))
            .count();
        assert_eq!(steps, 5);
    }
}
