//! Compiled-in toolkit plugins.
//!
//! Bundle manifests name worker modules; this table maps those names to
//! ahead-of-time compiled implementations. A bundle whose module has no
//! entry here installs as an asset-only toolkit.

pub mod latency_sleuth;
pub mod zabbix;

use std::sync::Arc;

use serde_json::Value;

use crate::jobs::{HandlerRegistry, JobStore};
use crate::kv::Kv;
use crate::taskbus::TaskBus;
use crate::toolkits::DashboardCard;

/// Everything a plugin may need when it activates.
#[derive(Clone)]
pub struct PluginEnv {
    pub kv: Arc<dyn Kv>,
    pub jobs: JobStore,
    pub bus: Arc<dyn TaskBus>,
    pub queue: String,
    pub prefix: String,
    /// True on the worker process; only workers execute handlers and run
    /// the probe scheduler.
    pub worker_side: bool,
}

/// A slug-keyed toolkit implementation.
pub trait ToolkitPlugin: Send + Sync {
    fn slug(&self) -> &'static str;

    /// Register this toolkit's job handlers.
    fn register_handlers(&self, registry: &HandlerRegistry);

    /// Called once per successful activation, after handlers are
    /// registered. Long-lived side effects (the probe scheduler) start
    /// here.
    fn on_activate(&self) {}

    /// Extra context merged into the dashboard payload.
    fn dashboard_context(&self) -> Value {
        Value::Object(Default::default())
    }
}

/// Resolve a manifest `worker_module` to a compiled plugin.
pub fn plugin_for_module(module: &str, env: &PluginEnv) -> Option<Arc<dyn ToolkitPlugin>> {
    match module {
        zabbix::WORKER_MODULE => Some(Arc::new(zabbix::ZabbixPlugin::new(env))),
        latency_sleuth::WORKER_MODULE => {
            Some(Arc::new(latency_sleuth::LatencySleuthPlugin::new(env)))
        }
        _ => None,
    }
}

/// Static description of a bundled toolkit seeded at startup.
pub struct BundledToolkit {
    pub slug: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub tags: &'static [&'static str],
    pub version: &'static str,
    pub worker_module: &'static str,
    pub dashboard_cards: fn() -> Vec<DashboardCard>,
}

/// Toolkits shipped with the server.
pub fn bundled_toolkits() -> Vec<BundledToolkit> {
    vec![
        BundledToolkit {
            slug: zabbix::SLUG,
            name: "Zabbix",
            description: "Bulk host management against Zabbix instances.",
            category: "monitoring",
            tags: &["zabbix", "hosts"],
            version: "1.2.0",
            worker_module: zabbix::WORKER_MODULE,
            dashboard_cards: zabbix::dashboard_cards,
        },
        BundledToolkit {
            slug: latency_sleuth::SLUG,
            name: "Latency Sleuth",
            description: "Scheduled latency probes with SLA breach tracking.",
            category: "monitoring",
            tags: &["latency", "probes", "sla"],
            version: "1.3.1",
            worker_module: latency_sleuth::WORKER_MODULE,
            dashboard_cards: latency_sleuth::dashboard_cards,
        },
    ]
}
