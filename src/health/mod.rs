//! Component health aggregation.
//!
//! Three checks (database connectivity, broker worker ping, optional
//! frontend fetch) roll up into a worst-wins summary ranked
//! healthy < unknown < degraded < down. The summary is cached for a
//! minute; `force_refresh` bypasses the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use url::Url;

use crate::db::Database;
use crate::taskbus::TaskBus;

const CACHE_TTL: Duration = Duration::from_secs(60);
const WORKER_PING_TIMEOUT: Duration = Duration::from_secs(2);
const FRONTEND_TIMEOUT_MS: u64 = 2_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unknown,
    Degraded,
    Down,
}

impl HealthStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unknown => 1,
            Self::Degraded => 2,
            Self::Down => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: &'static str,
    pub status: HealthStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

fn short_error(message: impl std::fmt::Display) -> String {
    let message = message.to_string();
    let trimmed = message.trim();
    if trimmed.chars().count() > 160 {
        let shortened: String = trimmed.chars().take(157).collect();
        format!("{shortened}...")
    } else {
        trimmed.to_string()
    }
}

pub struct HealthAggregator {
    db: Arc<dyn Database>,
    bus: Arc<dyn TaskBus>,
    frontend_base_url: Option<Url>,
    cache: Mutex<Option<(Instant, HealthSummary)>>,
}

impl HealthAggregator {
    pub fn new(
        db: Arc<dyn Database>,
        bus: Arc<dyn TaskBus>,
        frontend_base_url: Option<Url>,
    ) -> Self {
        Self {
            db,
            bus,
            frontend_base_url,
            cache: Mutex::new(None),
        }
    }

    /// Cached summary; `force_refresh` runs the checks regardless.
    pub async fn summary(&self, force_refresh: bool) -> HealthSummary {
        if !force_refresh {
            let cache = self.cache.lock().await;
            if let Some((at, summary)) = cache.as_ref() {
                if at.elapsed() < CACHE_TTL {
                    return summary.clone();
                }
            }
        }
        let summary = self.check_all().await;
        *self.cache.lock().await = Some((Instant::now(), summary.clone()));
        summary
    }

    pub async fn check_all(&self) -> HealthSummary {
        let (backend, worker, frontend) = tokio::join!(
            self.check_backend(),
            self.check_worker(),
            self.check_frontend(),
        );
        let components = vec![frontend, backend, worker];
        let status = components
            .iter()
            .map(|component| component.status)
            .max_by_key(|status| status.rank())
            .unwrap_or(HealthStatus::Unknown);
        HealthSummary {
            status,
            components,
            checked_at: Utc::now(),
        }
    }

    async fn check_backend(&self) -> ComponentHealth {
        let started = Instant::now();
        match self.db.ping().await {
            Ok(()) => ComponentHealth {
                component: "backend",
                status: HealthStatus::Healthy,
                message: "Database connectivity verified.".to_string(),
                latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
            },
            Err(err) => ComponentHealth {
                component: "backend",
                status: HealthStatus::Down,
                message: format!("Database check failed: {}", short_error(err)),
                latency_ms: None,
            },
        }
    }

    async fn check_worker(&self) -> ComponentHealth {
        let started = Instant::now();
        let pinged = tokio::time::timeout(
            WORKER_PING_TIMEOUT,
            self.bus.ping(WORKER_PING_TIMEOUT),
        )
        .await;
        let latency = started.elapsed().as_secs_f64() * 1000.0;
        match pinged {
            Ok(Ok(workers)) if workers.is_empty() => ComponentHealth {
                component: "worker",
                status: HealthStatus::Degraded,
                message: "No workers responded within timeout.".to_string(),
                latency_ms: Some(latency),
            },
            Ok(Ok(workers)) => {
                let message = if workers.len() == 1 {
                    format!("1 worker responding: {}", workers[0])
                } else {
                    format!("{} workers responding: {}", workers.len(), workers.join(", "))
                };
                ComponentHealth {
                    component: "worker",
                    status: HealthStatus::Healthy,
                    message,
                    latency_ms: Some(latency),
                }
            }
            Ok(Err(err)) => ComponentHealth {
                component: "worker",
                status: HealthStatus::Down,
                message: format!("Worker ping failed: {}", short_error(err)),
                latency_ms: None,
            },
            Err(_) => ComponentHealth {
                component: "worker",
                status: HealthStatus::Degraded,
                message: "No workers responded within timeout.".to_string(),
                latency_ms: Some(latency),
            },
        }
    }

    async fn check_frontend(&self) -> ComponentHealth {
        let Some(url) = &self.frontend_base_url else {
            return ComponentHealth {
                component: "frontend",
                status: HealthStatus::Healthy,
                message: "No external frontend URL configured; assuming co-hosted UI.".to_string(),
                latency_ms: None,
            };
        };

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_millis(FRONTEND_TIMEOUT_MS))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                return ComponentHealth {
                    component: "frontend",
                    status: HealthStatus::Unknown,
                    message: short_error(err),
                    latency_ms: None,
                };
            }
        };

        let started = Instant::now();
        match client
            .get(url.clone())
            .header("Accept", "text/html")
            .send()
            .await
        {
            Ok(response) => {
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                if response.status().is_success() || response.status().is_redirection() {
                    ComponentHealth {
                        component: "frontend",
                        status: HealthStatus::Healthy,
                        message: format!("Responded with HTTP {}.", response.status().as_u16()),
                        latency_ms: Some(latency),
                    }
                } else {
                    ComponentHealth {
                        component: "frontend",
                        status: HealthStatus::Degraded,
                        message: format!(
                            "Returned HTTP {}; investigate load balancer or app logs.",
                            response.status().as_u16()
                        ),
                        latency_ms: Some(latency),
                    }
                }
            }
            Err(err) => ComponentHealth {
                component: "frontend",
                status: HealthStatus::Down,
                message: format!("Request to frontend failed: {}", short_error(err)),
                latency_ms: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::taskbus::MemoryTaskBus;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn all_healthy_when_db_and_workers_respond() {
        let db = Arc::new(MemoryDb::new());
        let bus = MemoryTaskBus::new().with_workers(&["worker-1"]).await;
        let aggregator = HealthAggregator::new(db, Arc::new(bus), None);

        let summary = aggregator.check_all().await;
        assert_eq!(summary.status, HealthStatus::Healthy);
        let worker = summary
            .components
            .iter()
            .find(|component| component.component == "worker")
            .unwrap();
        assert!(worker.message.contains("worker-1"));
    }

    #[tokio::test]
    async fn missing_workers_degrade_the_summary() {
        let db = Arc::new(MemoryDb::new());
        let bus = MemoryTaskBus::new();
        let aggregator = HealthAggregator::new(db, Arc::new(bus), None);

        let summary = aggregator.check_all().await;
        assert_eq!(summary.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn summary_is_cached_until_forced() {
        let db = Arc::new(MemoryDb::new());
        let bus = MemoryTaskBus::new();
        let aggregator = HealthAggregator::new(db, Arc::new(bus.clone()), None);

        let first = aggregator.summary(false).await;
        assert_eq!(first.status, HealthStatus::Degraded);

        // A worker appears, but the cached summary is returned.
        bus.register_worker("worker-1").await.unwrap();
        let cached = aggregator.summary(false).await;
        assert_eq!(cached.status, HealthStatus::Degraded);

        let refreshed = aggregator.summary(true).await;
        assert_eq!(refreshed.status, HealthStatus::Healthy);
    }

    #[test]
    fn worst_status_wins() {
        let statuses = [
            HealthStatus::Healthy,
            HealthStatus::Unknown,
            HealthStatus::Degraded,
            HealthStatus::Down,
        ];
        for window in statuses.windows(2) {
            assert!(window[0].rank() < window[1].rank());
        }
    }
}
