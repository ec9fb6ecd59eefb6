//! Task broker abstraction.
//!
//! The dispatcher talks to workers through a Celery-compatible contract:
//! named tasks with string arguments on a queue, opaque task ids,
//! best-effort revocation, and a worker ping. [`RedisTaskBus`] implements
//! it on Redis lists plus revocation sets and worker heartbeats;
//! [`MemoryTaskBus`] is the in-process fake used by tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::redis_key;
use crate::error::TaskBusError;

/// Task name consumed by the worker runtime.
pub const RUN_JOB_TASK: &str = "worker.tasks.run_job";

/// Heartbeat window after which a worker counts as gone.
const WORKER_HEARTBEAT_TTL_SECONDS: i64 = 15;

/// A task envelope as it travels over the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub task: String,
    pub args: Vec<String>,
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Revocation observed for a task id.
#[derive(Debug, Clone, Copy)]
pub struct Revocation {
    pub terminate: bool,
}

/// Broker contract between dispatcher and workers.
#[async_trait]
pub trait TaskBus: Send + Sync {
    /// Send a task; returns the broker-side task id.
    async fn send(&self, task: &str, args: &[String], queue: &str)
    -> Result<String, TaskBusError>;

    /// Pop the next task off a queue, waiting up to `timeout`.
    async fn receive(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<TaskMessage>, TaskBusError>;

    /// Request revocation of a task. Advisory: tasks already running are
    /// only interrupted when `terminate` is set, and even then the job
    /// record is finalized cooperatively.
    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<(), TaskBusError>;

    /// Check whether a task id has been revoked.
    async fn check_revoked(&self, task_id: &str) -> Result<Option<Revocation>, TaskBusError>;

    /// Record a live worker under `name`; refreshed periodically.
    async fn register_worker(&self, name: &str) -> Result<(), TaskBusError>;

    /// Names of workers with a fresh heartbeat.
    async fn ping(&self, timeout: Duration) -> Result<Vec<String>, TaskBusError>;
}

/// Redis-backed broker.
#[derive(Clone)]
pub struct RedisTaskBus {
    ops: ConnectionManager,
    /// Dedicated connection for blocking pops so BRPOP never stalls the
    /// shared multiplexed connection.
    receiver: ConnectionManager,
    prefix: String,
}

impl RedisTaskBus {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, TaskBusError> {
        let client = redis::Client::open(url).map_err(TaskBusError::from)?;
        let ops = ConnectionManager::new(client.clone())
            .await
            .map_err(TaskBusError::from)?;
        let receiver = ConnectionManager::new(client)
            .await
            .map_err(TaskBusError::from)?;
        Ok(Self {
            ops,
            receiver,
            prefix: prefix.to_string(),
        })
    }

    fn queue_key(&self, queue: &str) -> String {
        redis_key(&self.prefix, &["taskbus", "queue", queue])
    }

    fn revoked_key(&self) -> String {
        redis_key(&self.prefix, &["taskbus", "revoked"])
    }

    fn terminate_key(&self) -> String {
        redis_key(&self.prefix, &["taskbus", "revoked", "terminate"])
    }

    fn workers_key(&self) -> String {
        redis_key(&self.prefix, &["taskbus", "workers"])
    }

    fn heartbeat_key(&self, name: &str) -> String {
        redis_key(&self.prefix, &["taskbus", "heartbeat", name])
    }
}

#[async_trait]
impl TaskBus for RedisTaskBus {
    async fn send(
        &self,
        task: &str,
        args: &[String],
        queue: &str,
    ) -> Result<String, TaskBusError> {
        let message = TaskMessage {
            id: Uuid::new_v4().to_string(),
            task: task.to_string(),
            args: args.to_vec(),
            queue: queue.to_string(),
            enqueued_at: Utc::now(),
        };
        let payload =
            serde_json::to_string(&message).map_err(|err| TaskBusError::Decode(err.to_string()))?;
        let mut conn = self.ops.clone();
        let _: i64 = conn.lpush(self.queue_key(queue), payload).await?;
        Ok(message.id)
    }

    async fn receive(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<TaskMessage>, TaskBusError> {
        let mut conn = self.receiver.clone();
        let popped: Option<(String, String)> = conn
            .brpop(self.queue_key(queue), timeout.as_secs_f64())
            .await?;
        match popped {
            Some((_key, payload)) => {
                let message = serde_json::from_str(&payload)
                    .map_err(|err| TaskBusError::Decode(err.to_string()))?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<(), TaskBusError> {
        let mut conn = self.ops.clone();
        let _: i64 = conn.sadd(self.revoked_key(), task_id).await?;
        if terminate {
            let _: i64 = conn.sadd(self.terminate_key(), task_id).await?;
        }
        Ok(())
    }

    async fn check_revoked(&self, task_id: &str) -> Result<Option<Revocation>, TaskBusError> {
        let mut conn = self.ops.clone();
        let revoked: bool = conn.sismember(self.revoked_key(), task_id).await?;
        if !revoked {
            return Ok(None);
        }
        let terminate: bool = conn.sismember(self.terminate_key(), task_id).await?;
        Ok(Some(Revocation { terminate }))
    }

    async fn register_worker(&self, name: &str) -> Result<(), TaskBusError> {
        let mut conn = self.ops.clone();
        let _: i64 = conn.sadd(self.workers_key(), name).await?;
        let () = conn
            .set_ex(
                self.heartbeat_key(name),
                Utc::now().to_rfc3339(),
                WORKER_HEARTBEAT_TTL_SECONDS as u64,
            )
            .await?;
        Ok(())
    }

    async fn ping(&self, _timeout: Duration) -> Result<Vec<String>, TaskBusError> {
        let mut conn = self.ops.clone();
        let names: Vec<String> = conn.smembers(self.workers_key()).await?;
        let mut alive = Vec::new();
        for name in names {
            let fresh: bool = conn.exists(self.heartbeat_key(&name)).await?;
            if fresh {
                alive.push(name);
            } else {
                let _: i64 = conn.srem(self.workers_key(), &name).await?;
            }
        }
        alive.sort();
        Ok(alive)
    }
}

#[derive(Default)]
struct MemoryBusState {
    queues: HashMap<String, VecDeque<TaskMessage>>,
    sent: Vec<TaskMessage>,
    revoked: HashMap<String, Revocation>,
    workers: Vec<String>,
    fail_sends: bool,
}

/// In-process broker used by tests and single-node setups.
#[derive(Clone, Default)]
pub struct MemoryTaskBus {
    state: Arc<Mutex<MemoryBusState>>,
}

impl MemoryTaskBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail, to exercise dispatch error paths.
    pub async fn fail_sends(&self, fail: bool) {
        self.state.lock().await.fail_sends = fail;
    }

    pub async fn with_workers(self, names: &[&str]) -> Self {
        self.state.lock().await.workers = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Every message ever sent, in order.
    pub async fn sent(&self) -> Vec<TaskMessage> {
        self.state.lock().await.sent.clone()
    }
}

#[async_trait]
impl TaskBus for MemoryTaskBus {
    async fn send(
        &self,
        task: &str,
        args: &[String],
        queue: &str,
    ) -> Result<String, TaskBusError> {
        let mut state = self.state.lock().await;
        if state.fail_sends {
            return Err(TaskBusError::Broker("broker unavailable".to_string()));
        }
        let message = TaskMessage {
            id: Uuid::new_v4().to_string(),
            task: task.to_string(),
            args: args.to_vec(),
            queue: queue.to_string(),
            enqueued_at: Utc::now(),
        };
        state.sent.push(message.clone());
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message.clone());
        Ok(message.id)
    }

    async fn receive(
        &self,
        queue: &str,
        _timeout: Duration,
    ) -> Result<Option<TaskMessage>, TaskBusError> {
        let mut state = self.state.lock().await;
        Ok(state
            .queues
            .get_mut(queue)
            .and_then(|messages| messages.pop_front()))
    }

    async fn revoke(&self, task_id: &str, terminate: bool) -> Result<(), TaskBusError> {
        let mut state = self.state.lock().await;
        let entry = state
            .revoked
            .entry(task_id.to_string())
            .or_insert(Revocation { terminate });
        entry.terminate |= terminate;
        Ok(())
    }

    async fn check_revoked(&self, task_id: &str) -> Result<Option<Revocation>, TaskBusError> {
        Ok(self.state.lock().await.revoked.get(task_id).copied())
    }

    async fn register_worker(&self, name: &str) -> Result<(), TaskBusError> {
        let mut state = self.state.lock().await;
        if !state.workers.iter().any(|existing| existing == name) {
            state.workers.push(name.to_string());
        }
        Ok(())
    }

    async fn ping(&self, _timeout: Duration) -> Result<Vec<String>, TaskBusError> {
        let mut names = self.state.lock().await.workers.clone();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_receive_roundtrip() {
        let bus = MemoryTaskBus::new();
        let id = bus
            .send(RUN_JOB_TASK, &["job-1".to_string()], "opsdeck")
            .await
            .unwrap();

        let message = bus
            .receive("opsdeck", Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.task, RUN_JOB_TASK);
        assert_eq!(message.args, vec!["job-1".to_string()]);

        assert!(
            bus.receive("opsdeck", Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn revocation_tracks_terminate_flag() {
        let bus = MemoryTaskBus::new();
        bus.revoke("t1", false).await.unwrap();
        assert!(!bus.check_revoked("t1").await.unwrap().unwrap().terminate);

        bus.revoke("t1", true).await.unwrap();
        assert!(bus.check_revoked("t1").await.unwrap().unwrap().terminate);
        assert!(bus.check_revoked("t2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_sends_surface_as_broker_errors() {
        let bus = MemoryTaskBus::new();
        bus.fail_sends(true).await;
        assert!(
            bus.send(RUN_JOB_TASK, &["job-1".to_string()], "opsdeck")
                .await
                .is_err()
        );
    }
}
