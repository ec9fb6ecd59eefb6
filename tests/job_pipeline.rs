//! End-to-end job pipeline: dispatcher → broker → worker runtime →
//! bundled toolkit handlers, on in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use opsdeck::db::MemoryDb;
use opsdeck::jobs::{Dispatcher, HandlerRegistry, JobStatus, JobStore, WorkerRuntime};
use opsdeck::kv::{Kv, MemoryKv};
use opsdeck::taskbus::{MemoryTaskBus, RUN_JOB_TASK, TaskBus};
use opsdeck::toolkits::plugins::PluginEnv;
use opsdeck::toolkits::{ToolkitLoader, ToolkitRegistry};

struct Pipeline {
    dispatcher: Dispatcher,
    runtime: Arc<WorkerRuntime>,
    bus: MemoryTaskBus,
    store: JobStore,
}

async fn pipeline() -> Pipeline {
    let kv: Arc<dyn Kv> = Arc::new(MemoryKv::new());
    let db = Arc::new(MemoryDb::new());
    let bus = MemoryTaskBus::new();
    let store = JobStore::new(kv.clone(), "opsdeck");
    let handlers = Arc::new(HandlerRegistry::new());

    let registry = ToolkitRegistry::new(db, kv.clone(), "opsdeck");
    let loader = Arc::new(ToolkitLoader::new(
        registry,
        handlers.clone(),
        PluginEnv {
            kv,
            jobs: store.clone(),
            bus: Arc::new(bus.clone()),
            queue: "opsdeck".to_string(),
            prefix: "opsdeck".to_string(),
            worker_side: false,
        },
    ));
    loader.ensure_bundled_installed().await.unwrap();

    let runtime = Arc::new(WorkerRuntime::new(
        store.clone(),
        Arc::new(bus.clone()),
        handlers,
        "opsdeck",
        2,
    ));
    runtime.set_loader(loader);

    Pipeline {
        dispatcher: Dispatcher::new(store.clone(), Arc::new(bus.clone()), "opsdeck"),
        runtime,
        bus,
        store,
    }
}

/// Drain one broker task and execute it, the way the worker loop does.
async fn work_one(pipeline: &Pipeline) {
    let message = pipeline
        .bus
        .receive("opsdeck", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("a task is queued");
    assert_eq!(message.task, RUN_JOB_TASK);
    pipeline.runtime.run_job(&message.args[0]).await.unwrap();
}

#[tokio::test]
async fn enqueue_then_succeed() {
    let pipeline = pipeline().await;

    let job = pipeline
        .dispatcher
        .enqueue(
            "zabbix",
            "bulk_add_hosts",
            serde_json::json!({
                "instance_id": "i1",
                "rows": [{"host": "h1", "ip": "10.0.0.1"}],
            }),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    work_one(&pipeline).await;

    let finished = pipeline.store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Succeeded);
    assert_eq!(finished.progress, 100);
    assert_eq!(finished.result.as_ref().unwrap()["created"], 1);
    assert!(
        finished
            .logs
            .iter()
            .any(|entry| entry.message == "Simulated create for host 'h1' (1/1)")
    );
}

#[tokio::test]
async fn cancel_while_queued_never_reaches_a_handler() {
    let pipeline = pipeline().await;

    let job = pipeline
        .dispatcher
        .enqueue(
            "zabbix",
            "bulk_add_hosts",
            serde_json::json!({"instance_id": "i1", "rows": [{"host": "h1"}]}),
        )
        .await
        .unwrap();

    let cancelled = pipeline.dispatcher.cancel(&job.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.result.is_none());

    // The worker still receives the broker task but leaves the record
    // terminal and untouched.
    work_one(&pipeline).await;
    let after = pipeline.store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
    assert!(after.result.is_none());

    let messages: Vec<&str> = after
        .logs
        .iter()
        .map(|entry| entry.message.as_str())
        .collect();
    assert!(messages.contains(&"Cancellation requested"));
    assert!(messages.contains(&"Job cancelled before execution"));
}

#[tokio::test]
async fn lazy_load_registers_handlers_on_first_job() {
    let pipeline = pipeline().await;

    // Simulate a worker that booted before the toolkit was enabled.
    pipeline.runtime.registry().unregister_slug("zabbix");

    let job = pipeline
        .dispatcher
        .enqueue(
            "zabbix",
            "bulk_add_hosts",
            serde_json::json!({"instance_id": "i1", "rows": []}),
        )
        .await
        .unwrap();
    work_one(&pipeline).await;

    let finished = pipeline.store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn unknown_toolkit_job_fails_cleanly() {
    let pipeline = pipeline().await;

    let job = pipeline
        .dispatcher
        .enqueue("ghost", "noop", serde_json::json!({}))
        .await
        .unwrap();
    work_one(&pipeline).await;

    let finished = pipeline.store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Failed);
    assert_eq!(
        finished.error.as_deref(),
        Some("No handler registered for job type ghost.noop")
    );
}

#[tokio::test]
async fn terminate_revoke_is_recorded_on_the_bus() {
    let pipeline = pipeline().await;

    let job = pipeline
        .dispatcher
        .enqueue(
            "zabbix",
            "bulk_add_hosts",
            serde_json::json!({"instance_id": "i1", "rows": [{"host": "h1"}]}),
        )
        .await
        .unwrap();
    pipeline.dispatcher.cancel(&job.id).await.unwrap();

    let task_id = pipeline
        .store
        .get(&job.id)
        .await
        .unwrap()
        .unwrap()
        .celery_task_id
        .unwrap();
    let revocation = pipeline.bus.check_revoked(&task_id).await.unwrap().unwrap();
    assert!(revocation.terminate);
}
