//! opsdeck entry point: `serve` (HTTP API), `worker` (job executor +
//! probe scheduler), and `bootstrap-admin` (first-admin helper).

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use opsdeck::auth::audit::AuditService;
use opsdeck::auth::providers::{ProviderDeps, ProviderRegistry};
use opsdeck::auth::state::StateSigner;
use opsdeck::auth::tokens::TokenService;
use opsdeck::auth::AuthService;
use opsdeck::catalog::CatalogService;
use opsdeck::config::Config;
use opsdeck::db::{Database, PgStore};
use opsdeck::health::HealthAggregator;
use opsdeck::http::{self, AppState};
use opsdeck::jobs::{Dispatcher, HandlerRegistry, JobStore, WorkerRuntime};
use opsdeck::kv::{Kv, RedisKv};
use opsdeck::secrets::{MemorySecretStore, SecretStore};
use opsdeck::taskbus::{RedisTaskBus, TaskBus};
use opsdeck::toolkits::bundle::{BundleInstaller, BundleLimits};
use opsdeck::toolkits::plugins::PluginEnv;
use opsdeck::toolkits::{ToolkitLoader, ToolkitRegistry};

#[derive(Parser)]
#[command(name = "opsdeck", about = "Multi-tenant operations toolbox server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server.
    Serve,
    /// Run the background worker and probe scheduler.
    Worker,
    /// Create the first administrator account.
    BootstrapAdmin {
        #[arg(long)]
        username: String,
        /// Password; falls back to OPSDECK_BOOTSTRAP_PASSWORD.
        #[arg(long, env = "OPSDECK_BOOTSTRAP_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        email: Option<String>,
    },
}

/// Everything both processes share.
struct Runtime {
    config: Arc<Config>,
    db: Arc<dyn Database>,
    kv: Arc<dyn Kv>,
    bus: Arc<dyn TaskBus>,
    jobs: JobStore,
    handlers: Arc<HandlerRegistry>,
    registry: ToolkitRegistry,
    loader: Arc<ToolkitLoader>,
    installer: Arc<BundleInstaller>,
    audit: AuditService,
    auth: AuthService,
    secrets: Arc<dyn SecretStore>,
}

async fn build_runtime(config: Config, worker_side: bool) -> anyhow::Result<Runtime> {
    let config = Arc::new(config);

    let store = PgStore::new(&config.database)
        .await
        .context("connecting to postgres")?;
    store.run_migrations().await.context("running migrations")?;
    let db: Arc<dyn Database> = Arc::new(store);

    let kv: Arc<dyn Kv> = Arc::new(
        RedisKv::connect(&config.redis_url)
            .await
            .context("connecting to redis")?,
    );
    let bus: Arc<dyn TaskBus> = Arc::new(
        RedisTaskBus::connect(&config.redis_url, &config.redis_prefix)
            .await
            .context("connecting to task broker")?,
    );

    let jobs = JobStore::new(kv.clone(), &config.redis_prefix);
    let handlers = Arc::new(HandlerRegistry::new());
    let registry = ToolkitRegistry::new(db.clone(), kv.clone(), &config.redis_prefix);
    let env = PluginEnv {
        kv: kv.clone(),
        jobs: jobs.clone(),
        bus: bus.clone(),
        queue: config.worker_queue.clone(),
        prefix: config.redis_prefix.clone(),
        worker_side,
    };
    let loader = Arc::new(ToolkitLoader::new(
        registry.clone(),
        handlers.clone(),
        env,
    ));
    let installer = Arc::new(BundleInstaller::new(
        loader.clone(),
        config.toolkits.storage_dir.clone(),
        BundleLimits {
            upload_max_bytes: config.toolkits.upload_max_bytes,
            bundle_max_bytes: config.toolkits.bundle_max_bytes,
            bundle_max_file_bytes: config.toolkits.bundle_max_file_bytes,
        },
    ));

    let audit = AuditService::new(db.clone(), config.audit_retention_days);
    let tokens = TokenService::new(config.auth.clone())
        .map_err(|err| anyhow::anyhow!("token service: {err}"))?;
    let auth = AuthService::new(db.clone(), tokens, audit.clone());
    let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());

    Ok(Runtime {
        config,
        db,
        kv,
        bus,
        jobs,
        handlers,
        registry,
        loader,
        installer,
        audit,
        auth,
        secrets,
    })
}

async fn serve(runtime: Runtime) -> anyhow::Result<()> {
    let Runtime {
        config,
        db,
        kv,
        bus,
        jobs,
        handlers: _,
        registry,
        loader,
        installer,
        audit,
        auth,
        secrets,
    } = runtime;

    loader
        .ensure_bundled_installed()
        .await
        .map_err(|err| anyhow::anyhow!("seeding bundled toolkits: {err}"))?;
    loader
        .activate_enabled()
        .await
        .map_err(|err| anyhow::anyhow!("activating toolkits: {err}"))?;

    let state_signer = StateSigner::new(
        config.auth.state_signing_secret().clone(),
        config.auth.sso_state_ttl_seconds,
    );
    let providers = Arc::new(
        ProviderRegistry::build(
            &config,
            &ProviderDeps {
                db: db.clone(),
                kv: kv.clone(),
                secrets: secrets.clone(),
                audit: audit.clone(),
                state_signer,
                redis_prefix: config.redis_prefix.clone(),
            },
        )
        .await,
    );

    let dispatcher = Dispatcher::new(jobs, bus.clone(), &config.worker_queue);
    let catalog = Arc::new(CatalogService::new(
        db.clone(),
        installer.clone(),
        audit.clone(),
        config.toolkits.catalog_url.clone(),
    ));
    let health = Arc::new(HealthAggregator::new(
        db.clone(),
        bus.clone(),
        config.frontend_base_url.clone(),
    ));

    // Keep the cached summary warm.
    {
        let health = health.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let _ = health.summary(true).await;
            }
        });
    }

    let listen = format!("{}:{}", config.listen_host, config.listen_port);
    let state = AppState {
        config: config.clone(),
        db,
        kv,
        dispatcher,
        registry,
        loader,
        installer,
        catalog,
        auth,
        providers,
        health,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "opsdeck API listening");
    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}

async fn worker(runtime: Runtime) -> anyhow::Result<()> {
    let Runtime {
        config,
        jobs,
        handlers,
        loader,
        bus,
        ..
    } = runtime;

    let worker_runtime = Arc::new(WorkerRuntime::new(
        jobs,
        bus,
        handlers,
        &config.worker_queue,
        config.worker_concurrency,
    ));
    worker_runtime.set_loader(loader.clone());

    // Seeding activates enabled toolkits, which registers handlers and
    // starts the probe scheduler.
    loader
        .ensure_bundled_installed()
        .await
        .map_err(|err| anyhow::anyhow!("seeding bundled toolkits: {err}"))?;
    loader
        .activate_enabled()
        .await
        .map_err(|err| anyhow::anyhow!("activating toolkits: {err}"))?;

    worker_runtime.run_forever().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,opsdeck=debug")
        }))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Command::Serve => serve(build_runtime(config, false).await?).await,
        Command::Worker => worker(build_runtime(config, true).await?).await,
        Command::BootstrapAdmin {
            username,
            password,
            email,
        } => {
            let runtime = build_runtime(config, false).await?;
            match runtime
                .auth
                .bootstrap_admin(&username, &password, email.as_deref())
                .await
            {
                Ok(user) => {
                    println!("created admin user {} ({})", user.username, user.id);
                    Ok(())
                }
                Err(err) => {
                    // Credential validation failures exit 1.
                    eprintln!("bootstrap failed: {err}");
                    std::process::exit(1);
                }
            }
        }
    }
}
