use anyhow::Context;
use fogfort_runner::ssh::OpenSshTransport;
use fogfort_runner::{CommandRunner, FileLogStore, LogStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod db;
pub mod ledger;
pub mod provisioner;
pub mod repository;
pub mod service;

use config::Config;
use ledger::{Ledger, MemoryLedger, PostgresLedger};
use provisioner::ProvisionerRegistry;
use provisioner::inventory::InventoryProvisioner;
use service::cluster::ClusterService;
use service::deploy::Orchestrator;
use service::job::{JobService, fail_interrupted_jobs};
use service::scripts::ScriptTemplates;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fogfort_orchestrator=debug,fogfort_runner=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Fogfort Orchestrator...");

    let config = Config::from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;

    let ledger = connect_ledger(&config).await?;

    let logs: Arc<dyn LogStore> = Arc::new(FileLogStore::new(&config.log_dir));
    tracing::info!("Execution logs stored in {}", config.log_dir.display());

    let runner = Arc::new(CommandRunner::new(
        Arc::new(OpenSshTransport::new()),
        logs.clone(),
        config.runner_config(),
    ));

    let provisioners = build_provisioners(&config, ledger.as_ref()).await?;

    let scripts = ScriptTemplates::load(config.script_dir.as_deref())
        .await
        .context("Failed to load script templates")?;

    let interrupted = fail_interrupted_jobs(ledger.as_ref())
        .await
        .context("Failed to recover interrupted jobs")?;
    if interrupted > 0 {
        tracing::warn!("Marked {} interrupted job(s) as FAILED", interrupted);
    }

    let orchestrator = Orchestrator::new(
        ledger.clone(),
        provisioners,
        runner,
        scripts,
        config.deploy_settings(),
    );

    let state = api::AppState {
        clusters: Arc::new(ClusterService::new(ledger.clone(), orchestrator)),
        jobs: Arc::new(JobService::new(ledger, logs)),
    };

    // Build router with all API endpoints
    let app = api::create_router(state);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}

/// PostgreSQL when a database URL is configured, memory otherwise
async fn connect_ledger(config: &Config) -> anyhow::Result<Arc<dyn Ledger>> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using an in-memory ledger; state is lost on restart");
        return Ok(Arc::new(MemoryLedger::new()));
    };

    tracing::info!("Connecting to database...");

    let pool = db::create_pool(database_url)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Database connection pool created");

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    Ok(Arc::new(PostgresLedger::new(pool)))
}

async fn build_provisioners(
    config: &Config,
    ledger: &dyn Ledger,
) -> anyhow::Result<ProvisionerRegistry> {
    let mut registry = ProvisionerRegistry::new();

    if let Some(path) = config.inventory_path.as_deref() {
        let inventory = InventoryProvisioner::load(path)
            .await
            .with_context(|| format!("Failed to load inventory {}", path.display()))?;

        let nodes: Vec<_> = ledger
            .list_clusters()
            .await
            .context("Failed to read clusters")?
            .into_iter()
            .flat_map(|cluster| cluster.nodes)
            .collect();
        let restored = inventory.restore_allocations(&nodes).await;
        tracing::info!(
            "Inventory {} loaded, {} host(s) already allocated",
            path.display(),
            restored
        );

        registry.register(Arc::new(inventory));
    } else {
        tracing::warn!("FOGFORT_INVENTORY not set, no node provider is available");
    }

    tracing::info!("Node providers: {:?}", registry.providers());
    Ok(registry)
}
