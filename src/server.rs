/// Service setup and initialization
///
/// Wires together all components: backend, template and agent registries,
/// event bus, execution engine, flow composer and cron scheduler. `run_service`
/// then drives worker pools and the scheduler until the process is told to stop.

use crate::{
    backend::SqliteBackend,
    config::{Config, EventTransport},
    events::{EventBus, SqliteTransport},
    runtime::{
        engine::ExecutionEngine,
        http_agent::{register_http_agents, HttpAgent},
        scheduler::CronSchedulerService,
        summary::register_flow_finalizer,
        worker::run_pools,
        workspace::WorkspaceIsolator,
        AgentRegistry,
    },
    workflow::{composer::FlowComposer, registry::TemplateRegistry, templates::register_builtin_templates},
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Fully wired service components
pub struct App {
    pub config: Config,
    pub backend: SqliteBackend,
    pub templates: Arc<TemplateRegistry>,
    pub events: EventBus,
    pub engine: Arc<ExecutionEngine>,
    pub composer: Arc<FlowComposer>,
    pub scheduler: Arc<CronSchedulerService>,
}

/// Initialize the tracing subscriber; `RUST_LOG` overrides the default `info`
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

/// Build every component from configuration
///
/// Nothing runs yet: no worker polls and the scheduler has no timers until
/// `run_service` (or the caller) starts them.
pub async fn build_app(config: Config) -> Result<App> {
    tracing::info!("🗄️ Connecting backend: {}", config.database.url);
    let backend = SqliteBackend::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect backend: {}", e))?;

    tracing::info!("📊 Initializing template registry");
    let templates = Arc::new(TemplateRegistry::new());
    register_builtin_templates(&templates);

    tracing::info!("🤖 Initializing agent registry");
    let mut agents = AgentRegistry::new();
    register_flow_finalizer(&mut agents);
    match &config.agents.endpoint {
        Some(endpoint) => {
            let agent = HttpAgent::new(endpoint.clone(), Duration::from_secs(config.agents.timeout_secs))
                .map_err(|e| anyhow::anyhow!("Failed to build HTTP agent: {}", e))?;
            register_http_agents(&mut agents, Arc::new(agent));
            tracing::info!("🌐 Delegating agents to {}", endpoint);
        }
        None => tracing::warn!("⚠️ No agent endpoint configured; only flow finalisers are registered"),
    }

    let events = match config.events.transport {
        EventTransport::Sqlite => {
            tracing::info!("📣 Events shared through the backend event log");
            let transport = SqliteTransport::new(
                backend.clone(),
                Duration::from_millis(config.events.poll_interval_ms),
            );
            EventBus::new(Arc::new(transport), config.events.prefix.clone())
        }
        EventTransport::Memory => {
            tracing::warn!("⚠️ In-process event transport: other processes will not see these events");
            EventBus::in_memory(config.events.prefix.clone())
        }
    };
    let workspaces = WorkspaceIsolator::new(&config.workspace.root_dir);

    tracing::info!("🚀 Initializing execution engine");
    let engine = Arc::new(ExecutionEngine::new(
        backend.clone(),
        Arc::new(agents),
        events.clone(),
        workspaces,
    ));

    let composer = Arc::new(FlowComposer::new(
        Arc::clone(&templates),
        backend.clone(),
        events.clone(),
    ));

    tracing::info!("⏰ Initializing cron scheduler service");
    let scheduler = Arc::new(
        CronSchedulerService::new(backend.clone(), Arc::clone(&composer), events.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize cron scheduler: {}", e))?
            .with_sync_interval(Duration::from_millis(config.scheduler.sync_interval_ms)),
    );

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        config,
        backend,
        templates,
        events,
        engine,
        composer,
        scheduler,
    })
}

/// Run worker pools and the cron scheduler until Ctrl-C
pub async fn run_service(config: Config) -> Result<()> {
    tracing::info!("Starting rankflow service...");
    let app = build_app(config).await?;

    let pools = run_pools(Arc::clone(&app.engine), &app.config.workers);
    app.scheduler.start().await?;
    let retention = tokio::spawn(prune_event_log(
        app.backend.clone(),
        Duration::from_secs(app.config.events.retention_secs),
    ));

    tracing::info!("👷 {} worker pool(s) running; press Ctrl-C to stop", pools.len());
    tokio::signal::ctrl_c().await?;

    tracing::info!("⏹️ Shutdown requested");
    retention.abort();
    app.scheduler.stop().await?;
    for pool in pools {
        let queue = pool.queue().to_string();
        if let Err(e) = pool.close().await {
            tracing::error!(queue = %queue, "❌ Worker pool did not stop cleanly: {}", e);
        }
    }

    tracing::info!("✅ Shutdown complete");
    Ok(())
}

/// Periodically drop event log rows past their retention
async fn prune_event_log(backend: SqliteBackend, retention: Duration) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        match backend.prune_events(retention).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("🗑️ Pruned {} event log row(s)", n),
            Err(e) => tracing::warn!("⚠️ Event log pruning failed: {}", e),
        }
    }
}
