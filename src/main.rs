use fleet_core::accountability::AccountabilityEngine;
use fleet_core::api::{self, AppState};
use fleet_core::config::Config;
use fleet_core::confidence::ConfidenceTracker;
use fleet_core::event_bus::EventBus;
use fleet_core::queue::TaskQueue;
use fleet_core::quality::QualityGate;
use fleet_core::rate_limit::RateLimitConfig;
use fleet_core::registry::AgentRegistry;
use fleet_core::store::Store;
use fleet_core::vcs::github::GitHubGateway;
use fleet_core::vcs::pr_integrator::PRIntegrator;
use fleet_core::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("starting fleet-core orchestrator");

    let config = Config::load()?;

    let store = Arc::new(Store::open(&config.store_path)?);
    let bus = EventBus::new("fleet", config.event_bus.clone(), Arc::clone(&store));
    bus.spawn_flush_loop();

    let queue = Arc::new(TaskQueue::new(
        Arc::clone(&store),
        config.orchestrator.queue_max_size,
    ));
    queue.rehydrate().await?;

    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&store),
        config.orchestrator.clone(),
    ));
    let confidence = Arc::new(ConfidenceTracker::new(
        Arc::clone(&store),
        config.confidence.clone(),
    ));
    let gate = Arc::new(QualityGate::with_defaults(&config.quality_gate));

    let pr_integrator = match (
        &config.vcs.github_owner,
        &config.vcs.github_repo,
        &config.vcs.github_token,
    ) {
        (Some(owner), Some(repo), Some(token)) => {
            let gateway = GitHubGateway::new(owner.clone(), repo.clone(), token)?;
            Some(Arc::new(PRIntegrator::new(
                Arc::new(gateway),
                Arc::clone(&gate),
                Arc::clone(&bus),
            )))
        }
        _ => {
            info!("no github owner/repo/token configured, PR integration disabled");
            None
        }
    };

    let accountability = Arc::new(AccountabilityEngine::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&registry),
        Arc::clone(&bus),
    ));

    let orchestrator = Arc::new(fleet_core::orchestrator::Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&queue),
        Arc::clone(&registry),
        Arc::clone(&confidence),
        Arc::clone(&gate),
        pr_integrator.clone(),
        Arc::clone(&accountability),
        config.orchestrator.clone(),
    ));

    let state = AppState {
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        registry: Arc::clone(&registry),
        bus: Arc::clone(&bus),
        gate: Arc::clone(&gate),
        pr_integrator,
        accountability: Arc::clone(&accountability),
        api_config: Arc::new(config.api.clone()),
        rate_limit: RateLimitConfig::new(),
    };

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .map_err(|e| fleet_core::FleetError::Configuration(format!("invalid api host/port: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "api listening");

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let api_task = {
        let app = api::router(state);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
        })
    };

    let orchestrator_task = {
        let orchestrator = Arc::clone(&orchestrator);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        res = api_task => {
            if let Err(e) = res {
                error!("api server task failed: {e}");
            }
        }
    }

    let _ = shutdown_tx.send(());
    let _ = orchestrator_task.await;

    Ok(())
}
