mod config;

use clap::Parser as _;
use config::Config;
use shoal::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    busy::BusyTracker,
    client::create_hyper_client,
    fleet::Fleet,
    router::FleetRouter,
    snapshot::SnapshotCache,
    source::SourceResolver,
    store::{JsonInventoryFile, JsonUsersFile, JsonlRequestLog},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting fleet proxy with config: {:?}", config);

    let fleet = Fleet::from_file(&config.fleet).await?;

    // Store files must exist before the listener accepts connections.
    let inventory = JsonInventoryFile::new(&config.inventory);
    inventory.prepare().await?;
    let users = JsonUsersFile::new(&config.users);
    users.prepare().await?;
    let request_log = JsonlRequestLog::new(&config.request_log);
    request_log.prepare().await?;

    let snapshots = SnapshotCache::new(
        fleet.backends.clone(),
        Arc::new(inventory),
        Duration::from_secs(config.snapshot_ttl_secs),
    );
    let router = Arc::new(FleetRouter::new(
        snapshots,
        Arc::new(BusyTracker::default()),
        Duration::from_secs(config.optimistic_ttl_secs),
    ));
    let sources = Arc::new(SourceResolver::new(
        Arc::new(users),
        fleet.source_names.clone(),
        Duration::from_secs(config.key_cache_ttl_secs),
    ));

    let http_client =
        create_hyper_client(config.pool_max_idle_per_host, config.pool_idle_timeout_secs);
    let app_state = AppState::with_client(
        http_client,
        router,
        sources,
        Arc::new(request_log),
        Duration::from_secs(config.upstream_timeout_secs),
    );

    let mut app = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(config.metrics_prefix);
        app = app.layer(prometheus_layer);

        let metrics_router = build_metrics_router(handle);
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Fleet proxy listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining");
}
