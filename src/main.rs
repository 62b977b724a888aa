use std::sync::Arc;

use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use apply_pilot::config::PipelineConfig;
use apply_pilot::pipeline::{PipelineController, PipelineRouteState, pipeline_routes};
use apply_pilot::ports::{LlmAnalyzer, MessagePageExtractor};
use apply_pilot::store::{Database, LibSqlBackend};
use apply_pilot::sync::{LocalBus, MessageBus, Supervisor, SyncClient, sync_routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PipelineConfig::from_env()?;

    eprintln!("Apply Pilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Sync WS: ws://0.0.0.0:{}/ws", config.port);
    eprintln!("   Pipeline WS: ws://0.0.0.0:{}/ws/pipeline", config.port);
    eprintln!("   Extraction WS: ws://0.0.0.0:{}/ws/extraction", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Durable context ──────────────────────────────────────────────────
    let supervisor = Arc::new(Supervisor::load(Arc::clone(&db)).await?);
    let (bus, _bus_handle) = LocalBus::spawn(supervisor);
    let bus: Arc<dyn MessageBus> = Arc::new(bus);

    // ── Ephemeral context ────────────────────────────────────────────────
    let sync = Arc::new(SyncClient::new(Arc::clone(&bus), config.request_timeout));
    let (extractor, link) = MessagePageExtractor::channel(&config);
    let analyzer = LlmAnalyzer::new(config.model.clone());

    let controller = Arc::new(PipelineController::new(
        sync,
        Arc::new(extractor),
        Arc::new(analyzer),
        Arc::clone(&db),
        &config,
    ));
    let _listener = controller.spawn_listener();
    if let Err(e) = controller.attach().await {
        tracing::warn!(error = %e, "Could not resume after start-up");
    }

    // ── HTTP / WS ────────────────────────────────────────────────────────
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = sync_routes(bus)
        .merge(pipeline_routes(PipelineRouteState {
            controller,
            settings: db,
            extraction: Arc::new(Mutex::new(link)),
        }))
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Server started");
    axum::serve(listener, app).await?;

    Ok(())
}
