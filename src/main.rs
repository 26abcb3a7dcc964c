use prospector::config::Config;
use prospector::db::Database;
use prospector::db_storage::{PgRecordStore, RecordStore};
use prospector::enrichment::{EnrichmentPipeline, PipelineSettings};
use prospector::handlers::AppState;
use prospector::router::build_router;
use prospector::scheduler::PeriodicScheduler;
use prospector::services::{build_reverse_geocoder, GeoLookupService, MaxMindGeoLookup};
use prospector::task_queue::{LocalTaskQueue, TaskQueue};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the service.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - Database connection and migrations.
/// - GeoIP and reverse geocoding services.
/// - The enrichment task workers and the periodic scan.
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then serves HTTP until Ctrl+C and drains the workers before exiting.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prospector=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");
    db.migrate().await?;

    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(db.pool.clone()));
    let geo: Arc<dyn GeoLookupService> =
        Arc::new(MaxMindGeoLookup::open(&config.geoip_city_db).await?);
    let places = build_reverse_geocoder(&config)?;

    let pipeline = Arc::new(EnrichmentPipeline::new(
        Arc::clone(&store),
        geo,
        places,
        PipelineSettings::from_config(&config),
    ));

    let (queue, workers) = LocalTaskQueue::start(Arc::clone(&pipeline), config.worker_count);
    let queue: Arc<dyn TaskQueue> = Arc::new(queue);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler =
        PeriodicScheduler::new(config.scan_interval()).spawn(Arc::clone(&queue), shutdown_rx);

    // Build application state
    let app_state = Arc::new(AppState {
        store,
        pipeline,
        queue,
    });

    let app = build_router(app_state)?;

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        tracing::error!("Scheduler exited abnormally: {}", e);
    }
    workers.shutdown().await;

    Ok(())
}
