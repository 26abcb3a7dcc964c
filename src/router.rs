use crate::handlers::{self, AppState};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

/// API routes without rate limiting or body limits.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/v1/ipaddresses",
            get(handlers::list_ip_addresses).post(handlers::create_ip_address),
        )
        .route(
            "/api/v1/tasks/geolocate/:ip",
            post(handlers::enqueue_geolocate),
        )
        .route(
            "/api/v1/tasks/reverse-geocode/:id",
            post(handlers::enqueue_reverse_geocode),
        )
        .route(
            "/api/v1/tasks/backfill-zip/:id",
            post(handlers::enqueue_backfill_zip),
        )
        .route("/api/v1/tasks/scan", post(handlers::trigger_scan))
}

/// Full application router as served by the binary.
pub fn build_router(state: Arc<AppState>) -> anyhow::Result<Router> {
    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    let protected_routes = api_routes().layer(
        ServiceBuilder::new()
            // Request size limit: 1MB max payload
            .layer(RequestBodyLimitLayer::new(1024 * 1024))
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Health check bypasses rate limiting
    Ok(Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(state)
        .layer(middleware::from_fn(handlers::request_id))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()))
}
