use crate::db_storage::RecordStore;
use crate::enrichment::EnrichmentPipeline;
use crate::errors::AppError;
use crate::models::*;
use crate::task_queue::{Task, TaskQueue};
use axum::{
    extract::{Path, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Most rows returned by the IP address listing.
const IP_ADDRESS_PAGE: usize = 100;

pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("request-id");

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Persistence gateway.
    pub store: Arc<dyn RecordStore>,
    /// Pipeline used for synchronous scans.
    pub pipeline: Arc<EnrichmentPipeline>,
    /// Queue background tasks are dispatched to.
    pub queue: Arc<dyn TaskQueue>,
}

/// Health check endpoint.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "prospector",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Tags every response with a fresh `request-id` header.
pub async fn request_id(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), value);
    }
    response
}

/// GET /api/v1/ipaddresses
///
/// Lists the most recently stored IP addresses.
pub async fn list_ip_addresses(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<IpAddress>>, AppError> {
    let rows = state.store.list_ip_addresses(IP_ADDRESS_PAGE).await?;
    Ok(Json(rows))
}

/// POST /api/v1/ipaddresses
///
/// Stores an IP address row supplied by the caller.
///
/// # Returns
///
/// * `Result<(StatusCode, Json<IpAddress>), AppError>` - 201 with the stored row, or
///   400 when the IP is blank or already stored.
pub async fn create_ip_address(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateIpAddressRequest>,
) -> Result<(StatusCode, Json<IpAddress>), AppError> {
    if payload.ipaddress.trim().is_empty() {
        return Err(AppError::BadRequest("ipaddress is required".to_string()));
    }

    let row = payload.into_new_ip_address(Utc::now());
    let id = match state.store.save_ip_address(&row).await {
        Ok(id) => id,
        Err(AppError::Conflict(msg)) => {
            return Err(AppError::BadRequest(format!(
                "IP Address already exists: {}",
                msg
            )))
        }
        Err(e) => return Err(e),
    };

    tracing::info!("Stored IP address {} as id {}", row.ip, id);
    Ok((StatusCode::CREATED, Json(row.into_ip_address(id))))
}

fn accepted(state: &AppState, task: Task) -> Result<(StatusCode, Json<TaskAccepted>), AppError> {
    let name = task.name();
    let handle = state.queue.enqueue(task)?;
    tracing::info!("Enqueued {} as task {}", name, handle.0);
    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id: handle.0,
            task: name,
        }),
    ))
}

/// POST /api/v1/tasks/geolocate/:ip
pub async fn enqueue_geolocate(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<(StatusCode, Json<TaskAccepted>), AppError> {
    if ip.trim().parse::<std::net::IpAddr>().is_err() {
        return Err(AppError::BadRequest(format!("'{}' is not an IP address", ip)));
    }
    accepted(&state, Task::GeolocateIp { ip })
}

/// POST /api/v1/tasks/reverse-geocode/:id
pub async fn enqueue_reverse_geocode(
    State(state): State<Arc<AppState>>,
    Path(address_id): Path<i32>,
) -> Result<(StatusCode, Json<TaskAccepted>), AppError> {
    accepted(&state, Task::ReverseGeocodeAddress { address_id })
}

/// POST /api/v1/tasks/backfill-zip/:id
pub async fn enqueue_backfill_zip(
    State(state): State<Arc<AppState>>,
    Path(address_id): Path<i32>,
) -> Result<(StatusCode, Json<TaskAccepted>), AppError> {
    accepted(&state, Task::BackfillZipCode { address_id })
}

/// POST /api/v1/tasks/scan
///
/// Runs one scan immediately and reports how many backfills it enqueued.
pub async fn trigger_scan(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let enqueued = state
        .pipeline
        .scan_incomplete_addresses(state.queue.as_ref())
        .await;
    Json(json!({ "enqueued": enqueued }))
}
