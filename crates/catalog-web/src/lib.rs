//! JSON API over sync job control and the product catalog.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use catalog_core::PageRequest;
use catalog_storage::ProductStore;
use catalog_sync::{SyncError, SyncService};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "catalog-web";

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub sync: SyncService,
    pub store: Arc<dyn ProductStore>,
}

impl AppState {
    pub fn new(sync: SyncService) -> Self {
        let store = sync.store();
        Self { sync, store }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    provider_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ScheduleRequest {
    cron_expression: Option<String>,
    interval_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ProductsQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/sync/trigger", post(trigger_handler))
        .route("/sync/status/{job_id}", get(status_handler))
        .route("/sync/cancel/{job_id}", delete(cancel_handler))
        .route("/sync/history", get(history_handler))
        .route("/sync/schedule", post(schedule_handler))
        .route("/sync/providers", get(providers_handler))
        .route("/products", get(products_handler))
        .route("/products/{id}", get(product_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CATALOG_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let sync = catalog_sync::service_from_env().await?;
    if sync.maybe_start_scheduler().await? {
        info!(schedule = ?sync.current_schedule().await, "periodic sync enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "catalog api listening");
    axum::serve(listener, app(AppState::new(sync.clone())))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    sync.shutdown().await?;
    Ok(())
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

fn sync_error(err: SyncError) -> Response {
    match &err {
        SyncError::Configuration(msg) => detail(StatusCode::BAD_REQUEST, msg.clone()),
        SyncError::NotFound(_) => detail(StatusCode::NOT_FOUND, err.to_string()),
        _ => {
            error!(error = %err, "sync request failed");
            detail(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// An empty body is treated as `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| detail(StatusCode::BAD_REQUEST, format!("invalid request body: {err}")))
}

fn parse_job_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| detail(StatusCode::NOT_FOUND, format!("sync job {raw} not found")))
}

async fn trigger_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: TriggerRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    match state.sync.trigger_sync(request.provider_type.as_deref()).await {
        Ok(receipt) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": receipt.job_id,
                "status": "pending",
                "provider_name": receipt.provider_name,
                "message": format!("sync job started with {} provider", receipt.provider_name),
            })),
        )
            .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.sync.get_status(job_id).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.sync.cancel(job_id).await {
        Ok(receipt) => Json(json!({
            "job_id": receipt.job_id,
            "accepted": receipt.accepted,
            "message": format!("cancellation requested for job {}", receipt.job_id),
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.sync.history(limit).await {
        Ok(jobs) => Json(json!({ "total": jobs.len(), "jobs": jobs })).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn schedule_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ScheduleRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    match state
        .sync
        .reschedule(request.cron_expression.as_deref(), request.interval_seconds)
        .await
    {
        Ok(receipt) => Json(receipt).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn providers_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.sync.list_providers()).into_response()
}

async fn products_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProductsQuery>,
) -> Response {
    let page = PageRequest::clamped(query.page, query.page_size);
    match state.store.list_products(&page).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => sync_error(SyncError::Storage(err)),
    }
}

async fn product_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return detail(StatusCode::NOT_FOUND, "product not found");
    };
    match state.store.get_product(id).await {
        Ok(Some(product)) => Json(product).into_response(),
        Ok(None) => detail(StatusCode::NOT_FOUND, "product not found"),
        Err(err) => sync_error(SyncError::Storage(err)),
    }
}
