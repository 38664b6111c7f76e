use crate::config::ApiConfig;
use crate::error::PipelineError;
use crate::model::{ItemId, ItemState, StatusRecord};
use crate::reports::{parse_date, parse_month, ReportEntry, ReportStore};
use crate::status::StatusStore;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub reports: Arc<ReportStore>,
    pub status: Arc<dyn StatusStore>,
    /// Widest report range served by one request, in days
    pub max_range_days: i64,
}

/// Query parameters for the report listing
#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    /// First day, YYYY-MM-DD
    pub start_date: String,
    /// Last day (inclusive), YYYY-MM-DD
    pub end_date: String,
    /// Restrict to one product partition
    pub product: Option<String>,
}

/// Query parameters for the status listing
#[derive(Debug, Deserialize)]
pub struct ItemsQuery {
    /// Only records in this state
    pub state: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

const MAX_LIMIT: usize = 500;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/reports", get(list_reports))
        .route("/api/v1/reports/monthly/:month", get(get_monthly_report))
        .route("/api/v1/items", get(list_items))
        .route("/api/v1/items/:item_id", get(get_item))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "parcel-pipeline"
    }))
}

/// Reports for each day in the range; days without data are left out
#[instrument(skip(state))]
async fn list_reports(
    State(state): State<AppState>,
    Query(params): Query<ReportQuery>,
) -> Result<Json<Vec<ReportEntry>>, ApiError> {
    let invalid = |_: PipelineError| {
        api_error(
            StatusCode::BAD_REQUEST,
            "Invalid date format. Use YYYY-MM-DD",
            "INVALID_DATE",
        )
    };
    let start = parse_date(&params.start_date).map_err(invalid)?;
    let end = parse_date(&params.end_date).map_err(invalid)?;

    if start > end {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "start_date must not be after end_date",
            "INVALID_RANGE",
        ));
    }

    let days = (end - start).num_days() + 1;
    if days > state.max_range_days {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "Range covers {days} days, at most {} allowed",
                state.max_range_days
            ),
            "RANGE_TOO_LARGE",
        ));
    }

    let entries = state
        .reports
        .query(start, end, params.product)
        .try_collect()
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to query reports");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to query reports",
                "QUERY_ERROR",
            )
        })?;

    Ok(Json(entries))
}

/// Stored monthly summary as CSV; `month` is YYYY-MM
#[instrument(skip(state))]
async fn get_monthly_report(
    State(state): State<AppState>,
    Path(month): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (year, month) = parse_month(&month).map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            "Invalid month format. Use YYYY-MM",
            "INVALID_MONTH",
        )
    })?;

    match state.reports.fetch_monthly(year, month).await {
        Ok(Some(csv)) => Ok(([(header::CONTENT_TYPE, "text/csv")], csv)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            "Monthly report not found",
            "NOT_FOUND",
        )),
        Err(e) => {
            error!(error = %e, "Failed to read monthly report");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read monthly report",
                "QUERY_ERROR",
            ))
        }
    }
}

/// Most recently updated status records, optionally in one state
#[instrument(skip(state))]
async fn list_items(
    State(state): State<AppState>,
    Query(params): Query<ItemsQuery>,
) -> Result<Json<Vec<StatusRecord>>, ApiError> {
    let filter = params
        .state
        .as_deref()
        .map(str::parse::<ItemState>)
        .transpose()
        .map_err(|_| {
            api_error(
                StatusCode::BAD_REQUEST,
                "Unknown state. Use uploaded, processing, processed or error",
                "INVALID_STATE",
            )
        })?;

    let records = state
        .status
        .list(filter, params.limit.min(MAX_LIMIT))
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to list status records");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to list status records",
                "STATUS_ERROR",
            )
        })?;

    Ok(Json(records))
}

/// Current status record of one item
#[instrument(skip(state))]
async fn get_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
) -> Result<Json<StatusRecord>, ApiError> {
    match state.status.get(&ItemId(item_id)).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "Item not found", "NOT_FOUND")),
        Err(e) => {
            error!(error = %e, "Failed to read status");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read status",
                "STATUS_ERROR",
            ))
        }
    }
}

/// Serve the API until `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting report API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
