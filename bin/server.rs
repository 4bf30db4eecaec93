// Water Metering Engine - Web Server
// REST API with Axum; one SQLite connection per request

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use water_metering::db;
use water_metering::{
    logger, AppConfig, ConsumptionReport, ErrorKind, MeasurementUnit, MeterListing,
    MeteringEngine, MeteringError, NewAccount, PolicyBook, ReadingCorrection, ReplacementOutcome,
    WaterMeter, WaterMeterReading,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    policies: Arc<PolicyBook>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Engine failure mapped onto an HTTP status by error category
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<MeteringError> for ApiError {
    fn from(e: MeteringError) -> Self {
        let status = match e.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Consistency => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.message, "request failed");
        }
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Run `f` against a fresh engine on the blocking pool.
async fn with_engine<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut MeteringEngine) -> water_metering::Result<T> + Send + 'static,
{
    let config = state.config.clone();
    let policies = state.policies.clone();

    let result = tokio::task::spawn_blocking(move || {
        let conn = db::connect(&config.database_path, config.busy_timeout())?;
        let mut engine = MeteringEngine::new(conn, policies).with_actor("api");
        f(&mut engine)
    })
    .await
    .map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("worker failed: {}", e),
    })?;

    Ok(Json(ApiResponse::ok(result?)))
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct AddReadingRequest {
    value: String,
    date: Option<DateTime<Utc>>,
    notes: Option<String>,
    image_ref: Option<String>,
}

#[derive(Deserialize)]
struct AttachImageRequest {
    image_ref: String,
}

#[derive(Deserialize)]
struct ReplaceMeterRequest {
    new_name: String,
    new_unit: MeasurementUnit,
    final_reading: Option<String>,
    replacement_date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ChangeOwnerRequest {
    account_id: Option<String>,
    account: Option<NewAccount>,
}

#[derive(Deserialize)]
struct ListQuery {
    point_id: Option<String>,
}

#[derive(Deserialize)]
struct WindowQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct RecalculateResponse {
    excess: Option<bool>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/meters - Listing with cached status
async fn list_meters(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<MeterListing>> {
    with_engine(&state, move |engine| engine.list_meters(query.point_id.as_deref())).await
}

/// GET /api/meters/:id
async fn get_meter(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<WaterMeter> {
    with_engine(&state, move |engine| engine.get_meter(&id)).await
}

/// GET /api/meters/:id/readings - Chronological history
async fn get_readings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<WaterMeterReading>> {
    with_engine(&state, move |engine| engine.readings(&id)).await
}

/// POST /api/meters/:id/readings - addReading
async fn add_reading(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddReadingRequest>,
) -> ApiResult<WaterMeterReading> {
    let date = body.date.unwrap_or_else(Utc::now);
    with_engine(&state, move |engine| {
        let reading = engine.add_reading(&id, &body.value, date, body.notes)?;
        match body.image_ref.as_deref() {
            Some(image_ref) => engine.attach_image(&reading.id, image_ref),
            None => Ok(reading),
        }
    })
    .await
}

/// PATCH /api/readings/:id - correct one of the two latest readings
async fn correct_reading(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReadingCorrection>,
) -> ApiResult<WaterMeterReading> {
    with_engine(&state, move |engine| engine.correct_reading(&id, body)).await
}

/// PUT /api/readings/:id/image - attach a photo of the dial
async fn attach_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachImageRequest>,
) -> ApiResult<WaterMeterReading> {
    with_engine(&state, move |engine| engine.attach_image(&id, &body.image_ref)).await
}

/// POST /api/meters/:id/replace - replaceMeter
async fn replace_meter(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReplaceMeterRequest>,
) -> ApiResult<ReplacementOutcome> {
    with_engine(&state, move |engine| {
        engine.replace_meter(
            &id,
            &body.new_name,
            body.new_unit,
            body.final_reading.as_deref(),
            body.replacement_date,
        )
    })
    .await
}

/// POST /api/meters/:id/owner - changeOwner
async fn change_owner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChangeOwnerRequest>,
) -> ApiResult<WaterMeter> {
    with_engine(&state, move |engine| {
        engine.change_owner(&id, body.account_id.as_deref(), body.account)
    })
    .await
}

/// POST /api/meters/:id/recalculate - recalculateExcess
async fn recalculate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RecalculateResponse> {
    with_engine(&state, move |engine| {
        engine
            .recalculate_excess(&id)
            .map(|excess| RecalculateResponse { excess })
    })
    .await
}

/// GET /api/meters/:id/consumption?from=&to=
async fn consumption(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(window): Query<WindowQuery>,
) -> ApiResult<ConsumptionReport> {
    with_engine(&state, move |engine| {
        engine.consumption_report(&id, window.from, window.to)
    })
    .await
}

/// GET /api/meters/:id/lineage - replacement chain up to the active meter
async fn lineage(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<WaterMeter>> {
    with_engine(&state, move |engine| engine.meter_lineage(&id)).await
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init_json_logger();

    let config_path = AppConfig::default_path();
    let config = AppConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config {:?}", config_path))?;
    let policies = config.policy_book()?;

    // Create the schema once; handlers only connect
    db::open_database(&config.database_path, config.busy_timeout())
        .with_context(|| format!("Failed to open database {}", config.database_path))?;
    info!(database = %config.database_path, zones = policies.len(), "database ready");

    let bind = config.server.bind.clone();
    let state = AppState {
        config: Arc::new(config),
        policies: Arc::new(policies),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/meters", get(list_meters))
        .route("/meters/:id", get(get_meter))
        .route("/meters/:id/readings", get(get_readings).post(add_reading))
        .route("/meters/:id/replace", post(replace_meter))
        .route("/meters/:id/owner", post(change_owner))
        .route("/meters/:id/recalculate", post(recalculate))
        .route("/meters/:id/consumption", get(consumption))
        .route("/meters/:id/lineage", get(lineage))
        .route("/readings/:id", patch(correct_reading))
        .route("/readings/:id/image", put(attach_image))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;

    info!(%bind, "server running");
    axum::serve(listener, app).await.context("Server stopped")?;

    Ok(())
}
