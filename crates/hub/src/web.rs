use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::actuation::{ActivateWatering, ActuationService};
use crate::config::expand_origin;
use crate::error::{HubError, HubResult};
use crate::query::{DeviceView, HourlyAverageView, QueryService, ReadingView, ReadingsRange};
use crate::state::SharedStatus;

#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub actuation: ActuationService,
    pub status: SharedStatus,
}

/// Upper bound on handling a single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

/// JSON body extractor whose rejections use the API error envelope, so a
/// missing content type or a mistyped field is a 400 `invalid_argument`.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = HubError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(HubError::invalid_argument(rejection.body_text())),
        }
    }
}

#[derive(Deserialize)]
pub struct Empty {}

#[derive(Serialize)]
struct ListDevicesResponse {
    devices: Vec<DeviceView>,
}

#[derive(Deserialize)]
struct GetDeviceRequest {
    #[serde(default)]
    id: String,
}

#[derive(Serialize)]
struct GetDeviceResponse {
    device: DeviceView,
}

#[derive(Serialize)]
struct ReadingsResponse {
    readings: Vec<ReadingView>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HourlyAveragesRequest {
    #[serde(default)]
    device_external_id: String,
}

#[derive(Serialize)]
struct HourlyAveragesResponse {
    averages: Vec<HourlyAverageView>,
}

#[derive(Serialize)]
struct ActivateWateringResponse {}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/v1/ListDevices", post(list_devices))
        .route("/api/v1/GetDevice", post(get_device))
        .route("/api/v1/GetReadingsInRange", post(get_readings_in_range))
        .route("/api/v1/GetHourlyAverages", post(get_hourly_averages))
        .route("/api/v1/ActivateWatering", post(activate_watering))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.status.read().await;
    Json(st.to_status())
}

async fn list_devices(
    State(state): State<AppState>,
    ApiJson(_): ApiJson<Empty>,
) -> HubResult<Json<ListDevicesResponse>> {
    let devices = state.query.list_devices().await?;
    Ok(Json(ListDevicesResponse { devices }))
}

async fn get_device(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<GetDeviceRequest>,
) -> HubResult<Json<GetDeviceResponse>> {
    let device = state.query.get_device(&req.id).await?;
    Ok(Json(GetDeviceResponse { device }))
}

async fn get_readings_in_range(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ReadingsRange>,
) -> HubResult<Json<ReadingsResponse>> {
    let readings = state.query.readings_in_range(&req).await?;
    Ok(Json(ReadingsResponse { readings }))
}

async fn get_hourly_averages(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<HourlyAveragesRequest>,
) -> HubResult<Json<HourlyAveragesResponse>> {
    let averages = state.query.hourly_averages(&req.device_external_id).await?;
    Ok(Json(HourlyAveragesResponse { averages }))
}

async fn activate_watering(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ActivateWatering>,
) -> HubResult<Json<ActivateWateringResponse>> {
    state
        .actuation
        .activate(&req.device_external_id, req.duration_ms)
        .await?;
    Ok(Json(ActivateWateringResponse {}))
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// CORS for the configured browser origins. Entries that do not parse are
/// skipped; config validation has already reported them.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| expand_origin(o).ok())
        .flatten()
        .filter_map(|o| HeaderValue::from_str(&o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::PATCH, Method::POST, Method::OPTIONS])
        .allow_credentials(true)
        .allow_headers([
            header::ORIGIN,
            header::COOKIE,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("connect-protocol-version"),
        ])
}

fn timeout_layer(limit: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, limit)
}

pub fn app(state: AppState, origins: &[String], static_dir: Option<PathBuf>) -> Router {
    let mut app = router(state);
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app.layer(timeout_layer(REQUEST_TIMEOUT))
        .layer(cors_layer(origins))
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))
}

pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "api listening");
    }
    axum::serve(listener, app).await.context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
