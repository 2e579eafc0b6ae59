//! REST API endpoints using Axum
//!
//! Reads are served from the tag cache and writes go through the write
//! coordinator; no handler talks to a controller.

use crate::types::*;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use plcbroker_core::{BrokerError, DeviceId, DeviceState, PlcValue, TagId};
use plcbroker_pool::Broker;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<Broker>,
    pub prometheus: Option<PrometheusHandle>,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            prometheus: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

// ============================================================================
// Router Setup
// ============================================================================

pub fn create_rest_router(state: ApiState) -> Router {
    Router::new()
        // Tag values
        .route("/tags", get(get_all_tags))
        .route("/tags/{device}", get(get_device_tags))
        .route("/tags/{device}/{tag}", get(get_tag).post(write_tag))
        // Health
        .route("/health", get(service_health))
        .route("/health/{device}", get(device_health))
        // Configuration
        .route("/devices", get(list_devices))
        // Metrics
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

// ============================================================================
// Tag Endpoints
// ============================================================================

/// GET /tags - Cached values of every enabled device
#[utoipa::path(
    get,
    path = "/tags",
    responses(
        (status = 200, description = "Cached tag values keyed by device", body = AllDeviceTags)
    )
)]
pub async fn get_all_tags(State(state): State<ApiState>) -> Result<Json<AllDeviceTags>, ApiError> {
    let cache = state.broker.cache();
    let mut devices = BTreeMap::new();

    for device in state.broker.config().enabled_devices() {
        let values = cache
            .get_device(&device.id)?
            .into_iter()
            .map(|value| {
                let definition = cache.tag_definition(&device.id, &value.tag);
                TagValueResponse::new(value, definition)
            })
            .collect();
        devices.insert(device.id.to_string(), values);
    }

    Ok(Json(AllDeviceTags(devices)))
}

/// GET /tags/{device} - All cached values of a device
#[utoipa::path(
    get,
    path = "/tags/{device}",
    params(
        ("device" = String, Path, description = "Device identifier"),
        ("tags" = Option<String>, Query, description = "Comma-separated tag names")
    ),
    responses(
        (status = 200, description = "Cached tag values", body = [TagValueResponse]),
        (status = 404, description = "Unknown device", body = ErrorResponse)
    )
)]
pub async fn get_device_tags(
    State(state): State<ApiState>,
    Path(device): Path<String>,
    Query(query): Query<TagFilterQuery>,
) -> Result<Json<Vec<TagValueResponse>>, ApiError> {
    let device = DeviceId::from(device);
    let cache = state.broker.cache();
    let mut values = cache.get_device(&device)?;

    if let Some(names) = query.names() {
        values.retain(|v| names.contains(&v.tag.as_str()));
    }

    let body = values
        .into_iter()
        .map(|value| {
            let definition = cache.tag_definition(&device, &value.tag);
            TagValueResponse::new(value, definition)
        })
        .collect();
    Ok(Json(body))
}

/// GET /tags/{device}/{tag} - Cached value of one tag
#[utoipa::path(
    get,
    path = "/tags/{device}/{tag}",
    params(
        ("device" = String, Path, description = "Device identifier"),
        ("tag" = String, Path, description = "Tag name")
    ),
    responses(
        (status = 200, description = "Cached tag value", body = TagValueResponse),
        (status = 404, description = "Unknown device or tag", body = ErrorResponse)
    )
)]
pub async fn get_tag(
    State(state): State<ApiState>,
    Path((device, tag)): Path<(String, String)>,
) -> Result<Json<TagValueResponse>, ApiError> {
    let device = DeviceId::from(device);
    let tag = TagId::from(tag);
    let cache = state.broker.cache();

    let value = cache.get(&device, &tag)?;
    Ok(Json(TagValueResponse::new(
        value,
        cache.tag_definition(&device, &tag),
    )))
}

/// POST /tags/{device}/{tag} - Write a tag and wait for the controller
#[utoipa::path(
    post,
    path = "/tags/{device}/{tag}",
    params(
        ("device" = String, Path, description = "Device identifier"),
        ("tag" = String, Path, description = "Tag name")
    ),
    request_body = WriteRequestBody,
    responses(
        (status = 200, description = "Write acknowledged", body = WriteResponse),
        (status = 400, description = "Malformed body", body = WriteResponse),
        (status = 404, description = "Unknown device or tag", body = WriteResponse),
        (status = 422, description = "Rejected or wrong value type", body = WriteResponse),
        (status = 503, description = "Device unavailable or queue full", body = WriteResponse),
        (status = 504, description = "No acknowledgment within the write timeout", body = WriteResponse)
    )
)]
pub async fn write_tag(
    State(state): State<ApiState>,
    Path((device, tag)): Path<(String, String)>,
    body: Result<Json<WriteRequestBody>, JsonRejection>,
) -> (StatusCode, Json<WriteResponse>) {
    let device = DeviceId::from(device);
    let tag = TagId::from(tag);

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(device = %device, tag = %tag, error = %rejection, "Malformed write body");
            return (
                StatusCode::BAD_REQUEST,
                Json(WriteResponse::failed("bad_request", rejection.body_text())),
            );
        }
    };

    match submit_write(&state, &device, &tag, &body.value).await {
        Ok((value, applied_at)) => {
            info!(device = %device, tag = %tag, value = %value, "Write applied");
            (StatusCode::OK, Json(WriteResponse::applied(value, applied_at)))
        }
        Err(e) => {
            debug!(device = %device, tag = %tag, error = %e, "Write failed");
            (
                status_for(&e),
                Json(WriteResponse::failed(e.code(), e.to_string())),
            )
        }
    }
}

async fn submit_write(
    state: &ApiState,
    device: &DeviceId,
    tag: &TagId,
    raw: &serde_json::Value,
) -> Result<(PlcValue, chrono::DateTime<Utc>), BrokerError> {
    let cache = state.broker.cache();
    if cache.device_tags(device).is_none() {
        return Err(BrokerError::device_not_found(device));
    }
    let definition = cache
        .tag_definition(device, tag)
        .ok_or_else(|| BrokerError::tag_not_found(device, tag))?;

    let value = PlcValue::from_json(tag, raw, definition.data_type)?;
    let receipt = state.broker.writer().submit(device, tag, value).await?;
    Ok((receipt.value, receipt.applied_at))
}

// ============================================================================
// Health Endpoints
// ============================================================================

/// GET /health - Service summary with every device
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = ServiceHealth)
    )
)]
pub async fn service_health(State(state): State<ApiState>) -> Json<ServiceHealth> {
    let broker = &state.broker;
    let devices: Vec<_> = broker
        .health()
        .snapshot()
        .into_iter()
        .map(|(device, status)| DeviceHealthResponse::new(&device, status))
        .collect();

    let all_healthy = broker
        .config()
        .enabled_devices()
        .iter()
        .all(|d| broker.health().is_healthy(&d.id));

    Json(ServiceHealth {
        status: if all_healthy {
            ServiceStatus::Ok
        } else {
            ServiceStatus::Degraded
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        devices,
        counters: broker.metrics().snapshot(),
        timestamp: Utc::now(),
    })
}

/// GET /health/{device} - Health of one device
#[utoipa::path(
    get,
    path = "/health/{device}",
    params(("device" = String, Path, description = "Device identifier")),
    responses(
        (status = 200, description = "Device health", body = DeviceHealthResponse),
        (status = 404, description = "Unknown device", body = ErrorResponse)
    )
)]
pub async fn device_health(
    State(state): State<ApiState>,
    Path(device): Path<String>,
) -> Result<Json<DeviceHealthResponse>, ApiError> {
    let device = DeviceId::from(device);
    let status = state
        .broker
        .health()
        .status(&device)
        .ok_or_else(|| BrokerError::device_not_found(&device))?;
    Ok(Json(DeviceHealthResponse::new(&device, status)))
}

// ============================================================================
// Configuration Endpoints
// ============================================================================

/// GET /devices - Configured devices and their tags
#[utoipa::path(
    get,
    path = "/devices",
    responses(
        (status = 200, description = "Configured devices", body = DeviceList)
    )
)]
pub async fn list_devices(State(state): State<ApiState>) -> Json<DeviceList> {
    let broker = &state.broker;
    let devices: Vec<_> = broker
        .config()
        .devices
        .iter()
        .map(|config| {
            let state = broker
                .health()
                .state(&config.id)
                .unwrap_or(DeviceState::Disconnected);
            DeviceInfo::new(config, state)
        })
        .collect();

    Json(DeviceList {
        total: devices.len(),
        devices,
    })
}

// ============================================================================
// Metrics Endpoint
// ============================================================================

/// GET /metrics - Prometheus text exposition
#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus metrics", body = String, content_type = "text/plain"),
        (status = 404, description = "No exporter installed", body = ErrorResponse)
    )
)]
pub async fn get_metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let handle = state
        .prometheus
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("Prometheus exporter is not installed".to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}

// ============================================================================
// Error Handling
// ============================================================================

/// HTTP status for a classified broker outcome.
pub fn status_for(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::DeviceUnavailable { .. } | BrokerError::Backpressure { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BrokerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        BrokerError::Rejected { .. } | BrokerError::InvalidValue { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        BrokerError::NotFound { .. } => StatusCode::NOT_FOUND,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::Broker(e) => (status_for(&e), e.code(), e.to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::InternalError(msg) => {
                error!(error = %msg, "Internal API error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse::new(error_code, message));
        (status, body).into_response()
    }
}
