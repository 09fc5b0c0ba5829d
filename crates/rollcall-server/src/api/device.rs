//! Simulated device endpoints.
//!
//! The server has no GPS or OS geofencing of its own. These endpoints stand
//! in for them: push a position fix, change what location access the "user"
//! grants, or deliver a region crossing as the OS would.

use axum::extract::State;
use axum::routing::{post, put};
use axum::{Json, Router};
use chrono::Utc;
use rollcall_core::{
    Authorization, Coordinate, PermissionKind, PermissionSource, Position, RegionEvent,
    RegionEventKind,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the device router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/position", put(set_position))
        .route("/permissions", put(set_permissions))
        .route("/region-events", post(deliver_region_event))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// A position fix to publish.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "latitude": 37.7749,
    "longitude": -122.4194,
    "accuracy_meters": 12.0
}))]
pub struct PositionRequest {
    /// Latitude in degrees, -90 to 90.
    pub latitude: f64,
    /// Longitude in degrees, -180 to 180.
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    #[serde(default)]
    pub accuracy_meters: Option<f64>,
}

/// Authorization levels to set. Omitted levels are left unchanged.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct PermissionsRequest {
    /// Foreground ("while using") access.
    pub foreground: Option<Authorization>,
    /// Background ("always") access.
    pub background: Option<Authorization>,
}

/// Current authorization levels.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PermissionsResponse {
    /// Foreground access.
    pub foreground: Authorization,
    /// Background access.
    pub background: Authorization,
}

/// A region crossing to deliver.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "type": "enter", "region_id": "evt-meetup-42" }))]
pub struct RegionEventRequest {
    /// Enter or exit.
    #[serde(rename = "type")]
    pub kind: RegionEventKind,
    /// Region crossed; the event id.
    pub region_id: String,
}

/// Whether a delivery reached the engine.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeliveryResponse {
    /// `false` when the region is not monitored or monitoring is stopped.
    pub accepted: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Publish a position fix.
#[utoipa::path(
    put,
    path = "/api/device/position",
    tag = "device",
    operation_id = "setDevicePosition",
    summary = "Set the simulated device position",
    description = "Publishes a fix to the engine's location source. When the \
        engine polls, moving across a region boundary produces a crossing.",
    request_body = PositionRequest,
    responses(
        (status = 200, description = "Fix published", body = Position),
        (status = 400, description = "Coordinates out of range", body = ErrorResponse)
    )
)]
pub async fn set_position(
    State(state): State<SharedState>,
    Json(request): Json<PositionRequest>,
) -> ApiResult<Json<Position>> {
    if !Coordinate::new(request.latitude, request.longitude).is_valid() {
        return Err(ApiError::bad_request(
            "INVALID_POSITION",
            format!(
                "({}, {}) is not a valid latitude/longitude",
                request.latitude, request.longitude
            ),
        ));
    }
    if request.accuracy_meters.is_some_and(|a| !a.is_finite() || a < 0.0) {
        return Err(ApiError::bad_request(
            "INVALID_POSITION",
            "accuracy_meters must be a non-negative number",
        ));
    }

    let position = Position {
        latitude: request.latitude,
        longitude: request.longitude,
        accuracy_meters: request.accuracy_meters,
        observed_at: Utc::now(),
    };
    state.device.location.set_position(position);
    Ok(Json(position))
}

/// Change location authorization.
#[utoipa::path(
    put,
    path = "/api/device/permissions",
    tag = "device",
    operation_id = "setDevicePermissions",
    summary = "Set simulated location authorization",
    description = "Sets the current level and the answer given to future \
        prompts. Revoking background access takes effect on the next \
        foreground check.",
    request_body = PermissionsRequest,
    responses(
        (status = 200, description = "Authorization updated", body = PermissionsResponse)
    )
)]
pub async fn set_permissions(
    State(state): State<SharedState>,
    Json(request): Json<PermissionsRequest>,
) -> Json<PermissionsResponse> {
    let permissions = &state.device.permissions;
    for (kind, level) in [
        (PermissionKind::Foreground, request.foreground),
        (PermissionKind::Background, request.background),
    ] {
        if let Some(level) = level {
            permissions.set(kind, level);
            permissions.answer_with(kind, level);
        }
    }

    Json(PermissionsResponse {
        foreground: permissions.status(PermissionKind::Foreground).await,
        background: permissions.status(PermissionKind::Background).await,
    })
}

/// Deliver a region crossing.
#[utoipa::path(
    post,
    path = "/api/device/region-events",
    tag = "device",
    operation_id = "deliverRegionEvent",
    summary = "Deliver a region enter or exit",
    description = "Hands a crossing to the engine exactly as the OS geofencing \
        facility would. Deliveries for regions that are not monitored are \
        discarded.",
    request_body = RegionEventRequest,
    responses(
        (status = 200, description = "Delivery handled", body = DeliveryResponse)
    )
)]
pub async fn deliver_region_event(
    State(state): State<SharedState>,
    Json(request): Json<RegionEventRequest>,
) -> Json<DeliveryResponse> {
    let event = match request.kind {
        RegionEventKind::Enter => RegionEvent::enter(request.region_id),
        RegionEventKind::Exit => RegionEvent::exit(request.region_id),
    };
    let accepted = state.engine.monitor().deliver(event).await;
    Json(DeliveryResponse { accepted })
}
