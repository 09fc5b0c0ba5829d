//! Attendance status and history endpoints.
//!
//! Status is derived from the store's check-in history. The `status` field
//! may be optimistic when the last write failed; `canonical_status` never is.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use rollcall_core::{AttendanceStatus, CheckInRecord};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the attendance router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/{event_id}/status", get(get_status))
        .route("/{event_id}/history", get(get_history))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Selects whose attendance to read.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct UserQuery {
    /// Attendee. Defaults to the engine's signed-in user for status, and to
    /// every attendee for history.
    #[param(example = "alice")]
    pub user_id: Option<String>,
}

/// Attendance status for one (user, event) pair.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "event_id": "evt_42",
    "user_id": "alice",
    "status": "checked_in",
    "canonical_status": "pending",
    "optimistic": true
}))]
pub struct AttendanceStatusResponse {
    /// Event queried.
    pub event_id: String,

    /// Attendee queried.
    pub user_id: String,

    /// Status as shown to the user.
    pub status: AttendanceStatus,

    /// Status derived from stored records alone.
    pub canonical_status: AttendanceStatus,

    /// Whether `status` is ahead of the store.
    pub optimistic: bool,
}

/// Check-in history for an event.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttendanceHistoryResponse {
    /// Event queried.
    pub event_id: String,

    /// Attendee filter, if one was given.
    pub user_id: Option<String>,

    /// Records ordered by store sequence, oldest first.
    pub records: Vec<CheckInRecord>,

    /// Number of records.
    pub total: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get attendance status.
#[utoipa::path(
    get,
    path = "/api/attendance/{event_id}/status",
    tag = "attendance",
    operation_id = "getAttendanceStatus",
    summary = "Get attendance status for an event",
    description = "Returns not_registered, pending, checked_in or checked_out, \
        derived from the most recent stored record. When the last automatic \
        write failed, `status` reflects the intended record until it lands.",
    params(
        ("event_id" = String, Path, description = "Event identifier"),
        UserQuery
    ),
    responses(
        (status = 200, description = "Status derived", body = AttendanceStatusResponse),
        (status = 503, description = "Store unreachable", body = crate::api::error::ErrorResponse),
        (status = 504, description = "Store timed out", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_status(
    State(state): State<SharedState>,
    Path(event_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<AttendanceStatusResponse>> {
    let engine = &state.engine;
    let user_id = query
        .user_id
        .unwrap_or_else(|| engine.user_id().to_string());

    let status = engine.current_status(&user_id, &event_id).await?;
    let canonical_status = engine.canonical_status(&user_id, &event_id).await?;

    Ok(Json(AttendanceStatusResponse {
        optimistic: status != canonical_status,
        event_id,
        user_id,
        status,
        canonical_status,
    }))
}

/// Get check-in history.
#[utoipa::path(
    get,
    path = "/api/attendance/{event_id}/history",
    tag = "attendance",
    operation_id = "getAttendanceHistory",
    summary = "Get check-in history for an event",
    description = "Returns stored check-in and check-out records, oldest first. \
        Without `user_id`, records of every attendee are returned, which is \
        what dwell-time reports are built from.",
    params(
        ("event_id" = String, Path, description = "Event identifier"),
        UserQuery
    ),
    responses(
        (status = 200, description = "History retrieved", body = AttendanceHistoryResponse),
        (status = 503, description = "Store unreachable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_history(
    State(state): State<SharedState>,
    Path(event_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<AttendanceHistoryResponse>> {
    let records = match &query.user_id {
        Some(user_id) => state.engine.history(user_id, &event_id).await?,
        None => state.engine.event_history(&event_id).await?,
    };

    Ok(Json(AttendanceHistoryResponse {
        event_id,
        user_id: query.user_id,
        total: records.len(),
        records,
    }))
}
