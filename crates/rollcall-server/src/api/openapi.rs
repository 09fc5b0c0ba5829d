//! OpenAPI specification generation for the rollcall API.
//!
//! Served at `/api/openapi.json`, browsable through Swagger UI at `/docs`,
//! and written to disk by the `gen-openapi` binary for client generation.

use axum::Json;
use rollcall_core::region::RegionRejection;
use rollcall_core::{
    AttendanceStatus, Authorization, CheckInRecord, CheckInType, Coordinate, EngineIssue, Event,
    IssueKind, MonitoredRegion, Position, Reconciliation, RegionEvent, RegionEventKind,
    RegistrationReport, SessionSnapshot, StatusChange,
};
use utoipa::OpenApi;

use super::attendance::{AttendanceHistoryResponse, AttendanceStatusResponse};
use super::device::{
    DeliveryResponse, PermissionsRequest, PermissionsResponse, PositionRequest, RegionEventRequest,
};
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::monitoring::{
    ForegroundResponse, IssuesResponse, ResumeResponse, StartMonitoringRequest,
};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for rollcall.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "rollcall API",
        version = "0.1.0",
        description = r"
# rollcall API

rollcall records event attendance automatically. When a registered attendee's
device crosses into the circular region around an event venue, a check-in is
recorded; when it leaves, a check-out.

## Overview

1. **Monitoring**: start or stop region monitoring for a set of events
2. **Attendance**: read derived status and the append-only check-in history
3. **Device**: drive the simulated position, permissions and OS deliveries

## Status model

Status is derived from the record with the greatest store sequence:
`not_registered`, `pending`, `checked_in` or `checked_out`. A write that failed
after its retry is shown optimistically until a reconciliation replaces it.
",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local rollcall server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "attendance", description = "Derived attendance status and check-in history"),
        (name = "monitoring", description = "Region monitoring lifecycle, reconciliation and notifications"),
        (name = "device", description = "Simulated device position, authorization and region deliveries")
    ),
    paths(
        super::health::health_check,
        super::attendance::get_status,
        super::attendance::get_history,
        super::monitoring::start_monitoring,
        super::monitoring::stop_monitoring,
        super::monitoring::check_position,
        super::monitoring::resume_session,
        super::monitoring::foreground_resume,
        super::monitoring::get_session,
        super::monitoring::get_issues,
        super::monitoring::notifications,
        super::device::set_position,
        super::device::set_permissions,
        super::device::deliver_region_event,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Domain types
            Event,
            Position,
            Coordinate,
            CheckInType,
            CheckInRecord,
            AttendanceStatus,
            MonitoredRegion,
            RegionEventKind,
            RegionEvent,
            RegionRejection,
            RegistrationReport,
            Reconciliation,
            SessionSnapshot,
            StatusChange,
            IssueKind,
            EngineIssue,
            Authorization,
            // Attendance types
            AttendanceStatusResponse,
            AttendanceHistoryResponse,
            // Monitoring types
            StartMonitoringRequest,
            ResumeResponse,
            ForegroundResponse,
            IssuesResponse,
            // Device types
            PositionRequest,
            PermissionsRequest,
            PermissionsResponse,
            RegionEventRequest,
            DeliveryResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "rollcall API");
        assert!(spec.paths.paths.contains_key("/api/monitoring/start"));
        assert!(spec.paths.paths.contains_key("/api/attendance/{event_id}/status"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"rollcall API\""));
    }
}
