//! Monitoring lifecycle endpoints.
//!
//! Start and stop region monitoring, reconcile against the device position,
//! and follow what the background delivery path is doing.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use rollcall_core::{EngineIssue, Event, Reconciliation, RegistrationReport, SessionSnapshot};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;
use utoipa::ToSchema;

use crate::api::error::{ApiResult, ErrorResponse};
use crate::state::SharedState;

/// Creates the monitoring router.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/start", post(start_monitoring))
        .route("/stop", post(stop_monitoring))
        .route("/check", post(check_position))
        .route("/resume", post(resume_session))
        .route("/foreground", post(foreground_resume))
        .route("/session", get(get_session))
        .route("/issues", get(get_issues))
        .route("/notifications", get(notifications))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for starting monitoring.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct StartMonitoringRequest {
    /// Events to monitor. When omitted, every event the user is registered
    /// for is fetched from the store.
    #[serde(default)]
    pub events: Option<Vec<Event>>,
}

/// Outcome of a cold-start resume.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResumeResponse {
    /// Whether a persisted session was found and restarted.
    pub resumed: bool,
    /// The reconciliation run after restarting, if any.
    pub reconciliation: Option<Reconciliation>,
}

/// Outcome of the foreground permission check.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ForegroundResponse {
    /// Whether background access was found revoked and monitoring stopped.
    pub revoked: bool,
    /// Session after the check.
    pub session: SessionSnapshot,
}

/// Retained engine issues.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IssuesResponse {
    /// Issues, oldest first.
    pub issues: Vec<EngineIssue>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Start monitoring.
#[utoipa::path(
    post,
    path = "/api/monitoring/start",
    tag = "monitoring",
    operation_id = "startMonitoring",
    summary = "Start region monitoring",
    description = "Requests location access, registers one circular region per \
        event and begins recording check-ins and check-outs. Calling it again \
        replaces the region set. Invalid events are listed under `rejected`.",
    request_body = StartMonitoringRequest,
    responses(
        (status = 200, description = "Monitoring started", body = RegistrationReport),
        (status = 403, description = "Location access denied", body = ErrorResponse),
        (status = 503, description = "Region monitoring unavailable", body = ErrorResponse)
    )
)]
pub async fn start_monitoring(
    State(state): State<SharedState>,
    Json(request): Json<StartMonitoringRequest>,
) -> ApiResult<Json<RegistrationReport>> {
    let report = match request.events {
        Some(events) => state.engine.start_monitoring(events).await?,
        None => state.engine.start_registered().await?,
    };
    Ok(Json(report))
}

/// Stop monitoring.
#[utoipa::path(
    post,
    path = "/api/monitoring/stop",
    tag = "monitoring",
    operation_id = "stopMonitoring",
    summary = "Stop region monitoring",
    description = "Unregisters every region. Writes already queued still \
        complete. Safe to call when not monitoring.",
    responses(
        (status = 200, description = "Monitoring stopped", body = SessionSnapshot)
    )
)]
pub async fn stop_monitoring(State(state): State<SharedState>) -> Json<SessionSnapshot> {
    state.engine.stop_monitoring();
    Json(state.engine.session())
}

/// Reconcile with the current position.
#[utoipa::path(
    post,
    path = "/api/monitoring/check",
    tag = "monitoring",
    operation_id = "checkCurrentPosition",
    summary = "Reconcile attendance with the device position",
    description = "Takes a position fix and queues a check-in for every \
        monitored event the device is inside but not checked in to, and a \
        check-out for every event it has left while still checked in.",
    responses(
        (status = 200, description = "Corrections queued", body = Reconciliation),
        (status = 409, description = "Not monitoring", body = ErrorResponse),
        (status = 503, description = "No position fix", body = ErrorResponse)
    )
)]
pub async fn check_position(State(state): State<SharedState>) -> ApiResult<Json<Reconciliation>> {
    Ok(Json(state.engine.check_current_position().await?))
}

/// Resume a persisted session.
#[utoipa::path(
    post,
    path = "/api/monitoring/resume",
    tag = "monitoring",
    operation_id = "resumeSession",
    summary = "Resume the persisted monitoring session",
    description = "Restarts monitoring from the last saved session and \
        reconciles against the current position before trusting it.",
    responses(
        (status = 200, description = "Resume attempted", body = ResumeResponse),
        (status = 403, description = "Location access denied", body = ErrorResponse)
    )
)]
pub async fn resume_session(State(state): State<SharedState>) -> ApiResult<Json<ResumeResponse>> {
    let reconciliation = state.engine.resume_session().await?;
    Ok(Json(ResumeResponse {
        resumed: reconciliation.is_some(),
        reconciliation,
    }))
}

/// Foreground resume check.
#[utoipa::path(
    post,
    path = "/api/monitoring/foreground",
    tag = "monitoring",
    operation_id = "foregroundResume",
    summary = "Re-check location access after returning to the foreground",
    description = "Stops monitoring if background location access was revoked \
        while the app was suspended. The revocation is reported once.",
    responses(
        (status = 200, description = "Check done", body = ForegroundResponse)
    )
)]
pub async fn foreground_resume(State(state): State<SharedState>) -> Json<ForegroundResponse> {
    let revoked = state.engine.on_foreground_resume().await;
    Json(ForegroundResponse {
        revoked,
        session: state.engine.session(),
    })
}

/// Current session.
#[utoipa::path(
    get,
    path = "/api/monitoring/session",
    tag = "monitoring",
    operation_id = "getSession",
    summary = "Get the monitoring session",
    responses(
        (status = 200, description = "Current session", body = SessionSnapshot)
    )
)]
pub async fn get_session(State(state): State<SharedState>) -> Json<SessionSnapshot> {
    Json(state.engine.session())
}

/// Recent issues.
#[utoipa::path(
    get,
    path = "/api/monitoring/issues",
    tag = "monitoring",
    operation_id = "getIssues",
    summary = "List recent engine issues",
    description = "Failures on the background path: rejected regions, \
        permission problems, failed writes, skipped duplicates and missing \
        position fixes.",
    responses(
        (status = 200, description = "Retained issues", body = IssuesResponse)
    )
)]
pub async fn get_issues(State(state): State<SharedState>) -> Json<IssuesResponse> {
    Json(IssuesResponse {
        issues: state.engine.issues(),
    })
}

/// Live notifications.
#[utoipa::path(
    get,
    path = "/api/monitoring/notifications",
    tag = "monitoring",
    operation_id = "streamNotifications",
    summary = "Stream status changes and issues",
    description = "Server-sent events. `status` events carry a StatusChange \
        after each durable write; `issue` events carry an EngineIssue.",
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = rollcall_core::StatusChange)
    )
)]
pub async fn notifications(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let changes = BroadcastStream::new(state.engine.subscribe_status()).filter_map(|message| {
        match message {
            Ok(change) => SseEvent::default().event("status").json_data(change).ok(),
            Err(err) => {
                debug!(error = %err, "Notification subscriber lagged");
                None
            }
        }
    });
    let issues = BroadcastStream::new(state.engine.subscribe_issues()).filter_map(|message| {
        message
            .ok()
            .and_then(|issue| SseEvent::default().event("issue").json_data(issue).ok())
    });

    Sse::new(changes.merge(issues).map(Ok)).keep_alive(KeepAlive::default())
}
