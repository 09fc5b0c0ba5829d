//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `attendance` - Derived status and check-in history
//! - `monitoring` - Monitoring lifecycle, reconciliation, issues and notifications
//! - `device` - Simulated position, permissions and region deliveries
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod attendance;
pub mod device;
pub mod error;
pub mod health;
pub mod monitoring;
pub mod openapi;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                          - Health check
/// /docs                            - Swagger UI
/// /api
/// ├── /attendance/{event_id}       - Status and history
/// ├── /monitoring                  - start, stop, check, resume, foreground,
/// │                                  session, issues, notifications (SSE)
/// ├── /device                      - position, permissions, region-events
/// └── /openapi.json                - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .nest(
            "/api",
            Router::new()
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/attendance", attendance::router())
                .nest("/monitoring", monitoring::router())
                .nest("/device", device::router()),
        )
        .merge(SwaggerUi::new("/docs").url("/docs/openapi.json", openapi::ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
