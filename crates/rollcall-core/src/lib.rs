//! # rollcall-core
//!
//! Core logic for rollcall, automatic event attendance from geofenced
//! check-in and check-out.
//!
//! This crate provides:
//! - Circular region monitoring around event venues
//! - An append-only check-in history with sequence-ordered status derivation
//! - The attendance engine that turns region crossings into records
//! - Configuration management and session persistence
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`engine`] - Monitoring lifecycle, per-event write serialization, reconciliation
//! - [`region`] - Region construction, the active region set and its delivery stream
//! - [`repository`] - The remote store seam and deadline-bounded history access
//! - [`status`] - Attendance status as a pure function of stored history
//! - [`location`] - Device position fixes
//! - [`permissions`] - Foreground and background location authorization
//! - [`geo`] - Great-circle distance
//! - [`config`] - Application configuration loading, saving, and validation
//! - [`storage`] - Persistent storage for the monitoring session
//! - [`memory_store`] - In-process store for development and tests
//! - `rest_store` - PostgREST-compatible store (feature `rest-store`)
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod location;
pub mod memory_store;
pub mod permissions;
pub mod region;
pub mod repository;
#[cfg(feature = "rest-store")]
pub mod rest_store;
pub mod status;
pub mod storage;
pub mod types;

// Re-export primary types for convenience
pub use config::{Config, ConfigError, ConfigResult, EngineConfig, ServerConfig, StoreConfig, StoreKind};
pub use engine::{
    AttendanceEngine, EngineIssue, EngineParts, IssueKind, Reconciliation, SessionSnapshot,
    Severity, StatusChange,
};
pub use error::{Result, RollcallError};
pub use geo::{haversine_distance, Coordinate};
pub use location::{LocationError, LocationProvider, SimulatedLocation};
pub use memory_store::MemoryStore;
pub use permissions::{Authorization, PermissionKind, PermissionSource, SimulatedPermissions};
pub use region::{
    GeofenceFacility, MonitoredRegion, RegionEvent, RegionEventKind, RegionMonitor,
    RegistrationReport, SimulatedGeofence,
};
pub use repository::{CheckInRepository, RemoteError, RemoteStore};
#[cfg(feature = "rest-store")]
pub use rest_store::RestStore;
pub use status::derive_status;
pub use storage::{default_data_dir, default_session_path, SessionStore};
pub use types::{
    AttendanceStatus, CheckInRecord, CheckInType, Event, Position, Registration,
    RegistrationStatus,
};
