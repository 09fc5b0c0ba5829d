//! Unified error types for the rollcall core library.
//!
//! [`RollcallError`] covers every failure mode that can reach a synchronous
//! caller. Each module also has its own specific error type (`ConfigError`,
//! `RemoteError`, `LocationError`) that converts into it.
//!
//! Failures on the background delivery path are not returned as errors at
//! all. They are recorded as issues on the engine (see
//! [`crate::engine::EngineIssue`]) and callers poll or subscribe.
//!
//! # Example
//!
//! ```rust
//! use rollcall_core::error::{Result, RollcallError};
//! use rollcall_core::PermissionKind;
//!
//! fn require_background(granted: bool) -> Result<()> {
//!     if !granted {
//!         return Err(RollcallError::PermissionDenied(PermissionKind::Background));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::permissions::PermissionKind;

/// The unified error type for all rollcall operations.
#[derive(Debug, Error)]
pub enum RollcallError {
    // =========================================================================
    // MONITORING ERRORS
    // =========================================================================
    /// The OS proximity-monitoring facility rejected region registration.
    ///
    /// This is the only fatal monitoring failure.
    #[error("Region monitoring is unavailable: {0}")]
    MonitoringUnsupported(String),

    /// An operation needed an active monitoring session.
    #[error("Monitoring is not active. Call start_monitoring first.")]
    NotMonitoring,

    /// A region could not be built from an event.
    #[error("Invalid region for event '{event_id}': {reason}")]
    InvalidRegion {
        /// Offending event.
        event_id: String,
        /// Why the region was rejected.
        reason: String,
    },

    // =========================================================================
    // PERMISSION ERRORS
    // =========================================================================
    /// Location authorization was denied by the user or platform.
    #[error("{0} location permission denied. Grant it in system settings to enable automatic check-in.")]
    PermissionDenied(PermissionKind),

    // =========================================================================
    // LOCATION ERRORS
    // =========================================================================
    /// The device could not produce a position fix.
    #[error("Failed to fetch current position: {0}")]
    FetchPositionFailed(String),

    // =========================================================================
    // REMOTE STORE ERRORS
    // =========================================================================
    /// A network-level failure talking to the remote store. Worth retrying.
    #[error("Remote store unreachable: {0}")]
    TransientRemote(String),

    /// The remote store refused the request (auth, constraint, bad payload).
    #[error("Remote store rejected the request ({status}): {message}")]
    RemoteRejected {
        /// Status reported by the store.
        status: u16,
        /// Store-provided message.
        message: String,
    },

    /// An awaited operation exceeded its deadline.
    #[error("{operation} timed out after {after_secs}s")]
    Timeout {
        /// What was being awaited.
        operation: &'static str,
        /// Configured deadline.
        after_secs: u64,
    },

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// Session state could not be persisted or read back.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for rollcall operations.
pub type Result<T> = std::result::Result<T, RollcallError>;

impl RollcallError {
    /// Returns `true` if this error is related to location permissions.
    #[inline]
    #[must_use]
    pub const fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }

    /// Returns `true` if this error came from the remote store.
    #[inline]
    #[must_use]
    pub const fn is_remote_error(&self) -> bool {
        matches!(
            self,
            Self::TransientRemote(_) | Self::RemoteRejected { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if the caller cannot proceed without changing platform.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MonitoringUnsupported(_))
    }

    /// Returns `true` if retrying the same operation may succeed.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TransientRemote(_) | Self::Timeout { .. } | Self::FetchPositionFailed(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::InvalidRegion { .. } => 400,

            // 403 Forbidden - authorization missing
            Self::PermissionDenied(_) => 403,

            // 404 Not Found
            Self::ConfigNotFound(_) => 404,

            // 409 Conflict - wrong lifecycle state
            Self::NotMonitoring => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error
            Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - the store answered with a refusal
            Self::RemoteRejected { .. } => 502,

            // 503 Service Unavailable - device or store unavailable
            Self::MonitoringUnsupported(_)
            | Self::FetchPositionFailed(_)
            | Self::TransientRemote(_) => 503,

            // 504 Gateway Timeout
            Self::Timeout { .. } => 504,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::MonitoringUnsupported(_) => "MONITORING_UNSUPPORTED",
            Self::NotMonitoring => "NOT_MONITORING",
            Self::InvalidRegion { .. } => "INVALID_REGION",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::FetchPositionFailed(_) => "FETCH_POSITION_FAILED",
            Self::TransientRemote(_) => "TRANSIENT_REMOTE_ERROR",
            Self::RemoteRejected { .. } => "REMOTE_REJECTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for RollcallError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path),
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {source}", path.display()))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::repository::RemoteError> for RollcallError {
    fn from(err: crate::repository::RemoteError) -> Self {
        use crate::repository::RemoteError;
        match err {
            RemoteError::Network(message) => Self::TransientRemote(message),
            RemoteError::Unauthorized(message) => Self::RemoteRejected {
                status: 401,
                message,
            },
            RemoteError::Rejected { status, message } => Self::RemoteRejected { status, message },
            RemoteError::Decode(message) => Self::RemoteRejected {
                status: 500,
                message: format!("Malformed store response: {message}"),
            },
        }
    }
}

impl From<crate::location::LocationError> for RollcallError {
    fn from(err: crate::location::LocationError) -> Self {
        use crate::location::LocationError;
        match err {
            LocationError::PermissionDenied => Self::PermissionDenied(PermissionKind::Foreground),
            other => Self::FetchPositionFailed(other.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
