//! Shared domain types and OpenAPI schemas.
//!
//! Rows read from and written to the remote store live here so the engine,
//! the repository and the HTTP layer agree on a single shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::geo::Coordinate;

/// An event with a venue geofence. Owned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "evt-meetup-42",
    "latitude": 37.7749,
    "longitude": -122.4194,
    "radius_meters": 100.0,
    "starts_at": "2025-06-01T18:00:00Z",
    "ends_at": "2025-06-01T21:00:00Z"
}))]
pub struct Event {
    /// Event identifier; doubles as the monitored region identifier.
    #[schema(example = "evt-meetup-42")]
    pub id: String,

    /// Venue latitude in degrees.
    #[schema(example = 37.7749)]
    pub latitude: f64,

    /// Venue longitude in degrees.
    #[schema(example = -122.4194)]
    pub longitude: f64,

    /// Geofence radius around the venue, in meters.
    #[schema(example = 100.0)]
    pub radius_meters: f64,

    /// When the event starts.
    pub starts_at: DateTime<Utc>,

    /// When the event ends, if known.
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Venue center.
    #[must_use]
    pub const fn center(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Returns `true` if `at` falls inside the event's time window.
    ///
    /// An event without an end time is considered open-ended.
    #[must_use]
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.starts_at && self.ends_at.map_or(true, |end| at <= end)
    }
}

/// Lifecycle state of a registration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Holds a confirmed spot.
    Registered,
    /// Waiting for a spot to free up.
    Waitlisted,
    /// Withdrew from the event.
    Cancelled,
}

/// A user's registration for an event. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Registration {
    /// Registration identifier.
    pub id: String,
    /// Registered user.
    pub user_id: String,
    /// Event registered for.
    pub event_id: String,
    /// Current registration state.
    pub status: RegistrationStatus,
}

impl Registration {
    /// A cancelled registration does not count towards attendance.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status != RegistrationStatus::Cancelled
    }
}

/// Direction of a check-in record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckInType {
    /// The attendee arrived at the venue.
    CheckIn,
    /// The attendee left the venue.
    CheckOut,
}

impl CheckInType {
    /// Wire name as stored in the `type` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
        }
    }
}

impl std::fmt::Display for CheckInType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only check-in row.
///
/// `sequence` and `timestamp` are assigned by the store. Ordering always
/// follows `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "0190a4a4-7c1e-7d2a-9f00-3a1b2c3d4e5f",
    "sequence": 17,
    "user_id": "user-1",
    "event_id": "evt-meetup-42",
    "type": "check_in",
    "timestamp": "2025-06-01T18:04:11Z",
    "latitude": 37.7749,
    "longitude": -122.4194
}))]
pub struct CheckInRecord {
    /// Record identifier.
    pub id: Uuid,

    /// Store-assigned sequence; the only ordering the engine trusts.
    pub sequence: u64,

    /// Attendee.
    pub user_id: String,

    /// Event attended.
    pub event_id: String,

    /// Check-in or check-out.
    #[serde(rename = "type")]
    pub kind: CheckInType,

    /// Store-assigned timestamp.
    pub timestamp: DateTime<Utc>,

    /// Latitude at write time, when a fix was available.
    #[serde(default)]
    pub latitude: Option<f64>,

    /// Longitude at write time, when a fix was available.
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// A position fix reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Position {
    /// Latitude in degrees.
    #[schema(example = 37.7749)]
    pub latitude: f64,

    /// Longitude in degrees.
    #[schema(example = -122.4194)]
    pub longitude: f64,

    /// Reported horizontal accuracy in meters.
    #[serde(default)]
    pub accuracy_meters: Option<f64>,

    /// When the fix was taken.
    pub observed_at: DateTime<Utc>,
}

impl Position {
    /// Creates a fix observed now, without accuracy information.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters: None,
            observed_at: Utc::now(),
        }
    }

    /// The fix as a coordinate.
    #[must_use]
    pub const fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Canonical attendance state for a (user, event) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    /// No active registration for the event.
    NotRegistered,
    /// Registered but never checked in.
    Pending,
    /// Latest record is a check-in.
    CheckedIn,
    /// Latest record is a check-out.
    CheckedOut,
}

impl AttendanceStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotRegistered => "not_registered",
            Self::Pending => "pending",
            Self::CheckedIn => "checked_in",
            Self::CheckedOut => "checked_out",
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
