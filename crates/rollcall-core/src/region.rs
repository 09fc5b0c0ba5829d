//! Circular region monitoring.
//!
//! [`RegionMonitor`] owns the active region set and the channel that carries
//! enter/exit deliveries to the engine. The platform facility behind it is
//! abstracted as [`GeofenceFacility`]; the facility (or the polling fallback)
//! hands deliveries to [`RegionMonitor::deliver`].
//!
//! The active set is only ever replaced as a whole, so readers never observe
//! a partially registered set.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::error::{Result, RollcallError};
use crate::geo::Coordinate;
use crate::types::{CheckInType, Event, Position};

/// A circular region registered with the monitoring facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MonitoredRegion {
    /// Region identifier; always the event id.
    pub identifier: String,
    /// Region center.
    pub center: Coordinate,
    /// Radius in meters.
    pub radius_meters: f64,
    /// Deliver an event when the device enters.
    pub notify_on_enter: bool,
    /// Deliver an event when the device leaves.
    pub notify_on_exit: bool,
}

impl MonitoredRegion {
    /// Builds the region for an event's venue.
    ///
    /// # Errors
    ///
    /// Rejects events whose coordinates are not finite or out of range, and
    /// events whose radius is not a finite positive number.
    pub fn from_event(event: &Event) -> std::result::Result<Self, RegionRejection> {
        let center = event.center();
        if !center.is_valid() {
            return Err(RegionRejection::new(
                &event.id,
                format!(
                    "coordinates ({}, {}) are not a valid position",
                    event.latitude, event.longitude
                ),
            ));
        }
        if !(event.radius_meters.is_finite() && event.radius_meters > 0.0) {
            return Err(RegionRejection::new(
                &event.id,
                format!("radius {} must be a positive number of meters", event.radius_meters),
            ));
        }
        Ok(Self {
            identifier: event.id.clone(),
            center,
            radius_meters: event.radius_meters,
            notify_on_enter: true,
            notify_on_exit: true,
        })
    }

    /// Whether `position` lies inside the region, boundary included.
    #[must_use]
    pub fn contains(&self, position: &Position) -> bool {
        self.center.distance_to(&position.coordinate()) <= self.radius_meters
    }
}

/// An event that could not become a region. Non-fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RegionRejection {
    /// The rejected event.
    pub event_id: String,
    /// Why it was rejected.
    pub reason: String,
}

impl RegionRejection {
    fn new(event_id: &str, reason: String) -> Self {
        Self {
            event_id: event_id.to_string(),
            reason,
        }
    }
}

impl From<RegionRejection> for RollcallError {
    fn from(rejection: RegionRejection) -> Self {
        Self::InvalidRegion {
            event_id: rejection.event_id,
            reason: rejection.reason,
        }
    }
}

/// Direction of a region crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RegionEventKind {
    /// The device crossed into the region.
    Enter,
    /// The device crossed out of the region.
    Exit,
}

impl From<RegionEventKind> for CheckInType {
    fn from(kind: RegionEventKind) -> Self {
        match kind {
            RegionEventKind::Enter => Self::CheckIn,
            RegionEventKind::Exit => Self::CheckOut,
        }
    }
}

/// A single proximity delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RegionEvent {
    /// Enter or exit.
    #[serde(rename = "type")]
    pub kind: RegionEventKind,
    /// The region crossed.
    pub region_id: String,
    /// When the crossing was observed.
    pub observed_at: DateTime<Utc>,
}

impl RegionEvent {
    /// An enter delivery observed now.
    pub fn enter(region_id: impl Into<String>) -> Self {
        Self::now(RegionEventKind::Enter, region_id)
    }

    /// An exit delivery observed now.
    pub fn exit(region_id: impl Into<String>) -> Self {
        Self::now(RegionEventKind::Exit, region_id)
    }

    fn now(kind: RegionEventKind, region_id: impl Into<String>) -> Self {
        Self {
            kind,
            region_id: region_id.into(),
            observed_at: Utc::now(),
        }
    }
}

/// The platform's proximity-monitoring facility.
pub trait GeofenceFacility: Send + Sync {
    /// Replaces every registered region with `regions`.
    ///
    /// # Errors
    ///
    /// Returns `RollcallError::MonitoringUnsupported` if the platform cannot
    /// monitor regions at all.
    fn register(&self, regions: &[MonitoredRegion]) -> Result<()>;

    /// Removes every registered region.
    fn unregister_all(&self);

    /// Whether the facility pushes deliveries on its own. When it does not,
    /// the engine falls back to polling positions.
    fn supports_push(&self) -> bool {
        true
    }
}

/// Summary of a [`RegionMonitor::register_regions`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RegistrationReport {
    /// Identifiers of the regions now active.
    pub registered: Vec<String>,
    /// Events dropped as invalid.
    pub rejected: Vec<RegionRejection>,
}

/// Stream of deliveries returned by [`RegionMonitor::events`].
pub type RegionEvents = ReceiverStream<RegionEvent>;

/// Owns the active region set and the delivery channel.
pub struct RegionMonitor {
    facility: Arc<dyn GeofenceFacility>,
    active: RwLock<Arc<Vec<MonitoredRegion>>>,
    sender: mpsc::Sender<RegionEvent>,
    receiver: Mutex<Option<mpsc::Receiver<RegionEvent>>>,
    backlog: watch::Sender<usize>,
}

impl RegionMonitor {
    /// Creates a monitor whose delivery channel holds `capacity` events.
    pub fn new(facility: Arc<dyn GeofenceFacility>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (backlog, _) = watch::channel(0);
        Self {
            facility,
            active: RwLock::new(Arc::new(Vec::new())),
            sender,
            receiver: Mutex::new(Some(receiver)),
            backlog,
        }
    }

    /// Atomically replaces the active region set with the valid subset of `events`.
    ///
    /// Invalid events are reported, not raised. Duplicate ids collapse into
    /// one region, the last occurrence winning.
    ///
    /// # Errors
    ///
    /// Fails only if the facility rejects the registration, in which case the
    /// previous set stays active.
    pub fn register_regions(&self, events: &[Event]) -> Result<RegistrationReport> {
        let mut rejected = Vec::new();
        let mut by_id: HashMap<&str, usize> = HashMap::new();
        let mut regions: Vec<MonitoredRegion> = Vec::with_capacity(events.len());

        for event in events {
            match MonitoredRegion::from_event(event) {
                Ok(region) => {
                    if let Some(&slot) = by_id.get(event.id.as_str()) {
                        regions[slot] = region;
                    } else {
                        by_id.insert(event.id.as_str(), regions.len());
                        regions.push(region);
                    }
                }
                Err(rejection) => {
                    warn!(
                        event_id = %rejection.event_id,
                        reason = %rejection.reason,
                        "Dropping invalid region"
                    );
                    rejected.push(rejection);
                }
            }
        }

        self.facility.register(&regions)?;

        let registered = regions.iter().map(|r| r.identifier.clone()).collect();
        *self.active.write() = Arc::new(regions);
        info!(?registered, rejected = rejected.len(), "Region set replaced");

        Ok(RegistrationReport {
            registered,
            rejected,
        })
    }

    /// Removes every region. Calling it again is a no-op.
    pub fn unregister_all(&self) {
        let previous = std::mem::replace(&mut *self.active.write(), Arc::new(Vec::new()));
        if previous.is_empty() {
            return;
        }
        self.facility.unregister_all();
        info!(count = previous.len(), "Regions unregistered");
    }

    /// Snapshot of the active regions.
    pub fn active_regions(&self) -> Arc<Vec<MonitoredRegion>> {
        Arc::clone(&self.active.read())
    }

    /// Whether `region_id` is currently registered.
    pub fn is_active(&self, region_id: &str) -> bool {
        self.active.read().iter().any(|r| r.identifier == region_id)
    }

    /// Whether deliveries arrive without polling.
    pub fn supports_push(&self) -> bool {
        self.facility.supports_push()
    }

    /// Takes the delivery stream.
    ///
    /// A monitor has exactly one stream for its whole lifetime, so deliveries
    /// accepted before a stop or a restart stay queued for the same consumer.
    /// Returns `None` once the stream has been taken.
    pub fn events(&self) -> Option<RegionEvents> {
        self.receiver.lock().take().map(ReceiverStream::new)
    }

    /// Deliveries accepted but not yet handed off by the consumer.
    pub fn backlog(&self) -> usize {
        *self.backlog.borrow()
    }

    /// Watches [`Self::backlog`].
    pub fn subscribe_backlog(&self) -> watch::Receiver<usize> {
        self.backlog.subscribe()
    }

    /// Called by the consumer once a delivery taken from the stream has been
    /// handed on.
    pub fn acknowledge(&self) {
        self.backlog.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Queues a delivery, waiting for channel room.
    ///
    /// Returns `false` if the delivery was discarded because its region is
    /// not active. An accepted delivery counts towards [`Self::backlog`]
    /// until the consumer acknowledges it.
    pub async fn deliver(&self, event: RegionEvent) -> bool {
        if !self.is_active(&event.region_id) {
            debug!(region_id = %event.region_id, "Discarding delivery for inactive region");
            return false;
        }
        self.backlog.send_modify(|n| *n += 1);
        if let Err(mpsc::error::SendError(event)) = self.sender.send(event).await {
            debug!(region_id = %event.region_id, "Delivery stream dropped");
            self.acknowledge();
            return false;
        }
        true
    }

    /// Regions among `regions` that contain `position`, by great-circle distance.
    #[must_use]
    pub fn check_now(regions: &[MonitoredRegion], position: &Position) -> Vec<String> {
        regions
            .iter()
            .filter(|region| region.contains(position))
            .map(|region| region.identifier.clone())
            .collect()
    }

    /// Deliveries implied by moving from `previous` to `current` inside sets.
    ///
    /// Exits come before enters.
    #[must_use]
    pub fn transitions(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> Vec<RegionEvent> {
        previous
            .difference(current)
            .map(RegionEvent::exit)
            .chain(current.difference(previous).map(RegionEvent::enter))
            .collect()
    }
}

/// In-process monitoring facility that records what was registered.
#[derive(Debug, Default)]
pub struct SimulatedGeofence {
    registered: Mutex<Vec<MonitoredRegion>>,
    rejection: Mutex<Option<String>>,
    poll_only: AtomicBool,
    calls: AtomicUsize,
}

impl SimulatedGeofence {
    /// A facility that accepts everything and pushes deliveries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A facility that cannot push; the engine must poll.
    #[must_use]
    pub fn poll_only() -> Self {
        let facility = Self::default();
        facility.poll_only.store(true, Ordering::SeqCst);
        facility
    }

    /// Makes every future registration fail as unsupported.
    pub fn reject_with(&self, reason: impl Into<String>) {
        *self.rejection.lock() = Some(reason.into());
    }

    /// Regions the platform currently holds.
    pub fn registered(&self) -> Vec<MonitoredRegion> {
        self.registered.lock().clone()
    }

    /// Number of register calls that succeeded.
    pub fn registration_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GeofenceFacility for SimulatedGeofence {
    fn register(&self, regions: &[MonitoredRegion]) -> Result<()> {
        if let Some(reason) = self.rejection.lock().clone() {
            return Err(RollcallError::MonitoringUnsupported(reason));
        }
        *self.registered.lock() = regions.to_vec();
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_all(&self) {
        self.registered.lock().clear();
    }

    fn supports_push(&self) -> bool {
        !self.poll_only.load(Ordering::SeqCst)
    }
}
