//! The attendance engine.
//!
//! [`AttendanceEngine`] turns region deliveries into check-in and check-out
//! records. It owns the monitoring session, the background delivery path and
//! the optimistic status overlay.
//!
//! ## Lifecycle
//!
//! 1. [`AttendanceEngine::start_monitoring`] gates on background location
//!    access, registers one region per event and subscribes to deliveries.
//! 2. Each delivery is queued on its event's worker; the worker checks the
//!    latest stored record, fetches a position best-effort and appends.
//! 3. [`AttendanceEngine::stop_monitoring`] unregisters every region. Writes
//!    for deliveries already accepted still run; use
//!    [`AttendanceEngine::wait_idle`] to drain.
//!
//! Platform redelivery after a restart is not relied upon.
//! [`AttendanceEngine::resume_session`] restores the last session and then
//! reconciles against the device's actual position.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rollcall_core::config::EngineConfig;
//! use rollcall_core::engine::{AttendanceEngine, EngineParts};
//! use rollcall_core::location::SimulatedLocation;
//! use rollcall_core::memory_store::MemoryStore;
//! use rollcall_core::permissions::SimulatedPermissions;
//! use rollcall_core::region::SimulatedGeofence;
//!
//! # async fn example() -> rollcall_core::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let engine = AttendanceEngine::new(
//!     EngineConfig::default(),
//!     EngineParts {
//!         store: store.clone(),
//!         location: Arc::new(SimulatedLocation::new()),
//!         permissions: Arc::new(SimulatedPermissions::granted()),
//!         geofence: Arc::new(SimulatedGeofence::new()),
//!     },
//! );
//!
//! let report = engine.start_registered().await?;
//! println!("Monitoring {} events", report.registered.len());
//! # Ok(())
//! # }
//! ```

mod issues;
mod session;
mod worker;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

pub use issues::{EngineIssue, IssueKind, IssueLog, Severity};
pub use session::SessionSnapshot;

use self::session::MonitoringSession;
use crate::config::EngineConfig;
use crate::error::{Result, RollcallError};
use crate::location::LocationProvider;
use crate::permissions::{PermissionSource, PermissionsGate, ResumeCheck};
use crate::region::{GeofenceFacility, RegionEvent, RegionMonitor, RegistrationReport};
use crate::repository::{CheckInRepository, RemoteStore};
use crate::status::{derive_status, status_from_latest};
use crate::storage::SessionStore;
use crate::types::{AttendanceStatus, CheckInRecord, CheckInType, Event, Position};

/// Poll interval used when the facility cannot push and polling is disabled.
pub const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the status change broadcast.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Platform collaborators the engine is built from.
pub struct EngineParts {
    /// Authoritative check-in backend.
    pub store: Arc<dyn RemoteStore>,
    /// Device position source.
    pub location: Arc<dyn LocationProvider>,
    /// Location authorization facility.
    pub permissions: Arc<dyn PermissionSource>,
    /// Proximity monitoring facility.
    pub geofence: Arc<dyn GeofenceFacility>,
}

/// Published after a record is durably appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatusChange {
    /// Attendee.
    pub user_id: String,
    /// Event whose status changed.
    pub event_id: String,
    /// Status implied by the new record.
    pub status: AttendanceStatus,
    /// The record as stored.
    pub record: CheckInRecord,
}

/// Result of [`AttendanceEngine::check_current_position`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Reconciliation {
    /// The fix the decision was based on.
    pub position: Position,
    /// Active regions containing the fix.
    pub inside: Vec<String>,
    /// Corrective deliveries queued.
    pub enqueued: Vec<RegionEvent>,
    /// Regions skipped because the store could not be read.
    pub unresolved: Vec<String>,
}

struct EngineInner {
    user_id: String,
    config: EngineConfig,
    monitor: RegionMonitor,
    repository: CheckInRepository,
    location: Arc<dyn LocationProvider>,
    permissions: PermissionsGate,
    session: Mutex<MonitoringSession>,
    session_store: Option<SessionStore>,
    issues: IssueLog,
    status_tx: broadcast::Sender<StatusChange>,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<RegionEvent>>>,
    last_known: Mutex<HashMap<String, CheckInType>>,
    optimistic: Mutex<HashMap<String, CheckInType>>,
    polling: Mutex<Option<CancellationToken>>,
    pending: watch::Sender<usize>,
}

impl EngineInner {
    fn persist_session(&self) {
        let Some(store) = &self.session_store else {
            return;
        };
        let snapshot = self.session.lock().snapshot(&self.user_id);
        let outcome = if snapshot.is_monitoring {
            store.save(&snapshot)
        } else {
            store.clear()
        };
        if let Err(err) = outcome {
            warn!(path = %store.path().display(), error = %err, "Failed to persist session");
        }
    }
}

/// Geofenced attendance tracking for one signed-in user.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct AttendanceEngine {
    inner: Arc<EngineInner>,
}

impl AttendanceEngine {
    /// Builds an idle engine. No task is spawned until monitoring starts.
    ///
    /// When `config.session_path` is set, the session is persisted there.
    #[must_use]
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (pending, _) = watch::channel(0);
        let inner = EngineInner {
            user_id: config.user_id.clone(),
            monitor: RegionMonitor::new(parts.geofence, config.event_channel_capacity),
            repository: CheckInRepository::new(parts.store, config.repository_timeout()),
            location: parts.location,
            permissions: PermissionsGate::new(parts.permissions),
            session: Mutex::new(MonitoringSession::default()),
            session_store: config.session_path.clone().map(SessionStore::new),
            issues: IssueLog::new(config.issue_log_capacity),
            status_tx,
            queues: Mutex::new(HashMap::new()),
            last_known: Mutex::new(HashMap::new()),
            optimistic: Mutex::new(HashMap::new()),
            polling: Mutex::new(None),
            pending,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The user this engine records attendance for.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// The region monitor. Platform facilities hand deliveries to it.
    #[must_use]
    pub fn monitor(&self) -> &RegionMonitor {
        &self.inner.monitor
    }

    /// Whether a monitoring session is active.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.inner.session.lock().is_monitoring
    }

    /// Starts (or restarts) monitoring `events`.
    ///
    /// Calling it again replaces the region set and restarts polling. The
    /// delivery stream is kept, so nothing already accepted is dropped and no
    /// delivery is processed twice. Invalid events are reported in the
    /// returned [`RegistrationReport`] and the issue log.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` if location access is refused. Nothing is
    ///   registered and the session is left as it was.
    /// - `MonitoringUnsupported` if the platform cannot monitor regions.
    pub async fn start_monitoring(&self, events: Vec<Event>) -> Result<RegistrationReport> {
        let inner = &self.inner;

        if let Err(err) = inner.permissions.ensure_background().await {
            inner
                .issues
                .record(EngineIssue::new(IssueKind::Permission, None, err.to_string()));
            return Err(err);
        }

        let report = inner.monitor.register_regions(&events).map_err(|err| {
            error!(error = %err, "Region registration failed");
            err
        })?;
        for rejection in &report.rejected {
            inner.issues.record(EngineIssue::new(
                IssueKind::Validation,
                Some(&rejection.event_id),
                rejection.reason.clone(),
            ));
        }

        let token = CancellationToken::new();
        if let Some(previous) = inner.polling.lock().replace(token.clone()) {
            previous.cancel();
        }
        if let Some(deliveries) = inner.monitor.events() {
            tokio::spawn(worker::run_event_loop(Arc::downgrade(inner), deliveries));
        }

        let poll_interval = if inner.monitor.supports_push() {
            inner.config.poll_interval()
        } else {
            Some(
                inner
                    .config
                    .poll_interval()
                    .unwrap_or(FALLBACK_POLL_INTERVAL),
            )
        };
        if let Some(interval) = poll_interval {
            tokio::spawn(worker::run_position_poll(
                Arc::downgrade(inner),
                token,
                interval,
                inner.location.subscribe(),
            ));
        }

        inner.permissions.rearm();
        inner
            .session
            .lock()
            .start(events, report.registered.clone());
        inner.persist_session();

        info!(
            registered = report.registered.len(),
            rejected = report.rejected.len(),
            polling = poll_interval.is_some(),
            "Monitoring started"
        );
        Ok(report)
    }

    /// Starts monitoring every event the user is registered for.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the registrations cannot be fetched, or
    /// any error from [`Self::start_monitoring`].
    pub async fn start_registered(&self) -> Result<RegistrationReport> {
        let inner = &self.inner;
        let repository = &inner.repository;
        let user_id = inner.user_id.as_str();
        let events = inner
            .retrying("registered events", move || repository.registered_events(user_id))
            .await?;
        self.start_monitoring(events).await
    }

    /// Stops monitoring. Idempotent.
    ///
    /// Regions are unregistered and polling is cancelled immediately, so no
    /// new delivery is accepted. Deliveries accepted before the stop, whether
    /// still buffered or already queued for a region, are still written.
    pub fn stop_monitoring(&self) {
        let inner = &self.inner;
        if let Some(token) = inner.polling.lock().take() {
            token.cancel();
        }
        inner.monitor.unregister_all();

        let was_monitoring = {
            let mut session = inner.session.lock();
            let was = session.is_monitoring;
            session.stop();
            was
        };
        inner.persist_session();

        if was_monitoring {
            info!("Monitoring stopped");
        }
    }

    /// Reconciles recorded state against where the device actually is.
    ///
    /// For every active region, queues a check-in if the device is inside
    /// but the store does not say checked in, and a check-out if it is
    /// outside but the store says checked in. Store truth replaces any
    /// optimistic status.
    ///
    /// # Errors
    ///
    /// - `NotMonitoring` without an active session.
    /// - The position error when no fix can be obtained after one retry.
    pub async fn check_current_position(&self) -> Result<Reconciliation> {
        let inner = &self.inner;
        if !self.is_monitoring() {
            return Err(RollcallError::NotMonitoring);
        }

        let position = match inner.fetch_position_with_retry().await {
            Ok(position) => position,
            Err(err) => {
                inner.issues.record(EngineIssue::new(
                    IssueKind::FetchPositionFailed,
                    None,
                    format!("Reconciliation skipped: {err}"),
                ));
                return Err(err);
            }
        };

        let regions = inner.monitor.active_regions();
        let inside: BTreeSet<String> = RegionMonitor::check_now(&regions, &position)
            .into_iter()
            .collect();

        let repository = &inner.repository;
        let user_id = inner.user_id.as_str();
        let mut enqueued = Vec::new();
        let mut unresolved = Vec::new();

        for region in regions.iter() {
            let event_id = region.identifier.as_str();
            let stored = match inner
                .retrying("check-in lookup", move || repository.latest_for(user_id, event_id))
                .await
            {
                Ok(record) => record.map(|r| r.kind),
                Err(err) => {
                    inner.issues.record(EngineIssue::new(
                        IssueKind::for_remote_error(&err),
                        Some(event_id),
                        format!("Could not reconcile: {err}"),
                    ));
                    unresolved.push(event_id.to_string());
                    continue;
                }
            };
            inner.optimistic.lock().remove(event_id);

            let correction = match (inside.contains(event_id), stored) {
                (true, Some(CheckInType::CheckIn))
                | (false, None | Some(CheckInType::CheckOut)) => None,
                (true, _) => Some(RegionEvent::enter(event_id)),
                (false, Some(CheckInType::CheckIn)) => Some(RegionEvent::exit(event_id)),
            };
            if let Some(event) = correction {
                debug!(event_id, kind = ?event.kind, "Queueing corrective delivery");
                inner.enqueue(event.clone());
                enqueued.push(event);
            }
        }

        inner.session.lock().currently_inside = inside.iter().next().cloned();
        inner.persist_session();

        info!(
            inside = inside.len(),
            corrections = enqueued.len(),
            unresolved = unresolved.len(),
            "Position reconciled"
        );
        Ok(Reconciliation {
            position,
            inside: inside.into_iter().collect(),
            enqueued,
            unresolved,
        })
    }

    /// Called when the app returns to the foreground.
    ///
    /// If background access was withdrawn while suspended, monitoring stops
    /// and a single warning is recorded. Returns `true` when that happened.
    pub async fn on_foreground_resume(&self) -> bool {
        if !self.is_monitoring() {
            return false;
        }
        match self.inner.permissions.check_on_resume().await {
            ResumeCheck::StillGranted => false,
            ResumeCheck::Revoked { first_report } => {
                self.stop_monitoring();
                if first_report {
                    self.inner.issues.record(EngineIssue::new(
                        IssueKind::PermissionRevoked,
                        None,
                        "Background location access was revoked; automatic check-in is off",
                    ));
                }
                true
            }
        }
    }

    /// Restores the persisted session after a cold start.
    ///
    /// The snapshot only says what to monitor. Attendance is re-derived by
    /// a reconciliation pass before anything else relies on it. Returns
    /// `None` when there was nothing to resume.
    ///
    /// # Errors
    ///
    /// Returns persistence, permission or monitoring errors. A failed
    /// reconciliation is an error too; monitoring stays active.
    pub async fn resume_session(&self) -> Result<Option<Reconciliation>> {
        let Some(store) = &self.inner.session_store else {
            return Ok(None);
        };
        let Some(snapshot) = store.load()? else {
            return Ok(None);
        };
        if !snapshot.is_monitoring || snapshot.user_id != self.inner.user_id {
            debug!(user_id = %snapshot.user_id, "Discarding stale session snapshot");
            store.clear()?;
            return Ok(None);
        }

        info!(
            events = snapshot.events.len(),
            saved_at = %snapshot.saved_at,
            "Resuming monitoring session"
        );
        self.start_monitoring(snapshot.events).await?;
        self.check_current_position().await.map(Some)
    }

    /// Attendance status as the UI should show it.
    ///
    /// A write that failed after its retry is shown optimistically until a
    /// later write or a reconciliation replaces it.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the store cannot be read.
    pub async fn current_status(&self, user_id: &str, event_id: &str) -> Result<AttendanceStatus> {
        let canonical = self.canonical_status(user_id, event_id).await?;
        if user_id != self.inner.user_id || canonical == AttendanceStatus::NotRegistered {
            return Ok(canonical);
        }
        let optimistic = self.inner.optimistic.lock().get(event_id).copied();
        Ok(optimistic.map_or(canonical, |kind| status_from_latest(true, Some(kind))))
    }

    /// Attendance status derived from the store alone.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the store cannot be read.
    pub async fn canonical_status(&self, user_id: &str, event_id: &str) -> Result<AttendanceStatus> {
        let repository = &self.inner.repository;
        let registered = repository.registration_exists(user_id, event_id).await?;
        if !registered {
            return Ok(AttendanceStatus::NotRegistered);
        }
        let history = repository.history_for(user_id, event_id).await?;
        Ok(derive_status(registered, &history))
    }

    /// A user's records for an event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the store cannot be read.
    pub async fn history(&self, user_id: &str, event_id: &str) -> Result<Vec<CheckInRecord>> {
        self.inner.repository.history_for(user_id, event_id).await
    }

    /// Every attendee's records for an event, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a remote error if the store cannot be read.
    pub async fn event_history(&self, event_id: &str) -> Result<Vec<CheckInRecord>> {
        self.inner.repository.event_history(event_id).await
    }

    /// Live feed of recorded status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Live feed of engine issues.
    #[must_use]
    pub fn subscribe_issues(&self) -> broadcast::Receiver<EngineIssue> {
        self.inner.issues.subscribe()
    }

    /// Retained issues, oldest first.
    #[must_use]
    pub fn issues(&self) -> Vec<EngineIssue> {
        self.inner.issues.snapshot()
    }

    /// Number of retained issues of `kind`.
    #[must_use]
    pub fn issue_count(&self, kind: IssueKind) -> usize {
        self.inner.issues.count(kind)
    }

    /// Current session state.
    #[must_use]
    pub fn session(&self) -> SessionSnapshot {
        self.inner.session.lock().snapshot(&self.inner.user_id)
    }

    /// Number of accepted deliveries not yet fully processed.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        *self.inner.pending.borrow() + self.inner.monitor.backlog()
    }

    /// Number of region workers currently running.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.inner.queues.lock().len()
    }

    /// Waits until every accepted delivery has been processed, including
    /// deliveries still buffered in the monitor's channel.
    pub async fn wait_idle(&self) {
        let mut pending = self.inner.pending.subscribe();
        let mut backlog = self.inner.monitor.subscribe_backlog();
        // Both senders live in `inner`, which `self` keeps alive. The event
        // loop counts a delivery as pending before acknowledging it, so a
        // zero backlog followed by zero pending means nothing is in between.
        loop {
            let _ = backlog.wait_for(|n| *n == 0).await;
            let _ = pending.wait_for(|n| *n == 0).await;
            if self.inner.monitor.backlog() == 0 && *self.inner.pending.borrow() == 0 {
                break;
            }
        }
    }
}
