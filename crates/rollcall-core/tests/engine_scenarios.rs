//! End-to-end attendance scenarios driven through simulated device
//! collaborators and the in-memory store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rollcall_core::engine::{AttendanceEngine, EngineIssue, EngineParts, IssueKind, StatusChange};
use rollcall_core::repository::{NewCheckIn, RemoteResult};
use rollcall_core::{
    AttendanceStatus, Authorization, CheckInRecord, CheckInType, EngineConfig, Event, MemoryStore,
    PermissionKind, Position, RegionEvent, RegionEventKind, RollcallError, SimulatedGeofence,
    Registration, RemoteStore, SimulatedLocation, SimulatedPermissions,
};
use tokio::sync::broadcast;

const USER: &str = "alice";
const VENUE: (f64, f64) = (37.7749, -122.4194);

struct Harness {
    store: Arc<MemoryStore>,
    location: Arc<SimulatedLocation>,
    permissions: Arc<SimulatedPermissions>,
    geofence: Arc<SimulatedGeofence>,
    engine: AttendanceEngine,
}

fn config() -> EngineConfig {
    EngineConfig {
        user_id: USER.into(),
        retry_backoff_ms: 20,
        poll_interval_secs: 0,
        ..EngineConfig::default()
    }
}

fn harness_with(config: EngineConfig, geofence: SimulatedGeofence, store: Arc<MemoryStore>) -> Harness {
    let location = Arc::new(SimulatedLocation::at(outside()));
    let permissions = Arc::new(SimulatedPermissions::granted());
    let geofence = Arc::new(geofence);
    let engine = AttendanceEngine::new(
        config,
        EngineParts {
            store: store.clone(),
            location: location.clone(),
            permissions: permissions.clone(),
            geofence: geofence.clone(),
        },
    );
    Harness {
        store,
        location,
        permissions,
        geofence,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(config(), SimulatedGeofence::new(), Arc::new(MemoryStore::new()))
}

fn venue(id: &str) -> Event {
    Event {
        id: id.to_string(),
        latitude: VENUE.0,
        longitude: VENUE.1,
        radius_meters: 100.0,
        starts_at: Utc::now(),
        ends_at: None,
    }
}

fn inside() -> Position {
    Position::new(VENUE.0, VENUE.1)
}

fn outside() -> Position {
    // Roughly 1.1 km north of the venue.
    Position::new(VENUE.0 + 0.01, VENUE.1)
}

async fn next_change(rx: &mut broadcast::Receiver<StatusChange>) -> StatusChange {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a status change")
        .expect("status channel closed")
}

async fn next_issue(rx: &mut broadcast::Receiver<EngineIssue>, kind: IssueKind) -> EngineIssue {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let issue = rx.recv().await.expect("issue channel closed");
            if issue.kind == kind {
                return issue;
            }
        }
    })
    .await
    .expect("timed out waiting for an issue")
}

#[tokio::test]
async fn test_enter_then_exit_records_both() {
    let h = harness();
    h.store.register(USER, "E");
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    h.location.set_position(inside());
    assert!(h.engine.monitor().deliver(RegionEvent::enter("E")).await);
    let change = next_change(&mut changes).await;
    assert_eq!(change.status, AttendanceStatus::CheckedIn);
    assert_eq!(change.record.latitude, Some(VENUE.0));
    assert_eq!(
        h.engine.current_status(USER, "E").await.unwrap(),
        AttendanceStatus::CheckedIn
    );

    h.location.set_position(outside());
    assert!(h.engine.monitor().deliver(RegionEvent::exit("E")).await);
    let change = next_change(&mut changes).await;
    assert_eq!(change.status, AttendanceStatus::CheckedOut);

    let history = h.engine.history(USER, "E").await.unwrap();
    let kinds: Vec<CheckInType> = history.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![CheckInType::CheckIn, CheckInType::CheckOut]);
    assert!(history[0].sequence < history[1].sequence);
    assert_eq!(
        h.engine.current_status(USER, "E").await.unwrap(),
        AttendanceStatus::CheckedOut
    );
}

#[tokio::test]
async fn test_duplicate_enter_writes_once() {
    let h = harness();
    h.store.register(USER, "E");
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();
    let mut issues = h.engine.subscribe_issues();

    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    h.engine.monitor().deliver(RegionEvent::enter("E")).await;

    next_change(&mut changes).await;
    next_issue(&mut issues, IssueKind::DuplicateWriteSkipped).await;
    h.engine.wait_idle().await;

    assert_eq!(h.store.check_in_rows().len(), 1);
    assert_eq!(
        h.engine.canonical_status(USER, "E").await.unwrap(),
        AttendanceStatus::CheckedIn
    );
}

#[tokio::test]
async fn test_failed_write_is_optimistic_until_reconciled() {
    let h = harness();
    h.store.register(USER, "E");
    h.store.register(USER, "F");
    let far = Event {
        latitude: VENUE.0 + 1.0,
        ..venue("F")
    };
    h.engine
        .start_monitoring(vec![venue("E"), far])
        .await
        .unwrap();
    let mut changes = h.engine.subscribe_status();
    let mut issues = h.engine.subscribe_issues();

    // Both the write and its retry fail.
    h.store.fail_next_writes(2);
    h.location.set_position(inside());
    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    let issue = next_issue(&mut issues, IssueKind::TransientRemote).await;
    assert_eq!(issue.event_id.as_deref(), Some("E"));

    assert!(h.store.check_in_rows().is_empty());
    assert_eq!(
        h.engine.current_status(USER, "E").await.unwrap(),
        AttendanceStatus::CheckedIn
    );
    assert_eq!(
        h.engine.canonical_status(USER, "E").await.unwrap(),
        AttendanceStatus::Pending
    );

    // Other events keep flowing.
    h.engine.monitor().deliver(RegionEvent::enter("F")).await;
    assert_eq!(next_change(&mut changes).await.event_id, "F");

    // The device is still inside E, so reconciliation re-queues the check-in.
    let reconciliation = h.engine.check_current_position().await.unwrap();
    assert_eq!(reconciliation.inside, vec!["E".to_string()]);
    assert_eq!(reconciliation.enqueued.len(), 2);

    let mut settled = Vec::new();
    settled.push(next_change(&mut changes).await);
    settled.push(next_change(&mut changes).await);
    let e = settled.iter().find(|c| c.event_id == "E").unwrap();
    assert_eq!(e.status, AttendanceStatus::CheckedIn);
    let f = settled.iter().find(|c| c.event_id == "F").unwrap();
    assert_eq!(f.status, AttendanceStatus::CheckedOut);

    assert_eq!(
        h.engine.canonical_status(USER, "E").await.unwrap(),
        AttendanceStatus::CheckedIn
    );
}

#[tokio::test]
async fn test_slow_event_does_not_block_others() {
    let h = harness_with(
        EngineConfig {
            retry_backoff_ms: 1_000,
            ..config()
        },
        SimulatedGeofence::new(),
        Arc::new(MemoryStore::new()),
    );
    h.engine
        .start_monitoring(vec![venue("E"), venue("F")])
        .await
        .unwrap();
    let mut changes = h.engine.subscribe_status();

    // E's first lookup fails and its worker sits in backoff.
    h.store.fail_next_reads(1);
    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.monitor().deliver(RegionEvent::enter("F")).await;

    assert_eq!(next_change(&mut changes).await.event_id, "F");
    assert_eq!(next_change(&mut changes).await.event_id, "E");
}

#[tokio::test]
async fn test_permission_denied_registers_nothing() {
    let h = harness();
    h.permissions.deny(PermissionKind::Background);

    let err = h
        .engine
        .start_monitoring(vec![venue("E")])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RollcallError::PermissionDenied(PermissionKind::Background)
    ));
    assert!(!h.engine.is_monitoring());
    assert!(h.geofence.registered().is_empty());
    assert!(h.engine.monitor().active_regions().is_empty());
    assert_eq!(h.engine.issue_count(IssueKind::Permission), 1);
}

#[tokio::test]
async fn test_unsupported_platform_is_fatal() {
    let h = harness();
    h.geofence.reject_with("no region monitoring on this device");

    let err = h
        .engine
        .start_monitoring(vec![venue("E")])
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(!h.engine.is_monitoring());
}

#[tokio::test]
async fn test_alternating_crossings_track_last_event() {
    let h = harness();
    h.store.register(USER, "E");
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    for round in 0..6 {
        let (event, expected) = if round % 2 == 0 {
            (RegionEvent::enter("E"), AttendanceStatus::CheckedIn)
        } else {
            (RegionEvent::exit("E"), AttendanceStatus::CheckedOut)
        };
        h.engine.monitor().deliver(event).await;
        assert_eq!(next_change(&mut changes).await.status, expected);
        assert_eq!(
            h.engine.canonical_status(USER, "E").await.unwrap(),
            expected
        );
    }
    assert_eq!(h.engine.history(USER, "E").await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_restart_replaces_subscription_without_duplicates() {
    let h = harness();
    let events = vec![venue("E"), venue("F")];
    h.engine.start_monitoring(events.clone()).await.unwrap();
    let first = h.engine.monitor().active_regions();
    h.engine.start_monitoring(events).await.unwrap();

    assert_eq!(*first, *h.engine.monitor().active_regions());
    assert_eq!(h.geofence.registration_count(), 2);

    let mut changes = h.engine.subscribe_status();
    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    next_change(&mut changes).await;
    h.engine.wait_idle().await;
    assert_eq!(h.store.check_in_rows().len(), 1);
}

#[tokio::test]
async fn test_invalid_events_are_reported_not_raised() {
    let h = harness();
    let broken = Event {
        radius_meters: 0.0,
        ..venue("broken")
    };
    let report = h
        .engine
        .start_monitoring(vec![venue("E"), broken])
        .await
        .unwrap();

    assert_eq!(report.registered, vec!["E".to_string()]);
    assert_eq!(report.rejected[0].event_id, "broken");
    assert_eq!(h.engine.issue_count(IssueKind::Validation), 1);
    assert!(h.engine.is_monitoring());
}

#[tokio::test]
async fn test_stop_lets_queued_writes_finish() {
    let h = harness();
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    h.store.set_latency(Duration::from_millis(100));

    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.engine.pending_writes() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.engine.stop_monitoring();
    assert!(!h.engine.monitor().deliver(RegionEvent::exit("E")).await);

    h.engine.wait_idle().await;
    let rows = h.store.check_in_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, CheckInType::CheckIn);
}

#[tokio::test]
async fn test_exit_accepted_right_before_stop_is_written() {
    let h = harness();
    h.store.register(USER, "E");
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    next_change(&mut changes).await;
    h.engine.wait_idle().await;

    assert!(h.engine.monitor().deliver(RegionEvent::exit("E")).await);
    h.engine.stop_monitoring();
    h.engine.wait_idle().await;

    let kinds: Vec<CheckInType> = h.store.check_in_rows().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![CheckInType::CheckIn, CheckInType::CheckOut]);
    assert_eq!(h.engine.pending_writes(), 0);
    assert_eq!(h.engine.session().currently_inside, None);
}

#[tokio::test]
async fn test_exit_accepted_right_before_restart_is_written() {
    let h = harness();
    h.store.register(USER, "E");
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    next_change(&mut changes).await;
    h.engine.wait_idle().await;

    assert!(h.engine.monitor().deliver(RegionEvent::exit("E")).await);
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    h.engine.wait_idle().await;

    let kinds: Vec<CheckInType> = h.store.check_in_rows().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![CheckInType::CheckIn, CheckInType::CheckOut]);
    assert!(h.engine.is_monitoring());
}

#[tokio::test]
async fn test_pending_counts_buffered_deliveries() {
    let h = harness();
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    h.store.set_latency(Duration::from_millis(100));

    assert!(h.engine.monitor().deliver(RegionEvent::enter("E")).await);
    assert!(h.engine.pending_writes() >= 1);

    h.engine.wait_idle().await;
    assert_eq!(h.store.check_in_rows().len(), 1);
    assert_eq!(h.engine.pending_writes(), 0);
}

#[tokio::test]
async fn test_committed_append_with_lost_reply_is_not_repeated() {
    let h = harness();
    h.store.register(USER, "E");
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    h.store.lose_next_write_replies(1);
    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    let change = next_change(&mut changes).await;
    h.engine.wait_idle().await;

    let rows = h.store.check_in_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, CheckInType::CheckIn);
    assert_eq!(change.record.id, rows[0].id);
    assert_eq!(
        h.engine.current_status(USER, "E").await.unwrap(),
        AttendanceStatus::CheckedIn
    );
    assert_eq!(h.engine.issue_count(IssueKind::TransientRemote), 0);
}

/// Applies the first insert, then stalls its reply past any deadline.
struct StallingStore {
    inner: Arc<MemoryStore>,
    stalled: AtomicBool,
}

#[async_trait]
impl RemoteStore for StallingStore {
    async fn insert_check_in(&self, draft: NewCheckIn) -> RemoteResult<CheckInRecord> {
        let record = self.inner.insert_check_in(draft).await?;
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(record)
    }

    async fn check_ins(&self, user_id: &str, event_id: &str) -> RemoteResult<Vec<CheckInRecord>> {
        self.inner.check_ins(user_id, event_id).await
    }

    async fn event_check_ins(&self, event_id: &str) -> RemoteResult<Vec<CheckInRecord>> {
        self.inner.event_check_ins(event_id).await
    }

    async fn registration(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> RemoteResult<Option<Registration>> {
        self.inner.registration(user_id, event_id).await
    }

    async fn registered_events(&self, user_id: &str) -> RemoteResult<Vec<Event>> {
        self.inner.registered_events(user_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_append_timeout_after_commit_is_not_repeated() {
    let rows = Arc::new(MemoryStore::new());
    rows.register(USER, "E");
    let store = Arc::new(StallingStore {
        inner: rows.clone(),
        stalled: AtomicBool::new(false),
    });
    let engine = AttendanceEngine::new(
        EngineConfig {
            repository_timeout_secs: 1,
            ..config()
        },
        EngineParts {
            store,
            location: Arc::new(SimulatedLocation::at(inside())),
            permissions: Arc::new(SimulatedPermissions::granted()),
            geofence: Arc::new(SimulatedGeofence::new()),
        },
    );
    engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = engine.subscribe_status();

    assert!(engine.monitor().deliver(RegionEvent::enter("E")).await);
    engine.wait_idle().await;

    let kinds: Vec<CheckInType> = rows.check_in_rows().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![CheckInType::CheckIn]);
    let change = changes.try_recv().unwrap();
    assert_eq!(change.status, AttendanceStatus::CheckedIn);
    assert_eq!(change.record.id, rows.check_in_rows()[0].id);
}

#[tokio::test]
async fn test_idle_workers_exit() {
    let h = harness();
    h.engine.start_monitoring(vec![venue("E"), venue("F")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    h.engine.monitor().deliver(RegionEvent::enter("F")).await;
    next_change(&mut changes).await;
    next_change(&mut changes).await;
    h.engine.stop_monitoring();
    wait_for_workers_to_exit(&h.engine).await;

    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    h.engine.monitor().deliver(RegionEvent::exit("E")).await;
    let change = next_change(&mut changes).await;
    assert_eq!(change.status, AttendanceStatus::CheckedOut);
    wait_for_workers_to_exit(&h.engine).await;

    let e_kinds: Vec<CheckInType> = h
        .store
        .check_in_rows()
        .iter()
        .filter(|r| r.event_id == "E")
        .map(|r| r.kind)
        .collect();
    assert_eq!(e_kinds, vec![CheckInType::CheckIn, CheckInType::CheckOut]);
}

async fn wait_for_workers_to_exit(engine: &AttendanceEngine) {
    engine.wait_idle().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.active_workers() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("region workers still running");
}

#[tokio::test]
async fn test_missing_fix_still_records() {
    let h = harness();
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();
    h.location.clear();

    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    let change = next_change(&mut changes).await;

    assert_eq!(change.record.latitude, None);
    assert_eq!(change.record.longitude, None);
    assert_eq!(h.engine.issue_count(IssueKind::FetchPositionFailed), 1);
}

#[tokio::test]
async fn test_reconciliation_checks_out_when_outside() {
    let h = harness();
    h.store.register(USER, "E");
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    next_change(&mut changes).await;

    // The exit was never delivered.
    let reconciliation = h.engine.check_current_position().await.unwrap();
    assert!(reconciliation.inside.is_empty());
    assert_eq!(reconciliation.enqueued.len(), 1);
    assert_eq!(reconciliation.enqueued[0].kind, RegionEventKind::Exit);
    assert_eq!(next_change(&mut changes).await.status, AttendanceStatus::CheckedOut);

    // Nothing left to correct.
    h.engine.wait_idle().await;
    let again = h.engine.check_current_position().await.unwrap();
    assert!(again.enqueued.is_empty());
}

#[tokio::test]
async fn test_revocation_warns_once() {
    let h = harness();
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut issues = h.engine.subscribe_issues();

    h.permissions
        .set(PermissionKind::Background, Authorization::Denied);
    assert!(h.engine.on_foreground_resume().await);
    assert!(!h.engine.on_foreground_resume().await);
    assert!(!h.engine.on_foreground_resume().await);

    next_issue(&mut issues, IssueKind::PermissionRevoked).await;
    assert_eq!(h.engine.issue_count(IssueKind::PermissionRevoked), 1);
    assert!(!h.engine.is_monitoring());
    assert!(h.geofence.registered().is_empty());
}

#[tokio::test]
async fn test_cold_start_reconciles_before_trusting_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.register(USER, "E");
    let persisted = EngineConfig {
        session_path: Some(dir.path().join("session.json")),
        ..config()
    };

    {
        let before = harness_with(persisted.clone(), SimulatedGeofence::new(), store.clone());
        before
            .engine
            .start_monitoring(vec![venue("E")])
            .await
            .unwrap();
        // Process dies without stopping.
    }

    let after = harness_with(persisted.clone(), SimulatedGeofence::new(), store.clone());
    after.location.set_position(inside());
    let mut changes = after.engine.subscribe_status();

    let reconciliation = after.engine.resume_session().await.unwrap().unwrap();
    assert!(after.engine.is_monitoring());
    assert_eq!(reconciliation.inside, vec!["E".to_string()]);
    assert_eq!(next_change(&mut changes).await.status, AttendanceStatus::CheckedIn);
    assert_eq!(after.geofence.registered().len(), 1);

    // A clean stop leaves nothing to resume.
    after.engine.wait_idle().await;
    after.engine.stop_monitoring();
    let fresh = harness_with(persisted, SimulatedGeofence::new(), store);
    assert!(fresh.engine.resume_session().await.unwrap().is_none());
}

#[tokio::test]
async fn test_polling_fallback_without_push() {
    let h = harness_with(config(), SimulatedGeofence::poll_only(), Arc::new(MemoryStore::new()));
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    h.location.set_position(inside());
    assert_eq!(next_change(&mut changes).await.status, AttendanceStatus::CheckedIn);

    h.location.set_position(outside());
    assert_eq!(next_change(&mut changes).await.status, AttendanceStatus::CheckedOut);
}

#[tokio::test]
async fn test_event_history_spans_attendees() {
    let h = harness();
    h.engine.start_monitoring(vec![venue("E")]).await.unwrap();
    let mut changes = h.engine.subscribe_status();

    h.engine.monitor().deliver(RegionEvent::enter("E")).await;
    next_change(&mut changes).await;

    let repository = rollcall_core::CheckInRepository::new(h.store.clone(), Duration::from_secs(5));
    repository
        .append("bob", "E", CheckInType::CheckIn, None)
        .await
        .unwrap();

    let history = h.engine.event_history("E").await.unwrap();
    let users: Vec<&str> = history.iter().map(|r| r.user_id.as_str()).collect();
    assert_eq!(users, vec![USER, "bob"]);
}
