//! Background delivery path.
//!
//! One loop drains the region event stream and hands each delivery to the
//! worker for its region. Workers are per event id, so writes for one event
//! are strictly serialized while different events proceed independently. A
//! worker exits once its queue is empty and is respawned on demand.
//! Background tasks hold only a weak reference to the engine and exit once
//! it is dropped.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::issues::{EngineIssue, IssueKind};
use super::{EngineInner, StatusChange};
use crate::error::{Result, RollcallError};
use crate::location::fetch_position;
use crate::region::{RegionEvent, RegionEvents, RegionMonitor};
use crate::status::status_from_latest;
use crate::types::{CheckInRecord, CheckInType, Position};

impl EngineInner {
    /// Runs `attempt`, retrying once after the configured backoff when the
    /// failure is recoverable.
    pub(super) async fn retrying<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match attempt().await {
            Err(err) if err.is_recoverable() => {
                warn!(operation, error = %err, "Retrying after backoff");
                tokio::time::sleep(self.config.retry_backoff()).await;
                attempt().await
            }
            outcome => outcome,
        }
    }

    /// One position fix, retried once.
    pub(super) async fn fetch_position_with_retry(&self) -> Result<Position> {
        let provider = self.location.as_ref();
        let deadline = self.config.position_timeout();
        self.retrying("position fetch", move || async move {
            fetch_position(provider, deadline)
                .await
                .map_err(RollcallError::from)
        })
        .await
    }

    /// Queues `event` behind any earlier deliveries for the same region.
    pub(super) fn enqueue(self: &Arc<Self>, event: RegionEvent) {
        self.pending.send_modify(|n| *n += 1);

        let mut queues = self.queues.lock();
        let sender = queues
            .entry(event.region_id.clone())
            .or_insert_with(|| spawn_key_worker(Arc::downgrade(self), &event.region_id));

        if let Err(mpsc::error::SendError(event)) = sender.send(event) {
            warn!(region_id = %event.region_id, "Region worker gone, dropping delivery");
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    /// Appends one record. A recoverable failure is retried once, but only
    /// after re-reading the latest record: if the first attempt committed
    /// and just lost its reply, that record is the result.
    async fn append_verified(
        &self,
        event_id: &str,
        kind: CheckInType,
        position: Option<Position>,
    ) -> Result<CheckInRecord> {
        let user_id = self.user_id.as_str();
        let repository = &self.repository;

        let err = match repository.append(user_id, event_id, kind, position).await {
            Err(err) if err.is_recoverable() => err,
            outcome => return outcome,
        };
        warn!(event_id, error = %err, "Check-in append failed, verifying before retry");
        tokio::time::sleep(self.config.retry_backoff()).await;

        match repository.latest_for(user_id, event_id).await {
            Ok(Some(record)) if record.kind == kind => {
                info!(
                    event_id,
                    sequence = record.sequence,
                    "Append had committed despite the error"
                );
                Ok(record)
            }
            Ok(_) => repository.append(user_id, event_id, kind, position).await,
            Err(verify) => {
                debug!(event_id, error = %verify, "Could not verify append, not retrying");
                Err(err)
            }
        }
    }

    /// Processes one delivery: idempotency check, best-effort position,
    /// append, then publish.
    ///
    /// The last type written per event is remembered and used when the store
    /// cannot be asked.
    async fn apply(&self, event: RegionEvent) {
        let event_id = event.region_id.as_str();
        let user_id = self.user_id.as_str();
        let kind = CheckInType::from(event.kind);
        let repository = &self.repository;

        let latest = match self
            .retrying("check-in lookup", move || repository.latest_for(user_id, event_id))
            .await
        {
            Ok(record) => {
                let latest = record.map(|r| r.kind);
                self.remember(event_id, latest);
                latest
            }
            Err(err) => {
                let fallback = self.last_known.lock().get(event_id).copied();
                warn!(
                    event_id,
                    error = %err,
                    ?fallback,
                    "Latest check-in unavailable, using last known type"
                );
                fallback
            }
        };

        if latest == Some(kind) {
            self.issues.record(EngineIssue::new(
                IssueKind::DuplicateWriteSkipped,
                Some(event_id),
                format!("Latest record is already {kind}, skipping write"),
            ));
            self.session.lock().observe(&event);
            return;
        }

        let position = match self.fetch_position_with_retry().await {
            Ok(position) => Some(position),
            Err(err) => {
                self.issues.record(EngineIssue::new(
                    IssueKind::FetchPositionFailed,
                    Some(event_id),
                    format!("Writing {kind} without coordinates: {err}"),
                ));
                None
            }
        };

        let outcome = self.append_verified(event_id, kind, position).await;

        self.remember(event_id, Some(kind));
        self.session.lock().observe(&event);

        match outcome {
            Ok(record) => {
                self.optimistic.lock().remove(event_id);
                info!(
                    event_id,
                    kind = %kind,
                    sequence = record.sequence,
                    has_position = position.is_some(),
                    "Attendance recorded"
                );
                let change = StatusChange {
                    user_id: user_id.to_string(),
                    event_id: event_id.to_string(),
                    status: status_from_latest(true, Some(kind)),
                    record,
                };
                // Nobody listening is fine.
                let _ = self.status_tx.send(change);
            }
            Err(err) => {
                self.optimistic.lock().insert(event_id.to_string(), kind);
                self.issues.record(EngineIssue::new(
                    IssueKind::for_remote_error(&err),
                    Some(event_id),
                    format!("Could not record {kind}: {err}"),
                ));
            }
        }
    }

    fn remember(&self, event_id: &str, kind: Option<CheckInType>) {
        let mut last_known = self.last_known.lock();
        match kind {
            Some(kind) => {
                last_known.insert(event_id.to_string(), kind);
            }
            None => {
                last_known.remove(event_id);
            }
        }
    }
}

fn spawn_key_worker(engine: Weak<EngineInner>, event_id: &str) -> mpsc::UnboundedSender<RegionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_key_worker(engine, event_id.to_string(), rx));
    tx
}

async fn run_key_worker(
    engine: Weak<EngineInner>,
    event_id: String,
    mut rx: mpsc::UnboundedReceiver<RegionEvent>,
) {
    debug!(%event_id, "Region worker started");

    while let Some(event) = rx.recv().await {
        let Some(inner) = engine.upgrade() else { break };
        trace!(%event_id, kind = ?event.kind, "Processing region delivery");
        inner.apply(event).await;
        inner.pending.send_modify(|n| *n = n.saturating_sub(1));

        // `enqueue` sends while holding this lock, so an empty queue here
        // cannot race with a new delivery for the same event.
        let mut queues = inner.queues.lock();
        if rx.is_empty() {
            queues.remove(&event_id);
            break;
        }
    }

    debug!(%event_id, "Region worker stopped");
}

/// Drains the monitor's delivery stream for the lifetime of the engine.
///
/// The stream outlives stops and restarts, so every accepted delivery is
/// routed to its worker. A delivery is counted as pending before the monitor
/// is told it was handed off.
pub(super) async fn run_event_loop(engine: Weak<EngineInner>, mut events: RegionEvents) {
    debug!("Region event loop started");
    while let Some(event) = events.next().await {
        let Some(inner) = engine.upgrade() else { break };
        inner.enqueue(event);
        inner.monitor.acknowledge();
    }
    debug!("Region event loop stopped");
}

/// Foreground polling fallback.
///
/// Compares each fix against the active regions and feeds the implied
/// crossings through [`RegionMonitor::deliver`], exactly like a platform
/// facility would.
pub(super) async fn run_position_poll(
    engine: Weak<EngineInner>,
    token: CancellationToken,
    interval: Duration,
    mut fixes: watch::Receiver<Option<Position>>,
) {
    info!(interval_secs = interval.as_secs(), "Position polling started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut inside: BTreeSet<String> = BTreeSet::new();
    let mut feed_open = true;

    loop {
        let fix = tokio::select! {
            biased;
            () = token.cancelled() => break,
            changed = fixes.changed(), if feed_open => {
                if changed.is_err() {
                    feed_open = false;
                    continue;
                }
                let fix = *fixes.borrow_and_update();
                fix
            }
            _ = ticker.tick() => {
                let Some(inner) = engine.upgrade() else { break };
                let deadline = inner.config.position_timeout();
                match fetch_position(inner.location.as_ref(), deadline).await {
                    Ok(position) => Some(position),
                    Err(err) => {
                        debug!(error = %err, "Poll tick without a fix");
                        None
                    }
                }
            }
        };

        let Some(position) = fix else { continue };
        let Some(inner) = engine.upgrade() else { break };

        let regions = inner.monitor.active_regions();
        let current: BTreeSet<String> = RegionMonitor::check_now(&regions, &position)
            .into_iter()
            .collect();
        for event in RegionMonitor::transitions(&inside, &current) {
            inner.monitor.deliver(event).await;
        }
        inside = current;
    }
    info!("Position polling stopped");
}
