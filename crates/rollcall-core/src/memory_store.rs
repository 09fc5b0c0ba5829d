//! Process-local remote store.
//!
//! Behaves like the real backend where it matters: it assigns ids, sequence
//! numbers and timestamps on insert. Outages and latency can be injected.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::repository::{NewCheckIn, RemoteError, RemoteResult, RemoteStore};
use crate::types::{CheckInRecord, Event, Registration, RegistrationStatus};

#[derive(Debug, Default)]
struct Tables {
    next_sequence: u64,
    check_ins: Vec<CheckInRecord>,
    registrations: Vec<Registration>,
    events: Vec<Event>,
}

/// In-memory [`RemoteStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing_writes: AtomicUsize,
    failing_reads: AtomicUsize,
    lost_replies: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an event row.
    pub fn insert_event(&self, event: Event) {
        let mut tables = self.tables.lock();
        tables.events.retain(|e| e.id != event.id);
        tables.events.push(event);
    }

    /// Registers `user_id` for `event_id`, returning the new row.
    pub fn register(&self, user_id: &str, event_id: &str) -> Registration {
        let registration = Registration {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            event_id: event_id.to_string(),
            status: RegistrationStatus::Registered,
        };
        let mut tables = self.tables.lock();
        tables
            .registrations
            .retain(|r| !(r.user_id == user_id && r.event_id == event_id));
        tables.registrations.push(registration.clone());
        registration
    }

    /// Marks a registration cancelled.
    pub fn cancel_registration(&self, user_id: &str, event_id: &str) {
        let mut tables = self.tables.lock();
        for registration in &mut tables.registrations {
            if registration.user_id == user_id && registration.event_id == event_id {
                registration.status = RegistrationStatus::Cancelled;
            }
        }
    }

    /// Every stored check-in, in insertion order.
    pub fn check_in_rows(&self) -> Vec<CheckInRecord> {
        self.tables.lock().check_ins.clone()
    }

    /// Makes the next `count` inserts fail with a network error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` reads fail with a network error.
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` inserts commit but report a network error,
    /// as if the reply never reached the caller.
    pub fn lose_next_write_replies(&self, count: usize) {
        self.lost_replies.store(count, Ordering::SeqCst);
    }

    /// Delays every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Edits stored timestamps in place, e.g. to simulate skewed clocks.
    pub fn rewrite_timestamps(&self, mut edit: impl FnMut(&mut CheckInRecord)) {
        for record in &mut self.tables.lock().check_ins {
            edit(record);
        }
    }

    async fn round_trip(&self, counter: &AtomicUsize) -> RemoteResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if take_one(counter) {
            return Err(RemoteError::Network("simulated outage".into()));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn insert_check_in(&self, draft: NewCheckIn) -> RemoteResult<CheckInRecord> {
        self.round_trip(&self.failing_writes).await?;

        let mut tables = self.tables.lock();
        tables.next_sequence += 1;
        let record = CheckInRecord {
            id: Uuid::now_v7(),
            sequence: tables.next_sequence,
            user_id: draft.user_id,
            event_id: draft.event_id,
            kind: draft.kind,
            timestamp: Utc::now(),
            latitude: draft.position.map(|p| p.latitude),
            longitude: draft.position.map(|p| p.longitude),
        };
        tables.check_ins.push(record.clone());
        drop(tables);

        if take_one(&self.lost_replies) {
            return Err(RemoteError::Network("reply lost after commit".into()));
        }
        Ok(record)
    }

    async fn check_ins(&self, user_id: &str, event_id: &str) -> RemoteResult<Vec<CheckInRecord>> {
        self.round_trip(&self.failing_reads).await?;
        Ok(self
            .tables
            .lock()
            .check_ins
            .iter()
            .filter(|r| r.user_id == user_id && r.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn event_check_ins(&self, event_id: &str) -> RemoteResult<Vec<CheckInRecord>> {
        self.round_trip(&self.failing_reads).await?;
        Ok(self
            .tables
            .lock()
            .check_ins
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn registration(
        &self,
        user_id: &str,
        event_id: &str,
    ) -> RemoteResult<Option<Registration>> {
        self.round_trip(&self.failing_reads).await?;
        Ok(self
            .tables
            .lock()
            .registrations
            .iter()
            .find(|r| r.user_id == user_id && r.event_id == event_id)
            .cloned())
    }

    async fn registered_events(&self, user_id: &str) -> RemoteResult<Vec<Event>> {
        self.round_trip(&self.failing_reads).await?;
        let tables = self.tables.lock();
        Ok(tables
            .events
            .iter()
            .filter(|event| {
                tables
                    .registrations
                    .iter()
                    .any(|r| r.user_id == user_id && r.event_id == event.id && r.is_active())
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckInType, Position};

    fn draft(kind: CheckInType) -> NewCheckIn {
        NewCheckIn {
            user_id: "u".into(),
            event_id: "e".into(),
            kind,
            position: Some(Position::new(1.5, 2.5)),
        }
    }

    #[tokio::test]
    async fn test_store_assigns_increasing_sequence() {
        let store = MemoryStore::new();
        let a = store.insert_check_in(draft(CheckInType::CheckIn)).await.unwrap();
        let b = store.insert_check_in(draft(CheckInType::CheckOut)).await.unwrap();

        assert!(b.sequence > a.sequence);
        assert_ne!(a.id, b.id);
        assert_eq!(a.latitude, Some(1.5));
        assert_eq!(a.longitude, Some(2.5));
    }

    #[tokio::test]
    async fn test_injected_outage_is_consumed() {
        let store = MemoryStore::new();
        store.fail_next_writes(2);

        assert!(store.insert_check_in(draft(CheckInType::CheckIn)).await.is_err());
        assert!(store.insert_check_in(draft(CheckInType::CheckIn)).await.is_err());
        assert!(store.insert_check_in(draft(CheckInType::CheckIn)).await.is_ok());
        assert_eq!(store.check_in_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_reply_still_commits() {
        let store = MemoryStore::new();
        store.lose_next_write_replies(1);

        let err = store.insert_check_in(draft(CheckInType::CheckIn)).await;
        assert!(matches!(err, Err(RemoteError::Network(_))));
        assert_eq!(store.check_in_rows().len(), 1);
    }

    #[tokio::test]
    async fn test_registered_events_skip_cancelled() {
        let store = MemoryStore::new();
        for id in ["a", "b"] {
            store.insert_event(Event {
                id: id.into(),
                latitude: 0.0,
                longitude: 0.0,
                radius_meters: 10.0,
                starts_at: Utc::now(),
                ends_at: None,
            });
            store.register("u", id);
        }
        store.cancel_registration("u", "b");

        let events = store.registered_events("u").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "a");
    }
}
