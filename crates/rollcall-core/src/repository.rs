//! Check-in persistence.
//!
//! [`RemoteStore`] is the seam to the authoritative backend; it owns
//! registrations, events and the append-only check-in table.
//! [`CheckInRepository`] wraps a store with deadlines and the ordering rule
//! the rest of the crate depends on: history is ordered by the store-assigned
//! sequence, never by any clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::{Result, RollcallError};
use crate::types::{CheckInRecord, CheckInType, Event, Position, Registration};

/// Failures reported by a remote store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The store could not be reached or failed server-side.
    #[error("network failure: {0}")]
    Network(String),

    /// Credentials were missing, expired or insufficient.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The store refused the request.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// Status reported by the store.
        status: u16,
        /// Store-provided message.
        message: String,
    },

    /// The store answered with something unreadable.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether the same request may succeed later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Result type for remote store operations.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// A check-in row before the store assigns id, sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCheckIn {
    /// Attendee.
    pub user_id: String,
    /// Event attended.
    pub event_id: String,
    /// Check-in or check-out.
    pub kind: CheckInType,
    /// Position at write time, if one was obtained.
    pub position: Option<Position>,
}

/// The authoritative backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Appends a check-in row and returns it as stored.
    async fn insert_check_in(&self, draft: NewCheckIn) -> RemoteResult<CheckInRecord>;

    /// Every check-in row for a (user, event) pair, in any order.
    async fn check_ins(&self, user_id: &str, event_id: &str) -> RemoteResult<Vec<CheckInRecord>>;

    /// Every check-in row for an event, in any order.
    async fn event_check_ins(&self, event_id: &str) -> RemoteResult<Vec<CheckInRecord>>;

    /// The registration row for a (user, event) pair.
    async fn registration(&self, user_id: &str, event_id: &str)
        -> RemoteResult<Option<Registration>>;

    /// Events the user holds an active registration for.
    async fn registered_events(&self, user_id: &str) -> RemoteResult<Vec<Event>>;
}

/// Deadline-bounded access to check-in history.
#[derive(Clone)]
pub struct CheckInRepository {
    store: Arc<dyn RemoteStore>,
    timeout: Duration,
}

impl CheckInRepository {
    /// Wraps `store`, bounding every round-trip by `timeout`.
    pub fn new(store: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Appends a check-in or check-out.
    ///
    /// # Errors
    ///
    /// Returns a remote error on network or auth failure, or
    /// `RollcallError::Timeout` when the deadline passes.
    pub async fn append(
        &self,
        user_id: &str,
        event_id: &str,
        kind: CheckInType,
        position: Option<Position>,
    ) -> Result<CheckInRecord> {
        let draft = NewCheckIn {
            user_id: user_id.to_string(),
            event_id: event_id.to_string(),
            kind,
            position,
        };
        let record = self
            .bounded("check-in append", self.store.insert_check_in(draft))
            .await?;
        debug!(
            user_id,
            event_id,
            kind = %record.kind,
            sequence = record.sequence,
            "Check-in appended"
        );
        Ok(record)
    }

    /// The record with the greatest store-assigned sequence, if any.
    ///
    /// # Errors
    ///
    /// Returns a remote error or timeout.
    pub async fn latest_for(&self, user_id: &str, event_id: &str) -> Result<Option<CheckInRecord>> {
        let records = self
            .bounded("check-in lookup", self.store.check_ins(user_id, event_id))
            .await?;
        Ok(records.into_iter().max_by_key(|record| record.sequence))
    }

    /// Full history for a (user, event) pair, ordered by sequence.
    ///
    /// # Errors
    ///
    /// Returns a remote error or timeout.
    pub async fn history_for(&self, user_id: &str, event_id: &str) -> Result<Vec<CheckInRecord>> {
        let mut records = self
            .bounded("check-in history", self.store.check_ins(user_id, event_id))
            .await?;
        records.sort_by_key(|record| record.sequence);
        Ok(records)
    }

    /// Full history for an event across all attendees, ordered by sequence.
    ///
    /// This is the read access dwell-time analytics build on.
    ///
    /// # Errors
    ///
    /// Returns a remote error or timeout.
    pub async fn event_history(&self, event_id: &str) -> Result<Vec<CheckInRecord>> {
        let mut records = self
            .bounded("event history", self.store.event_check_ins(event_id))
            .await?;
        records.sort_by_key(|record| record.sequence);
        Ok(records)
    }

    /// Whether the user holds an active (non-cancelled) registration.
    ///
    /// # Errors
    ///
    /// Returns a remote error or timeout.
    pub async fn registration_exists(&self, user_id: &str, event_id: &str) -> Result<bool> {
        let registration = self
            .bounded("registration lookup", self.store.registration(user_id, event_id))
            .await?;
        Ok(registration.is_some_and(|r| r.is_active()))
    }

    /// Events the user is registered for.
    ///
    /// # Errors
    ///
    /// Returns a remote error or timeout.
    pub async fn registered_events(&self, user_id: &str) -> Result<Vec<Event>> {
        self.bounded("registered events", self.store.registered_events(user_id))
            .await
    }

    async fn bounded<T, F>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: std::future::Future<Output = RemoteResult<T>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result.map_err(RollcallError::from),
            Err(_) => Err(RollcallError::Timeout {
                operation,
                after_secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    fn repository(store: &Arc<MemoryStore>) -> CheckInRepository {
        CheckInRepository::new(store.clone(), Duration::from_secs(15))
    }

    #[tokio::test]
    async fn test_latest_follows_sequence_not_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(&store);

        repo.append("u", "e", CheckInType::CheckIn, None).await.unwrap();
        let second = repo.append("u", "e", CheckInType::CheckOut, None).await.unwrap();

        // Skew the first record's clock far into the future; ordering must not move.
        store.rewrite_timestamps(|record| {
            if record.kind == CheckInType::CheckIn {
                record.timestamp += chrono::Duration::days(365);
            }
        });

        let latest = repo.latest_for("u", "e").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.kind, CheckInType::CheckOut);
    }

    #[tokio::test]
    async fn test_latest_for_empty_history() {
        let store = Arc::new(MemoryStore::new());
        assert!(repository(&store).latest_for("u", "e").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_is_scoped_and_ordered() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(&store);

        repo.append("u", "e", CheckInType::CheckIn, None).await.unwrap();
        repo.append("other", "e", CheckInType::CheckIn, None).await.unwrap();
        repo.append("u", "e2", CheckInType::CheckIn, None).await.unwrap();
        repo.append("u", "e", CheckInType::CheckOut, None).await.unwrap();

        let mine = repo.history_for("u", "e").await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine[0].sequence < mine[1].sequence);

        let everyone = repo.event_history("e").await.unwrap();
        assert_eq!(everyone.len(), 3);
        assert!(everyone.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test]
    async fn test_append_failure_maps_to_transient() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_writes(1);

        let err = repository(&store)
            .append("u", "e", CheckInType::CheckIn, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RollcallError::TransientRemote(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Duration::from_secs(60));
        let repo = CheckInRepository::new(store, Duration::from_secs(15));

        let err = repo
            .append("u", "e", CheckInType::CheckIn, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RollcallError::Timeout {
                after_secs: 15,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_registration_does_not_exist() {
        let store = Arc::new(MemoryStore::new());
        store.register("u", "e");
        store.register("u", "gone");
        store.cancel_registration("u", "gone");
        let repo = repository(&store);

        assert!(repo.registration_exists("u", "e").await.unwrap());
        assert!(!repo.registration_exists("u", "gone").await.unwrap());
        assert!(!repo.registration_exists("u", "never").await.unwrap());
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(!RemoteError::Unauthorized("expired".into()).is_transient());
        assert!(!RemoteError::Decode("eof".into()).is_transient());
    }
}
