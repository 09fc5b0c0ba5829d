//! Device position fixes.
//!
//! [`LocationProvider`] is the seam to the platform's location service. It
//! offers a one-shot fix and a continuous feed of fixes. The engine only ever
//! needs a best-effort fix, so every call goes through [`fetch_position`],
//! which bounds it with a deadline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

use crate::types::Position;

/// Errors produced while obtaining a position.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocationError {
    /// The platform has no fix to offer right now.
    #[error("No position available: {0}")]
    Unavailable(String),

    /// Location access is not authorized.
    #[error("Location access is not authorized")]
    PermissionDenied,

    /// The fix did not arrive before the deadline.
    #[error("No position fix within {0:?}")]
    Timeout(Duration),
}

/// Result type for location operations.
pub type LocationResult<T> = std::result::Result<T, LocationError>;

/// Source of device position fixes.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Requests a single fresh fix.
    async fn current_position(&self) -> LocationResult<Position>;

    /// Continuous feed of fixes. Holds `None` until the first fix arrives.
    fn subscribe(&self) -> watch::Receiver<Option<Position>>;
}

/// Requests a fix, giving up after `deadline`.
///
/// # Errors
///
/// Returns the provider's error, or `LocationError::Timeout`.
pub async fn fetch_position(
    provider: &dyn LocationProvider,
    deadline: Duration,
) -> LocationResult<Position> {
    match tokio::time::timeout(deadline, provider.current_position()).await {
        Ok(result) => result,
        Err(_) => Err(LocationError::Timeout(deadline)),
    }
}

/// In-process location source driven by the host.
///
/// Used by the development server (positions pushed over HTTP) and by tests.
#[derive(Debug)]
pub struct SimulatedLocation {
    feed: watch::Sender<Option<Position>>,
    failures: AtomicUsize,
    error: Mutex<LocationError>,
}

impl Default for SimulatedLocation {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedLocation {
    /// Creates a source with no fix.
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = watch::channel(None);
        Self {
            feed,
            failures: AtomicUsize::new(0),
            error: Mutex::new(LocationError::Unavailable("simulated failure".into())),
        }
    }

    /// Creates a source already holding `position`.
    #[must_use]
    pub fn at(position: Position) -> Self {
        let source = Self::new();
        source.set_position(position);
        source
    }

    /// Publishes a new fix to one-shot callers and subscribers.
    pub fn set_position(&self, position: Position) {
        self.feed.send_replace(Some(position));
    }

    /// Forgets the current fix.
    pub fn clear(&self) {
        self.feed.send_replace(None);
    }

    /// Makes the next `count` one-shot requests fail with `error`.
    pub fn fail_next(&self, count: usize, error: LocationError) {
        *self.error.lock() = error;
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocationProvider for SimulatedLocation {
    async fn current_position(&self) -> LocationResult<Position> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(self.error.lock().clone());
        }

        (*self.feed.borrow()).ok_or_else(|| LocationError::Unavailable("no fix yet".into()))
    }

    fn subscribe(&self) -> watch::Receiver<Option<Position>> {
        self.feed.subscribe()
    }
}
