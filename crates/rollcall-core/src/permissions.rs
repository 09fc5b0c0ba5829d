//! Location authorization gate.
//!
//! Monitoring regions while the app is suspended needs background location
//! access, which platforms only grant on top of foreground access.
//! [`PermissionsGate`] requests what is missing before monitoring starts and
//! notices when access is withdrawn behind the engine's back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::error::{Result, RollcallError};

/// The two levels of location access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    /// Access while the app is in use.
    Foreground,
    /// Access while the app is suspended.
    Background,
}

impl std::fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Foreground => f.write_str("Foreground"),
            Self::Background => f.write_str("Background"),
        }
    }
}

/// Authorization state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Authorization {
    /// The user allowed access.
    Granted,
    /// The user refused, or the platform forbids access.
    Denied,
    /// The user has not been asked yet.
    Undetermined,
}

/// The platform's permission facility.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// Current authorization, without prompting.
    async fn status(&self, kind: PermissionKind) -> Authorization;

    /// Prompts the user if the platform allows it, returning the outcome.
    async fn request(&self, kind: PermissionKind) -> Authorization;
}

/// Outcome of the permission check performed on foreground resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCheck {
    /// Background access is still granted.
    StillGranted,
    /// Background access was withdrawn. `first_report` is `true` only the
    /// first time this revocation is observed.
    Revoked {
        /// Whether the caller should warn.
        first_report: bool,
    },
}

/// Gates monitoring on location authorization.
pub struct PermissionsGate {
    source: Arc<dyn PermissionSource>,
    revocation_reported: AtomicBool,
}

impl PermissionsGate {
    /// Wraps a platform permission facility.
    pub fn new(source: Arc<dyn PermissionSource>) -> Self {
        Self {
            source,
            revocation_reported: AtomicBool::new(false),
        }
    }

    /// Ensures foreground access, prompting if needed.
    ///
    /// # Errors
    ///
    /// Returns `RollcallError::PermissionDenied(Foreground)` if access is refused.
    pub async fn ensure_foreground(&self) -> Result<()> {
        self.ensure(PermissionKind::Foreground).await
    }

    /// Ensures background access, prompting for foreground access first.
    ///
    /// # Errors
    ///
    /// Returns `RollcallError::PermissionDenied` naming the level refused.
    pub async fn ensure_background(&self) -> Result<()> {
        self.ensure_foreground().await?;
        self.ensure(PermissionKind::Background).await
    }

    /// Current background authorization, without prompting.
    pub async fn background_status(&self) -> Authorization {
        self.source.status(PermissionKind::Background).await
    }

    /// Checks whether background access survived while the app was suspended.
    ///
    /// A revocation is reported as `first_report: true` once; later checks
    /// stay quiet until [`Self::rearm`] is called.
    pub async fn check_on_resume(&self) -> ResumeCheck {
        if self.background_status().await == Authorization::Granted {
            return ResumeCheck::StillGranted;
        }
        let already = self.revocation_reported.swap(true, Ordering::SeqCst);
        ResumeCheck::Revoked {
            first_report: !already,
        }
    }

    /// Re-enables revocation warnings after monitoring starts again.
    pub fn rearm(&self) {
        self.revocation_reported.store(false, Ordering::SeqCst);
    }

    async fn ensure(&self, kind: PermissionKind) -> Result<()> {
        match self.source.status(kind).await {
            Authorization::Granted => return Ok(()),
            state => debug!(?kind, ?state, "Requesting location permission"),
        }

        match self.source.request(kind).await {
            Authorization::Granted => {
                info!(?kind, "Location permission granted");
                Ok(())
            }
            _ => Err(RollcallError::PermissionDenied(kind)),
        }
    }
}

/// In-process permission facility driven by the host.
///
/// Each level has a current state and the answer the "user" gives when
/// prompted.
#[derive(Debug)]
pub struct SimulatedPermissions {
    state: Mutex<HashMap<PermissionKind, Authorization>>,
    answers: Mutex<HashMap<PermissionKind, Authorization>>,
    prompts: AtomicUsize,
}

impl Default for SimulatedPermissions {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPermissions {
    /// Nothing asked yet; every prompt is accepted.
    #[must_use]
    pub fn new() -> Self {
        let undetermined = HashMap::from([
            (PermissionKind::Foreground, Authorization::Undetermined),
            (PermissionKind::Background, Authorization::Undetermined),
        ]);
        let accept = HashMap::from([
            (PermissionKind::Foreground, Authorization::Granted),
            (PermissionKind::Background, Authorization::Granted),
        ]);
        Self {
            state: Mutex::new(undetermined),
            answers: Mutex::new(accept),
            prompts: AtomicUsize::new(0),
        }
    }

    /// Both levels already granted.
    #[must_use]
    pub fn granted() -> Self {
        let permissions = Self::new();
        permissions.set(PermissionKind::Foreground, Authorization::Granted);
        permissions.set(PermissionKind::Background, Authorization::Granted);
        permissions
    }

    /// Foreground granted; background refused now and when prompted.
    #[must_use]
    pub fn background_denied() -> Self {
        let permissions = Self::granted();
        permissions.deny(PermissionKind::Background);
        permissions
    }

    /// Overrides the current state of `kind`.
    pub fn set(&self, kind: PermissionKind, authorization: Authorization) {
        self.state.lock().insert(kind, authorization);
    }

    /// Sets the answer given the next time `kind` is prompted.
    pub fn answer_with(&self, kind: PermissionKind, authorization: Authorization) {
        self.answers.lock().insert(kind, authorization);
    }

    /// Refuses `kind` now and on every prompt, like a user revoking it in settings.
    pub fn deny(&self, kind: PermissionKind) {
        self.set(kind, Authorization::Denied);
        self.answer_with(kind, Authorization::Denied);
    }

    /// Number of prompts shown so far.
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionSource for SimulatedPermissions {
    async fn status(&self, kind: PermissionKind) -> Authorization {
        self.state
            .lock()
            .get(&kind)
            .copied()
            .unwrap_or(Authorization::Undetermined)
    }

    async fn request(&self, kind: PermissionKind) -> Authorization {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let current = state.get(&kind).copied().unwrap_or(Authorization::Undetermined);
        if current == Authorization::Granted {
            return current;
        }
        let answer = self
            .answers
            .lock()
            .get(&kind)
            .copied()
            .unwrap_or(Authorization::Denied);
        state.insert(kind, answer);
        answer
    }
}
