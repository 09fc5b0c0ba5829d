//! Engine-level issue log.
//!
//! Failures on the background delivery path have no caller to return to, so
//! they are kept here and broadcast to subscribers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::error::RollcallError;

/// What went wrong (or, for skipped duplicates, what happened).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// An event could not become a region and was dropped.
    Validation,
    /// Location authorization was denied; monitoring did not start.
    Permission,
    /// Background authorization disappeared while monitoring.
    PermissionRevoked,
    /// A store round-trip failed twice.
    TransientRemote,
    /// The store refused a request; not retried.
    RemoteRejected,
    /// A write was skipped because the latest record already matched.
    DuplicateWriteSkipped,
    /// No position could be obtained; the write went ahead without one.
    FetchPositionFailed,
}

/// How loudly an issue is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Degraded but working.
    Warning,
    /// Something the user should see.
    Error,
}

impl IssueKind {
    /// Reporting level for this kind.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::DuplicateWriteSkipped => Severity::Info,
            Self::Validation | Self::FetchPositionFailed | Self::PermissionRevoked => {
                Severity::Warning
            }
            Self::Permission | Self::TransientRemote | Self::RemoteRejected => Severity::Error,
        }
    }

    /// Issue kind for a failed store round-trip.
    #[must_use]
    pub const fn for_remote_error(err: &RollcallError) -> Self {
        if err.is_recoverable() {
            Self::TransientRemote
        } else {
            Self::RemoteRejected
        }
    }
}

/// A recorded issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EngineIssue {
    /// Classification.
    pub kind: IssueKind,
    /// Event concerned, when there is one.
    pub event_id: Option<String>,
    /// Human-readable detail.
    pub message: String,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

impl EngineIssue {
    /// Creates an issue stamped now.
    pub fn new(kind: IssueKind, event_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            event_id: event_id.map(str::to_string),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Bounded, broadcasting issue log.
pub struct IssueLog {
    entries: Mutex<VecDeque<EngineIssue>>,
    capacity: usize,
    tx: broadcast::Sender<EngineIssue>,
}

impl IssueLog {
    /// Keeps the last `capacity` issues.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    /// Logs, stores and broadcasts `issue`.
    pub fn record(&self, issue: EngineIssue) {
        let event_id = issue.event_id.as_deref().unwrap_or("-");
        match issue.kind.severity() {
            Severity::Info => info!(kind = ?issue.kind, event_id, "{}", issue.message),
            Severity::Warning => warn!(kind = ?issue.kind, event_id, "{}", issue.message),
            Severity::Error => error!(kind = ?issue.kind, event_id, "{}", issue.message),
        }

        {
            let mut entries = self.entries.lock();
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(issue.clone());
        }
        // No subscribers is fine.
        let _ = self.tx.send(issue);
    }

    /// Oldest-first copy of the retained issues.
    pub fn snapshot(&self) -> Vec<EngineIssue> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of retained issues of `kind`.
    pub fn count(&self, kind: IssueKind) -> usize {
        self.entries.lock().iter().filter(|i| i.kind == kind).count()
    }

    /// Live feed of new issues.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineIssue> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded() {
        let log = IssueLog::new(2);
        for i in 0..3 {
            log.record(EngineIssue::new(
                IssueKind::Validation,
                Some(&format!("e{i}")),
                "bad radius",
            ));
        }
        let retained: Vec<_> = log
            .snapshot()
            .into_iter()
            .filter_map(|i| i.event_id)
            .collect();
        assert_eq!(retained, vec!["e1".to_string(), "e2".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_issues() {
        let log = IssueLog::new(8);
        let mut rx = log.subscribe();
        log.record(EngineIssue::new(IssueKind::DuplicateWriteSkipped, Some("e"), "dup"));

        let issue = rx.recv().await.unwrap();
        assert_eq!(issue.kind, IssueKind::DuplicateWriteSkipped);
        assert_eq!(log.count(IssueKind::DuplicateWriteSkipped), 1);
    }

    #[test]
    fn test_severity_and_remote_mapping() {
        assert_eq!(IssueKind::DuplicateWriteSkipped.severity(), Severity::Info);
        assert_eq!(IssueKind::TransientRemote.severity(), Severity::Error);
        assert_eq!(
            IssueKind::for_remote_error(&RollcallError::TransientRemote("x".into())),
            IssueKind::TransientRemote
        );
        assert_eq!(
            IssueKind::for_remote_error(&RollcallError::RemoteRejected {
                status: 401,
                message: "x".into()
            }),
            IssueKind::RemoteRejected
        );
    }
}
