//! The engine's monitoring session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::region::{RegionEvent, RegionEventKind};
use crate::types::Event;

/// Mutable session state owned by one engine.
#[derive(Debug, Default)]
pub(crate) struct MonitoringSession {
    pub is_monitoring: bool,
    pub events: Vec<Event>,
    pub active_region_ids: Vec<String>,
    pub currently_inside: Option<String>,
}

impl MonitoringSession {
    pub fn start(&mut self, events: Vec<Event>, active_region_ids: Vec<String>) {
        self.is_monitoring = true;
        self.events = events;
        // Keep the inside flag only if that region is still monitored.
        if let Some(inside) = &self.currently_inside {
            if !active_region_ids.contains(inside) {
                self.currently_inside = None;
            }
        }
        self.active_region_ids = active_region_ids;
    }

    pub fn stop(&mut self) {
        *self = Self::default();
    }

    /// Applies the effect of a processed delivery to the inside flag.
    ///
    /// Writes that finish after a stop leave the cleared session alone.
    pub fn observe(&mut self, event: &RegionEvent) {
        if !self.is_monitoring {
            return;
        }
        match event.kind {
            RegionEventKind::Enter => self.currently_inside = Some(event.region_id.clone()),
            RegionEventKind::Exit => {
                if self.currently_inside.as_deref() == Some(event.region_id.as_str()) {
                    self.currently_inside = None;
                }
            }
        }
    }

    pub fn snapshot(&self, user_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            user_id: user_id.to_string(),
            is_monitoring: self.is_monitoring,
            events: self.events.clone(),
            active_region_ids: self.active_region_ids.clone(),
            currently_inside: self.currently_inside.clone(),
            saved_at: Utc::now(),
        }
    }
}

/// Point-in-time view of the monitoring session, also its persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SessionSnapshot {
    /// User the session belongs to.
    pub user_id: String,
    /// Whether region monitoring is active.
    pub is_monitoring: bool,
    /// Events passed to the last `start_monitoring` call.
    pub events: Vec<Event>,
    /// Regions actually registered.
    pub active_region_ids: Vec<String>,
    /// Event the device is believed to be inside. Optimistic until reconciled.
    pub currently_inside: Option<String>,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_only_clears_matching_region() {
        let mut session = MonitoringSession::default();
        session.start(Vec::new(), vec!["a".into(), "b".into()]);

        session.observe(&RegionEvent::enter("a"));
        session.observe(&RegionEvent::exit("b"));
        assert_eq!(session.currently_inside.as_deref(), Some("a"));

        session.observe(&RegionEvent::exit("a"));
        assert_eq!(session.currently_inside, None);
    }

    #[test]
    fn test_late_write_after_stop_is_ignored() {
        let mut session = MonitoringSession::default();
        session.start(Vec::new(), vec!["a".into()]);
        session.stop();

        session.observe(&RegionEvent::enter("a"));
        assert_eq!(session.currently_inside, None);
        assert!(!session.is_monitoring);
    }

    #[test]
    fn test_restart_drops_inside_flag_for_removed_region() {
        let mut session = MonitoringSession::default();
        session.start(Vec::new(), vec!["a".into()]);
        session.observe(&RegionEvent::enter("a"));

        session.start(Vec::new(), vec!["b".into()]);
        assert_eq!(session.currently_inside, None);
        assert!(session.is_monitoring);

        session.stop();
        assert!(!session.is_monitoring);
        assert!(session.active_region_ids.is_empty());
    }
}
