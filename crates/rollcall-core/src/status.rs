//! Canonical attendance status.
//!
//! Status is a pure function of registration existence and stored history.
//! "Latest" always means the greatest store-assigned sequence.

use crate::types::{AttendanceStatus, CheckInRecord, CheckInType};

/// Derives the canonical status for a (user, event) pair.
///
/// Total over every input, including an empty history.
#[must_use]
pub fn derive_status(registration_exists: bool, history: &[CheckInRecord]) -> AttendanceStatus {
    status_from_latest(registration_exists, latest(history).map(|record| record.kind))
}

/// Same as [`derive_status`] when only the latest type is known.
#[must_use]
pub const fn status_from_latest(
    registration_exists: bool,
    latest: Option<CheckInType>,
) -> AttendanceStatus {
    if !registration_exists {
        return AttendanceStatus::NotRegistered;
    }
    match latest {
        None => AttendanceStatus::Pending,
        Some(CheckInType::CheckIn) => AttendanceStatus::CheckedIn,
        Some(CheckInType::CheckOut) => AttendanceStatus::CheckedOut,
    }
}

/// The record with the greatest store sequence.
#[must_use]
pub fn latest(history: &[CheckInRecord]) -> Option<&CheckInRecord> {
    history.iter().max_by_key(|record| record.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn record(sequence: u64, kind: CheckInType, hour: u32) -> CheckInRecord {
        CheckInRecord {
            id: Uuid::new_v4(),
            sequence,
            user_id: "u".into(),
            event_id: "e".into(),
            kind,
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap(),
            latitude: None,
            longitude: None,
        }
    }

    #[test]
    fn test_status_is_total() {
        let check_in = [record(1, CheckInType::CheckIn, 18)];
        let check_out = [record(1, CheckInType::CheckOut, 18)];

        for registered in [false, true] {
            for history in [&[][..], &check_in[..], &check_out[..]] {
                let status = derive_status(registered, history);
                if !registered {
                    assert_eq!(status, AttendanceStatus::NotRegistered);
                }
            }
        }

        assert_eq!(derive_status(true, &[]), AttendanceStatus::Pending);
        assert_eq!(derive_status(true, &check_in), AttendanceStatus::CheckedIn);
        assert_eq!(derive_status(true, &check_out), AttendanceStatus::CheckedOut);
    }

    #[test]
    fn test_latest_ignores_client_order_and_timestamps() {
        // Out of order in the slice, and the newest sequence carries the oldest clock.
        let history = vec![
            record(2, CheckInType::CheckIn, 20),
            record(3, CheckInType::CheckOut, 6),
            record(1, CheckInType::CheckIn, 23),
        ];
        assert_eq!(latest(&history).map(|r| r.sequence), Some(3));
        assert_eq!(derive_status(true, &history), AttendanceStatus::CheckedOut);
    }

    #[test]
    fn test_alternating_history_tracks_last_event() {
        let mut history = Vec::new();
        for (i, kind) in [
            CheckInType::CheckIn,
            CheckInType::CheckOut,
            CheckInType::CheckIn,
        ]
        .into_iter()
        .enumerate()
        {
            history.push(record(i as u64 + 1, kind, 18));
            let expected = match kind {
                CheckInType::CheckIn => AttendanceStatus::CheckedIn,
                CheckInType::CheckOut => AttendanceStatus::CheckedOut,
            };
            assert_eq!(derive_status(true, &history), expected);
        }
    }
}
