//! Attendance session state machine.
//!
//! Per employee: `NoOpenSession` → check-in → `OpenSession(check_in)` →
//! check-out (after the minimum gap) → `NoOpenSession`. The store is only
//! consulted, never trusted to enforce the single-open-session rule.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{AttendanceSession, AttendanceStore};

pub const DEFAULT_MIN_SESSION_GAP_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceConfig {
    /// Minimum time between check-in and check-out for the same employee.
    pub min_session_gap: TimeDelta,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            min_session_gap: TimeDelta::seconds(DEFAULT_MIN_SESSION_GAP_SECS),
        }
    }
}

/// Outcome of `mark_attendance`. Never an `Err`: faults are reported, not thrown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttendanceResult {
    CheckIn { session: AttendanceSession },
    CheckOut { session: AttendanceSession },
    /// Check-out attempted before the minimum gap elapsed.
    Ignored { session_id: String, elapsed_secs: i64 },
    Error { message: String },
}

#[derive(Debug, Clone, Default)]
pub struct AttendanceTracker {
    config: AttendanceConfig,
}

impl AttendanceTracker {
    pub fn new(config: AttendanceConfig) -> Self {
        Self { config }
    }

    /// Check the employee in or out at `now`.
    pub fn mark_attendance<S: AttendanceStore + ?Sized>(
        &self,
        store: &mut S,
        employee_id: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> AttendanceResult {
        if let Err(message) = validate(employee_id, name) {
            tracing::warn!(employee_id, %message, "attendance input rejected");
            return AttendanceResult::Error { message };
        }

        let open = match store.find_open_session(employee_id) {
            Ok(open) => open,
            Err(e) => return storage_fault(employee_id, e),
        };

        match open {
            None => {
                let session = AttendanceSession {
                    id: uuid::Uuid::new_v4().to_string(),
                    employee_id: employee_id.to_string(),
                    name: name.trim().to_string(),
                    check_in: now,
                    check_out: None,
                    duration_secs: 0,
                };
                if let Err(e) = store.insert(&session) {
                    return storage_fault(employee_id, e);
                }
                tracing::info!(employee_id, session_id = %session.id, "checked in");
                AttendanceResult::CheckIn { session }
            }
            Some(mut session) => {
                let elapsed = now - session.check_in;
                if elapsed < self.config.min_session_gap {
                    tracing::debug!(
                        employee_id,
                        elapsed_secs = elapsed.num_seconds(),
                        "check-out too soon, ignored"
                    );
                    return AttendanceResult::Ignored {
                        session_id: session.id,
                        elapsed_secs: elapsed.num_seconds(),
                    };
                }

                let duration_secs = elapsed.num_seconds();
                if let Err(e) = store.close_session(&session.id, now, duration_secs) {
                    return storage_fault(employee_id, e);
                }
                session.check_out = Some(now);
                session.duration_secs = duration_secs;
                tracing::info!(
                    employee_id,
                    session_id = %session.id,
                    duration_secs,
                    "checked out"
                );
                AttendanceResult::CheckOut { session }
            }
        }
    }
}

fn storage_fault(employee_id: &str, e: impl std::fmt::Display) -> AttendanceResult {
    tracing::error!(employee_id, error = %e, "attendance storage fault");
    AttendanceResult::Error {
        message: format!("storage fault: {e}"),
    }
}

/// Reject blank or malformed identifiers before storage is touched.
pub fn validate(employee_id: &str, name: &str) -> Result<(), String> {
    if employee_id.trim().is_empty() {
        return Err("employee id is blank".into());
    }
    if employee_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("employee id {employee_id:?} contains whitespace or control characters"));
    }
    if name.trim().is_empty() {
        return Err("employee name is blank".into());
    }
    if name.chars().any(char::is_control) {
        return Err("employee name contains control characters".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryAttendanceStore, StorageError};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// Store whose every call fails.
    struct BrokenStore;

    impl AttendanceStore for BrokenStore {
        fn find_open_session(&self, _: &str) -> Result<Option<AttendanceSession>, StorageError> {
            Err(StorageError::Backend("disk I/O error".into()))
        }
        fn insert(&mut self, _: &AttendanceSession) -> Result<(), StorageError> {
            Err(StorageError::Backend("disk I/O error".into()))
        }
        fn close_session(&mut self, _: &str, _: DateTime<Utc>, _: i64) -> Result<(), StorageError> {
            Err(StorageError::Backend("disk I/O error".into()))
        }
        fn recent(&self, _: usize) -> Result<Vec<AttendanceSession>, StorageError> {
            Err(StorageError::Backend("disk I/O error".into()))
        }
    }

    #[test]
    fn test_first_mark_checks_in() {
        let mut store = MemoryAttendanceStore::new();
        let result = AttendanceTracker::default().mark_attendance(&mut store, "E1", "Ada", t(0));
        match result {
            AttendanceResult::CheckIn { session } => {
                assert_eq!(session.check_in, t(0));
                assert_eq!(session.duration_secs, 0);
                assert!(session.is_open());
            }
            other => panic!("expected check-in, got {other:?}"),
        }
        assert_eq!(store.sessions().len(), 1);
    }

    #[test]
    fn test_retrigger_within_gap_ignored() {
        let mut store = MemoryAttendanceStore::new();
        let tracker = AttendanceTracker::default();
        tracker.mark_attendance(&mut store, "E1", "Ada", t(0));
        let result = tracker.mark_attendance(&mut store, "E1", "Ada", t(4 * 60));
        assert!(matches!(result, AttendanceResult::Ignored { elapsed_secs: 240, .. }));
        assert!(store.sessions()[0].is_open());
    }

    #[test]
    fn test_after_gap_checks_out() {
        let mut store = MemoryAttendanceStore::new();
        let tracker = AttendanceTracker::default();
        tracker.mark_attendance(&mut store, "E1", "Ada", t(0));
        let result = tracker.mark_attendance(&mut store, "E1", "Ada", t(6 * 60));
        match result {
            AttendanceResult::CheckOut { session } => {
                assert_eq!(session.duration_secs, 360);
                assert_eq!(session.check_out, Some(t(360)));
            }
            other => panic!("expected check-out, got {other:?}"),
        }
        let stored = &store.sessions()[0];
        assert_eq!(stored.duration_secs, 360);
        assert!(!stored.is_open());
    }

    #[test]
    fn test_exact_gap_checks_out() {
        let mut store = MemoryAttendanceStore::new();
        let tracker = AttendanceTracker::default();
        tracker.mark_attendance(&mut store, "E1", "Ada", t(0));
        let result = tracker.mark_attendance(&mut store, "E1", "Ada", t(300));
        assert!(matches!(result, AttendanceResult::CheckOut { .. }));
    }

    #[test]
    fn test_check_in_again_after_check_out() {
        let mut store = MemoryAttendanceStore::new();
        let tracker = AttendanceTracker::default();
        tracker.mark_attendance(&mut store, "E1", "Ada", t(0));
        tracker.mark_attendance(&mut store, "E1", "Ada", t(600));
        let result = tracker.mark_attendance(&mut store, "E1", "Ada", t(700));
        assert!(matches!(result, AttendanceResult::CheckIn { .. }));
        let open: Vec<_> = store.sessions().iter().filter(|s| s.is_open()).collect();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn test_employees_are_independent() {
        let mut store = MemoryAttendanceStore::new();
        let tracker = AttendanceTracker::default();
        tracker.mark_attendance(&mut store, "E1", "Ada", t(0));
        let result = tracker.mark_attendance(&mut store, "E2", "Grace", t(10));
        assert!(matches!(result, AttendanceResult::CheckIn { .. }));
    }

    #[test]
    fn test_storage_fault_is_reported() {
        let result = AttendanceTracker::default().mark_attendance(&mut BrokenStore, "E1", "Ada", t(0));
        match result {
            AttendanceResult::Error { message } => assert!(message.contains("disk I/O error")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_input_rejected_before_storage() {
        // BrokenStore would report a storage fault if it were touched.
        let tracker = AttendanceTracker::default();
        for (id, name) in [("", "Ada"), ("  ", "Ada"), ("E 1", "Ada"), ("E1", " "), ("E1", "A\u{0}da")] {
            match tracker.mark_attendance(&mut BrokenStore, id, name, t(0)) {
                AttendanceResult::Error { message } => {
                    assert!(!message.contains("storage"), "{id:?}/{name:?}: {message}")
                }
                other => panic!("expected error, got {other:?}"),
            }
        }
    }
}
