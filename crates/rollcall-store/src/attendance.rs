use std::path::Path;

use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceSession, AttendanceStore, StorageError};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{from_millis, to_millis, StoreError};

const SESSION_COLUMNS: &str = "id, employee_id, name, check_in, check_out, duration_secs";

/// Attendance log in SQLite.
pub struct AttendanceDb {
    conn: Connection,
}

impl AttendanceDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            conn: crate::open_connection(path.as_ref())?,
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: crate::open_memory()?,
        })
    }
}

type SessionRow = (String, String, String, i64, Option<i64>, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_session(row: SessionRow) -> Result<AttendanceSession, StoreError> {
    let (id, employee_id, name, check_in, check_out, duration_secs) = row;
    Ok(AttendanceSession {
        id,
        employee_id,
        name,
        check_in: from_millis(check_in)?,
        check_out: check_out.map(from_millis).transpose()?,
        duration_secs,
    })
}

impl AttendanceStore for AttendanceDb {
    fn find_open_session(&self, employee_id: &str) -> Result<Option<AttendanceSession>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM attendance_sessions
                     WHERE employee_id = ?1 AND check_out IS NULL
                     ORDER BY check_in DESC LIMIT 1"
                ),
                params![employee_id],
                read_row,
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(row.map(decode_session).transpose()?)
    }

    fn insert(&mut self, session: &AttendanceSession) -> Result<(), StorageError> {
        let inserted = self.conn.execute(
            "INSERT INTO attendance_sessions (id, employee_id, name, check_in, check_out, duration_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id,
                session.employee_id,
                session.name,
                to_millis(session.check_in),
                session.check_out.map(to_millis),
                session.duration_secs,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::DuplicateId(session.id.clone()))
            }
            Err(e) => Err(StoreError::from(e).into()),
        }
    }

    fn close_session(
        &mut self,
        session_id: &str,
        check_out: DateTime<Utc>,
        duration_secs: i64,
    ) -> Result<(), StorageError> {
        let updated = self
            .conn
            .execute(
                "UPDATE attendance_sessions SET check_out = ?2, duration_secs = ?3 WHERE id = ?1",
                params![session_id, to_millis(check_out), duration_secs],
            )
            .map_err(StoreError::from)?;
        if updated == 0 {
            return Err(StorageError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<AttendanceSession>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM attendance_sessions
                 ORDER BY check_in DESC LIMIT ?1"
            ))
            .map_err(StoreError::from)?;
        let rows = stmt
            .query_map(params![limit], read_row)
            .map_err(StoreError::from)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode_session(row.map_err(StoreError::from)?)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_core::{AttendanceResult, AttendanceTracker};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn session(id: &str, employee_id: &str, check_in: i64) -> AttendanceSession {
        AttendanceSession {
            id: id.into(),
            employee_id: employee_id.into(),
            name: "Ada".into(),
            check_in: t(check_in),
            check_out: None,
            duration_secs: 0,
        }
    }

    #[test]
    fn test_open_session_lifecycle() {
        let mut db = AttendanceDb::open_in_memory().unwrap();
        db.insert(&session("s1", "E1", 0)).unwrap();
        let open = db.find_open_session("E1").unwrap().unwrap();
        assert_eq!(open.id, "s1");
        assert_eq!(open.check_in, t(0));

        db.close_session("s1", t(400), 400).unwrap();
        assert!(db.find_open_session("E1").unwrap().is_none());
        let recent = db.recent(5).unwrap();
        assert_eq!(recent[0].check_out, Some(t(400)));
        assert_eq!(recent[0].duration_secs, 400);
    }

    #[test]
    fn test_duplicate_session_id() {
        let mut db = AttendanceDb::open_in_memory().unwrap();
        db.insert(&session("s1", "E1", 0)).unwrap();
        assert_eq!(
            db.insert(&session("s1", "E2", 10)).unwrap_err(),
            StorageError::DuplicateId("s1".into())
        );
    }

    #[test]
    fn test_close_missing_session() {
        let mut db = AttendanceDb::open_in_memory().unwrap();
        assert_eq!(
            db.close_session("nope", t(0), 0).unwrap_err(),
            StorageError::NotFound("nope".into())
        );
    }

    #[test]
    fn test_recent_newest_first() {
        let mut db = AttendanceDb::open_in_memory().unwrap();
        db.insert(&session("s1", "E1", 0)).unwrap();
        db.insert(&session("s2", "E2", 50)).unwrap();
        db.insert(&session("s3", "E3", 20)).unwrap();
        let ids: Vec<String> = db.recent(2).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["s2", "s3"]);
    }

    #[test]
    fn test_tracker_against_sqlite() {
        let mut db = AttendanceDb::open_in_memory().unwrap();
        let tracker = AttendanceTracker::default();
        assert!(matches!(
            tracker.mark_attendance(&mut db, "E1", "Ada", t(0)),
            AttendanceResult::CheckIn { .. }
        ));
        assert!(matches!(
            tracker.mark_attendance(&mut db, "E1", "Ada", t(240)),
            AttendanceResult::Ignored { .. }
        ));
        match tracker.mark_attendance(&mut db, "E1", "Ada", t(360)) {
            AttendanceResult::CheckOut { session } => assert_eq!(session.duration_secs, 360),
            other => panic!("expected check-out, got {other:?}"),
        }
        assert_eq!(db.recent(10).unwrap().len(), 1);
    }
}
