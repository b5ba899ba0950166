//! Persistence seams consumed by the core.
//!
//! The engine only sees these traits; `rollcall-store` provides the SQLite
//! implementations and the in-memory versions here back the tests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Embedding, EmployeeTemplate};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("employee id already enrolled: {0}")]
    DuplicateId(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn backend(e: impl std::fmt::Display) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// One attendance record; open while `check_out` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: String,
    pub employee_id: String,
    pub name: String,
    pub check_in: DateTime<Utc>,
    pub check_out: Option<DateTime<Utc>>,
    pub duration_secs: i64,
}

impl AttendanceSession {
    pub fn is_open(&self) -> bool {
        self.check_out.is_none()
    }
}

/// Enrolled templates, keyed by employee id.
pub trait Gallery {
    fn all(&self) -> Result<Vec<EmployeeTemplate>, StorageError>;

    /// Store a new template set. Fails with `DuplicateId` if the id exists.
    fn insert(
        &mut self,
        employee_id: &str,
        name: &str,
        embeddings: &[Embedding],
    ) -> Result<EmployeeTemplate, StorageError>;

    /// Delete an employee's templates; `false` if nothing was stored.
    fn remove(&mut self, employee_id: &str) -> Result<bool, StorageError>;
}

/// Append/update store of attendance sessions.
pub trait AttendanceStore {
    fn find_open_session(&self, employee_id: &str) -> Result<Option<AttendanceSession>, StorageError>;

    fn insert(&mut self, session: &AttendanceSession) -> Result<(), StorageError>;

    fn close_session(
        &mut self,
        session_id: &str,
        check_out: DateTime<Utc>,
        duration_secs: i64,
    ) -> Result<(), StorageError>;

    /// Most recent sessions first, by check-in time.
    fn recent(&self, limit: usize) -> Result<Vec<AttendanceSession>, StorageError>;
}

/// In-memory gallery.
#[derive(Debug, Clone, Default)]
pub struct MemoryGallery {
    templates: BTreeMap<String, EmployeeTemplate>,
}

impl MemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Gallery for MemoryGallery {
    fn all(&self) -> Result<Vec<EmployeeTemplate>, StorageError> {
        Ok(self.templates.values().cloned().collect())
    }

    fn insert(
        &mut self,
        employee_id: &str,
        name: &str,
        embeddings: &[Embedding],
    ) -> Result<EmployeeTemplate, StorageError> {
        if self.templates.contains_key(employee_id) {
            return Err(StorageError::DuplicateId(employee_id.to_string()));
        }
        let template = EmployeeTemplate {
            employee_id: employee_id.to_string(),
            name: name.to_string(),
            embeddings: embeddings.to_vec(),
        };
        self.templates.insert(employee_id.to_string(), template.clone());
        Ok(template)
    }

    fn remove(&mut self, employee_id: &str) -> Result<bool, StorageError> {
        Ok(self.templates.remove(employee_id).is_some())
    }
}

/// In-memory attendance log.
#[derive(Debug, Clone, Default)]
pub struct MemoryAttendanceStore {
    sessions: Vec<AttendanceSession>,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> &[AttendanceSession] {
        &self.sessions
    }
}

impl AttendanceStore for MemoryAttendanceStore {
    fn find_open_session(&self, employee_id: &str) -> Result<Option<AttendanceSession>, StorageError> {
        Ok(self
            .sessions
            .iter()
            .rev()
            .find(|s| s.employee_id == employee_id && s.is_open())
            .cloned())
    }

    fn insert(&mut self, session: &AttendanceSession) -> Result<(), StorageError> {
        if self.sessions.iter().any(|s| s.id == session.id) {
            return Err(StorageError::DuplicateId(session.id.clone()));
        }
        self.sessions.push(session.clone());
        Ok(())
    }

    fn close_session(
        &mut self,
        session_id: &str,
        check_out: DateTime<Utc>,
        duration_secs: i64,
    ) -> Result<(), StorageError> {
        let session = self
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;
        session.check_out = Some(check_out);
        session.duration_secs = duration_secs;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<AttendanceSession>, StorageError> {
        let mut sessions = self.sessions.clone();
        sessions.sort_by(|a, b| b.check_in.cmp(&a.check_in));
        sessions.truncate(limit);
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize;

    #[test]
    fn test_memory_gallery_duplicate_id() {
        let mut gallery = MemoryGallery::new();
        let e = normalize(&[1.0, 0.0]).unwrap();
        gallery.insert("E1", "Ada", &[e.clone()]).unwrap();
        assert_eq!(
            gallery.insert("E1", "Someone Else", &[e]).unwrap_err(),
            StorageError::DuplicateId("E1".into())
        );
        assert_eq!(gallery.all().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_gallery_remove() {
        let mut gallery = MemoryGallery::new();
        let e = normalize(&[1.0, 0.0]).unwrap();
        gallery.insert("E1", "Ada", &[e]).unwrap();
        assert!(gallery.remove("E1").unwrap());
        assert!(!gallery.remove("E1").unwrap());
        assert!(gallery.all().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_close_missing() {
        let mut store = MemoryAttendanceStore::new();
        assert!(matches!(
            store.close_session("nope", Utc::now(), 0),
            Err(StorageError::NotFound(_))
        ));
    }
}
