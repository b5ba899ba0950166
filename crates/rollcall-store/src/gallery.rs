use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rollcall_core::embedding;
use rollcall_core::{Embedding, EmployeeTemplate, Gallery, StorageError};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{decode_embedding_blob, encode_embedding_blob, to_millis, StoreError};

/// Enrolled templates in SQLite.
pub struct GalleryDb {
    conn: Connection,
}

impl GalleryDb {
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

    fn load_all(&self) -> Result<Vec<EmployeeTemplate>, StoreError> {
        let mut templates: BTreeMap<String, EmployeeTemplate> = BTreeMap::new();

        let mut stmt = self
            .conn
            .prepare("SELECT employee_id, name FROM employees ORDER BY employee_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (employee_id, name) = row?;
            templates.insert(
                employee_id.clone(),
                EmployeeTemplate {
                    employee_id,
                    name,
                    embeddings: Vec::new(),
                },
            );
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id, employee_id, dimension, embedding FROM templates ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;
        for row in rows {
            let (id, employee_id, dimension, blob) = row?;
            let dimension = usize::try_from(dimension)
                .map_err(|_| StoreError::InvalidDbValue(format!("template {id}: dimension {dimension}")))?;
            let raw = decode_embedding_blob(&blob, dimension)?;
            // Stored vectors are re-validated; a corrupt row is skipped, not fatal.
            match embedding::normalize(&raw) {
                Ok(e) => {
                    if let Some(t) = templates.get_mut(&employee_id) {
                        t.embeddings.push(e);
                    }
                }
                Err(e) => tracing::warn!(template_id = id, %employee_id, error = %e, "skipping invalid template"),
            }
        }

        Ok(templates
            .into_values()
            .filter(|t| !t.embeddings.is_empty())
            .collect())
    }

    fn insert_employee(
        &mut self,
        employee_id: &str,
        name: &str,
        embeddings: &[Embedding],
    ) -> Result<Option<EmployeeTemplate>, StoreError> {
        let tx = self.conn.transaction()?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM employees WHERE employee_id = ?1",
                params![employee_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(None);
        }

        tx.execute(
            "INSERT INTO employees (employee_id, name, enrolled_at) VALUES (?1, ?2, ?3)",
            params![employee_id, name, to_millis(Utc::now())],
        )?;
        for e in embeddings {
            tx.execute(
                "INSERT INTO templates (employee_id, dimension, embedding) VALUES (?1, ?2, ?3)",
                params![employee_id, e.dim() as i64, encode_embedding_blob(e.values())],
            )?;
        }
        tx.commit()?;

        tracing::debug!(employee_id, templates = embeddings.len(), "employee stored");
        Ok(Some(EmployeeTemplate {
            employee_id: employee_id.to_string(),
            name: name.to_string(),
            embeddings: embeddings.to_vec(),
        }))
    }
}

impl Gallery for GalleryDb {
    fn all(&self) -> Result<Vec<EmployeeTemplate>, StorageError> {
        Ok(self.load_all()?)
    }

    fn insert(
        &mut self,
        employee_id: &str,
        name: &str,
        embeddings: &[Embedding],
    ) -> Result<EmployeeTemplate, StorageError> {
        self.insert_employee(employee_id, name, embeddings)?
            .ok_or_else(|| StorageError::DuplicateId(employee_id.to_string()))
    }

    fn remove(&mut self, employee_id: &str) -> Result<bool, StorageError> {
        let removed = self
            .conn
            .execute("DELETE FROM employees WHERE employee_id = ?1", params![employee_id])
            .map_err(StoreError::from)?;
        Ok(removed > 0)
    }
}
