use std::path::PathBuf;

use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::engine::{EngineError, EngineHandle};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// Sessions returned when the caller passes a limit of zero.
const DEFAULT_RECENT_LIMIT: usize = 20;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Load the gallery and begin periodic scanning.
    async fn start_scanning(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start scanning requested");
        self.engine.start_scanning().await.map_err(failed)
    }

    async fn stop_scanning(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop scanning requested");
        self.engine.stop_scanning().await.map_err(failed)
    }

    /// Enroll an employee from face images; an empty list captures from the camera.
    async fn enroll(
        &self,
        employee_id: &str,
        name: &str,
        image_paths: Vec<String>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(employee_id, images = image_paths.len(), "enroll requested");
        let paths = image_paths.into_iter().map(PathBuf::from).collect();
        match self
            .engine
            .enroll(employee_id.to_string(), name.to_string(), paths)
            .await
        {
            Ok(template) => Ok(serde_json::json!({
                "employee_id": template.employee_id,
                "name": template.name,
                "templates": template.embeddings.len(),
            })
            .to_string()),
            Err(EngineError::Registration(e)) => {
                tracing::warn!(employee_id, error = %e, "enrollment rejected");
                Err(zbus::fdo::Error::InvalidArgs(e.to_string()))
            }
            Err(e) => {
                tracing::error!(employee_id, error = %e, "enrollment failed");
                Err(failed(e))
            }
        }
    }

    /// Return daemon and scanning state as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session": status,
        })
        .to_string())
    }

    async fn list_employees(&self) -> zbus::fdo::Result<String> {
        let employees = self.engine.list_employees().await.map_err(failed)?;
        to_json(&employees)
    }

    async fn remove_employee(&self, employee_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(employee_id, "remove employee requested");
        self.engine
            .remove_employee(employee_id.to_string())
            .await
            .map_err(failed)
    }

    /// Most recent attendance sessions, newest first, as JSON.
    async fn recent_sessions(&self, limit: u32) -> zbus::fdo::Result<String> {
        let limit = match limit {
            0 => DEFAULT_RECENT_LIMIT,
            n => n as usize,
        };
        let sessions = self.engine.recent_sessions(limit).await.map_err(failed)?;
        to_json(&sessions)
    }

    /// Emitted once per scan cycle with the cycle event as JSON.
    #[zbus(signal)]
    pub async fn scan_event(emitter: &SignalEmitter<'_>, payload: &str) -> zbus::Result<()>;
}
