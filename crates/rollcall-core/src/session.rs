//! Scan session: one frame in, one observable cycle event out.
//!
//! Wires detector → crop → embedder → matcher → voting → attendance for a
//! single device. The session owns its collaborators and a cached copy of the
//! gallery, loaded at `start` and refreshed after every registration or
//! removal it performs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

use crate::attendance::{AttendanceConfig, AttendanceResult, AttendanceTracker};
use crate::detector::{Detector, DetectorError};
use crate::enroll::{self, RegistrationConfig, RegistrationError};
use crate::matcher::{CosineMatcher, Matcher, MatcherConfig};
use crate::postprocess::{ENROLL_CONFIDENCE_THRESHOLD, VERIFY_CONFIDENCE_THRESHOLD};
use crate::recognizer::{self, Embedder, RecognizerError};
use crate::store::{AttendanceSession, AttendanceStore, Gallery, StorageError};
use crate::types::{EmployeeTemplate, FaceBox, FaceOutcome, Vote};
use crate::voting::{Decision, RecognitionState, ScanState, VotingConfig, VotingEngine};

pub const DEFAULT_MAX_FACES: usize = 4;
pub const DEFAULT_DEBOUNCE_SECS: i64 = 2;
pub const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 10 * 60;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("gallery unavailable: {0}")]
    GalleryUnavailable(StorageError),
    #[error("scanning session timed out after {0} seconds")]
    TimedOut(i64),
    #[error("not scanning")]
    NotScanning,
    #[error("cancelled")]
    Cancelled,
    #[error("no face detected")]
    NoFace,
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Faces considered per frame, largest first.
    pub max_faces: usize,
    /// Minimum spacing between attendance calls for one employee.
    pub debounce: TimeDelta,
    /// Hard stop for an unattended scanning session.
    pub timeout: TimeDelta,
    pub verify_confidence: f32,
    pub enroll_confidence: f32,
    pub matcher: MatcherConfig,
    pub voting: VotingConfig,
    pub attendance: AttendanceConfig,
    pub registration: RegistrationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_faces: DEFAULT_MAX_FACES,
            debounce: TimeDelta::seconds(DEFAULT_DEBOUNCE_SECS),
            timeout: TimeDelta::seconds(DEFAULT_SESSION_TIMEOUT_SECS),
            verify_confidence: VERIFY_CONFIDENCE_THRESHOLD,
            enroll_confidence: ENROLL_CONFIDENCE_THRESHOLD,
            matcher: MatcherConfig::default(),
            voting: VotingConfig::default(),
            attendance: AttendanceConfig::default(),
            registration: RegistrationConfig::default(),
        }
    }
}

/// Why scanning ended on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    TimedOut { after_secs: i64 },
}

/// Everything observable about one processed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleEvent {
    pub at: DateTime<Utc>,
    pub faces: Vec<FaceBox>,
    pub outcomes: Vec<FaceOutcome>,
    /// `None` when no usable face was seen this cycle.
    pub vote: Option<Vote>,
    pub decision: Decision,
    pub attendance: Option<AttendanceResult>,
    /// Set on the final event of a session that stopped itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
}

impl CycleEvent {
    fn idle(at: DateTime<Utc>) -> Self {
        Self {
            at,
            faces: Vec::new(),
            outcomes: Vec::new(),
            vote: None,
            decision: Decision::Pending,
            attendance: None,
            stopped: None,
        }
    }

    /// Terminal event for a session ended by its timeout.
    pub fn timed_out(at: DateTime<Utc>, after_secs: i64) -> Self {
        Self {
            stopped: Some(StopReason::TimedOut { after_secs }),
            ..Self::idle(at)
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub scanning: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub state: ScanState,
    pub recognition: RecognitionState,
    pub enrolled: usize,
}

pub struct ScanSession<D, E, G, A> {
    detector: D,
    embedder: E,
    gallery: G,
    store: A,
    config: SessionConfig,
    matcher: CosineMatcher,
    voting: VotingEngine,
    tracker: AttendanceTracker,
    templates: Vec<EmployeeTemplate>,
    started_at: Option<DateTime<Utc>>,
    last_marked: HashMap<String, DateTime<Utc>>,
    cancel: Arc<AtomicBool>,
}

impl<D, E, G, A> ScanSession<D, E, G, A>
where
    D: Detector,
    E: Embedder,
    G: Gallery,
    A: AttendanceStore,
{
    pub fn new(detector: D, embedder: E, gallery: G, store: A, config: SessionConfig) -> Self {
        Self {
            detector,
            embedder,
            gallery,
            store,
            matcher: CosineMatcher::new(config.matcher),
            voting: VotingEngine::new(config.voting.clone()),
            tracker: AttendanceTracker::new(config.attendance.clone()),
            config,
            templates: Vec::new(),
            started_at: None,
            last_marked: HashMap::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag another thread can raise to abandon the cycle in progress.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_scanning(&self) -> bool {
        self.started_at.is_some()
    }

    /// Load the gallery and begin scanning. A gallery fault is fatal here.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        if self.is_scanning() {
            return Ok(());
        }
        self.reload_gallery().map_err(SessionError::GalleryUnavailable)?;
        self.cancel.store(false, Ordering::SeqCst);
        self.voting.start();
        self.last_marked.clear();
        self.started_at = Some(now);
        tracing::info!(enrolled = self.templates.len(), "scanning started");
        Ok(())
    }

    /// Return to idle, dropping votes, recognition state and debounce timestamps.
    pub fn stop(&mut self) {
        if self.started_at.take().is_some() {
            tracing::info!("scanning stopped");
        }
        self.voting.stop();
        self.last_marked.clear();
    }

    /// Process one frame. Per-frame faults are absorbed into the event.
    pub fn cycle(&mut self, frame: &RgbImage, now: DateTime<Utc>) -> Result<CycleEvent, SessionError> {
        let Some(started_at) = self.started_at else {
            return Err(SessionError::NotScanning);
        };
        self.check_cancelled()?;
        self.check_timeout_from(started_at, now)?;

        let mut event = CycleEvent::idle(now);
        let mut faces = match self.detector.detect(frame, self.config.verify_confidence) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed, skipping frame");
                event.decision = self.voting.absent(now);
                return Ok(event);
            }
        };
        faces.truncate(self.config.max_faces);

        for face in &faces {
            let outcome = self.classify_face(frame, face);
            self.check_cancelled()?;
            event.outcomes.push(outcome);
        }
        event.faces = faces;

        event.vote = best_face_vote(&event.outcomes);
        event.decision = match &event.vote {
            Some(vote) => self.voting.push(vote.clone(), now),
            None => self.voting.absent(now),
        };

        if let Decision::Confirmed { employee_id } = &event.decision {
            event.attendance = self.mark_debounced(employee_id, now);
        }

        tracing::debug!(
            faces = event.faces.len(),
            vote = ?event.vote,
            decision = ?event.decision,
            "cycle complete"
        );
        Ok(event)
    }

    /// Stop the session if it has outlived its timeout. Callers that skip
    /// `cycle` (for example on a capture fault) still need this check.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> Result<(), SessionError> {
        match self.started_at {
            Some(started_at) => self.check_timeout_from(started_at, now),
            None => Ok(()),
        }
    }

    fn check_timeout_from(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), SessionError> {
        if now - started_at >= self.config.timeout {
            let secs = self.config.timeout.num_seconds();
            tracing::warn!(timeout_secs = secs, "scanning session timed out");
            self.stop();
            return Err(SessionError::TimedOut(secs));
        }
        Ok(())
    }

    /// Detect the largest face at the enrollment threshold and embed it.
    pub fn capture_sample(&mut self, frame: &RgbImage) -> Result<Vec<f32>, SessionError> {
        let faces = self.detector.detect(frame, self.config.enroll_confidence)?;
        let face = faces.first().ok_or(SessionError::NoFace)?;
        let crop = recognizer::crop_face(frame, face).ok_or(SessionError::NoFace)?;
        Ok(self.embedder.embed(&crop)?)
    }

    /// Register a new identity from raw samples and refresh the cached gallery.
    pub fn register_identity(
        &mut self,
        employee_id: &str,
        name: &str,
        samples: &[Vec<f32>],
    ) -> Result<EmployeeTemplate, RegistrationError> {
        let template = enroll::register_identity(
            &mut self.gallery,
            employee_id,
            name,
            samples,
            &self.config.registration,
        )?;
        if let Err(e) = self.reload_gallery() {
            tracing::warn!(error = %e, "gallery reload after registration failed");
        }
        Ok(template)
    }

    pub fn remove_employee(&mut self, employee_id: &str) -> Result<bool, StorageError> {
        let removed = self.gallery.remove(employee_id)?;
        self.reload_gallery()?;
        if removed {
            tracing::info!(employee_id, "employee removed");
        }
        Ok(removed)
    }

    pub fn reload_gallery(&mut self) -> Result<(), StorageError> {
        self.templates = self.gallery.all()?;
        tracing::debug!(enrolled = self.templates.len(), "gallery loaded");
        Ok(())
    }

    pub fn employees(&self) -> Result<Vec<EmployeeTemplate>, StorageError> {
        self.gallery.all()
    }

    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<AttendanceSession>, StorageError> {
        self.store.recent(limit)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            scanning: self.is_scanning(),
            started_at: self.started_at,
            state: self.voting.state().clone(),
            recognition: self.voting.recognition().clone(),
            enrolled: self.templates.len(),
        }
    }

    fn classify_face(&mut self, frame: &RgbImage, face: &FaceBox) -> FaceOutcome {
        let Some(crop) = recognizer::crop_face(frame, face) else {
            return FaceOutcome::Invalid {
                error: "face box outside frame".into(),
            };
        };
        match self.embedder.embed(&crop) {
            Ok(raw) => self.matcher.classify(&raw, &self.templates),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed, face discarded");
                FaceOutcome::Invalid {
                    error: e.to_string(),
                }
            }
        }
    }

    fn mark_debounced(&mut self, employee_id: &str, now: DateTime<Utc>) -> Option<AttendanceResult> {
        if let Some(last) = self.last_marked.get(employee_id) {
            if now - *last < self.config.debounce {
                tracing::debug!(employee_id, "attendance debounced");
                return None;
            }
        }
        let name = self
            .templates
            .iter()
            .find(|t| t.employee_id == employee_id)
            .map(|t| t.name.clone())
            .unwrap_or_default();
        self.last_marked.insert(employee_id.to_string(), now);
        Some(
            self.tracker
                .mark_attendance(&mut self.store, employee_id, &name, now),
        )
    }

    fn check_cancelled(&mut self) -> Result<(), SessionError> {
        if self.cancel.load(Ordering::SeqCst) {
            self.stop();
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }
}

/// The cycle's vote comes from the largest face that produced a usable
/// embedding. Faces arrive largest first.
fn best_face_vote(outcomes: &[FaceOutcome]) -> Option<Vote> {
    outcomes.iter().find_map(|outcome| match outcome {
        FaceOutcome::Matched(m) => Some(Vote::Identity(m.employee_id.clone())),
        FaceOutcome::Rejected { .. } => Some(Vote::Unknown),
        FaceOutcome::Invalid { .. } => None,
    })
}
