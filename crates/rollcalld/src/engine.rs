use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use image::RgbImage;
use rollcall_core::{
    AttendanceSession, AttendanceStore, CycleEvent, Detector, DetectorError, Embedder,
    EmployeeTemplate, FaceNetEmbedder, Gallery, RecognizerError, RegistrationError, ScanSession,
    SessionError, SessionStatus, StorageError, YoloFaceDetector,
};
use rollcall_store::{AttendanceDb, GalleryDb, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::capture::{self, CaptureError, FrameSource, SnapshotSource};
use crate::config::Config;

/// Cycle events buffered for slow subscribers before they start lagging.
const EVENT_CAPACITY: usize = 64;
const MIN_TICK_PERIOD: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("database error: {0}")]
    Store(#[from] StoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("no face detected in any enrollment frame")]
    NoFaceDetected,
    #[error("engine thread exited")]
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeSummary {
    pub employee_id: String,
    pub name: String,
    pub templates: usize,
}

/// How enrollment grabs frames when no image files are supplied.
#[derive(Debug, Clone)]
pub struct EnrollOptions {
    pub frames: usize,
    pub capture_delay: Duration,
}

/// Messages sent from D-Bus handlers and the ticker to the engine thread.
enum EngineRequest {
    StartScanning {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    StopScanning {
        reply: oneshot::Sender<()>,
    },
    Tick,
    Enroll {
        employee_id: String,
        name: String,
        image_paths: Vec<PathBuf>,
        reply: oneshot::Sender<Result<EmployeeTemplate, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    ListEmployees {
        reply: oneshot::Sender<Result<Vec<EmployeeSummary>, EngineError>>,
    },
    RemoveEmployee {
        employee_id: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    RecentSessions {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<AttendanceSession>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    events: broadcast::Sender<CycleEvent>,
    in_flight: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn start_scanning(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::StartScanning { reply }).await?
    }

    /// Raise the stop flag so a running cycle bails out, then stop the session.
    pub async fn stop_scanning(&self) -> Result<(), EngineError> {
        self.cancel.store(true, Ordering::SeqCst);
        self.request(|reply| EngineRequest::StopScanning { reply }).await
    }

    /// Enroll from the given image files, or from fresh snapshots if empty.
    pub async fn enroll(
        &self,
        employee_id: String,
        name: String,
        image_paths: Vec<PathBuf>,
    ) -> Result<EmployeeTemplate, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            employee_id,
            name,
            image_paths,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<SessionStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn list_employees(&self) -> Result<Vec<EmployeeSummary>, EngineError> {
        self.request(|reply| EngineRequest::ListEmployees { reply }).await?
    }

    pub async fn remove_employee(&self, employee_id: String) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::RemoveEmployee { employee_id, reply })
            .await?
    }

    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<AttendanceSession>, EngineError> {
        self.request(|reply| EngineRequest::RecentSessions { limit, reply })
            .await?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.events.subscribe()
    }

    /// Queue one scan cycle unless the previous one is still running.
    pub fn tick(&self) -> bool {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.tx.try_send(EngineRequest::Tick).is_err() {
            self.in_flight.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Load models and open the database, then spawn the engine.
///
/// Fails fast at startup if any resource is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector = YoloFaceDetector::load(&config.detector_model_path(), config.postprocess_config())?;
    let embedder = FaceNetEmbedder::load(&config.embedder_model_path(), config.embedding_dim)?;

    let gallery = GalleryDb::open(&config.db_path)?;
    let store = AttendanceDb::open(&config.db_path)?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let source = SnapshotSource::new(&config.snapshot_path);
    tracing::info!(path = %source.path().display(), "frame source: snapshot file");

    let session = ScanSession::new(detector, embedder, gallery, store, config.session_config());
    let enroll = EnrollOptions {
        frames: config.frames_per_enroll,
        capture_delay: Duration::from_millis(config.enroll_capture_delay_ms),
    };
    Ok(spawn(session, source, enroll))
}

/// Run a scan session on a dedicated OS thread.
pub fn spawn<D, E, G, A, S>(
    mut session: ScanSession<D, E, G, A>,
    mut source: S,
    enroll: EnrollOptions,
) -> EngineHandle
where
    D: Detector + Send + 'static,
    E: Embedder + Send + 'static,
    G: Gallery + Send + 'static,
    A: AttendanceStore + Send + 'static,
    S: FrameSource + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let in_flight = Arc::new(AtomicBool::new(false));
    let cancel = session.cancel_flag();

    let thread_events = events.clone();
    let thread_in_flight = Arc::clone(&in_flight);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::StartScanning { reply } => {
                        let result = session.start(Utc::now()).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::StopScanning { reply } => {
                        session.stop();
                        let _ = reply.send(());
                    }
                    EngineRequest::Tick => {
                        let event = run_cycle(&mut session, &mut source);
                        thread_in_flight.store(false, Ordering::Release);
                        if let Some(event) = event {
                            // No subscribers is fine.
                            let _ = thread_events.send(event);
                        }
                    }
                    EngineRequest::Enroll {
                        employee_id,
                        name,
                        image_paths,
                        reply,
                    } => {
                        let result = run_enroll(
                            &mut session,
                            &mut source,
                            &enroll,
                            &employee_id,
                            &name,
                            &image_paths,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(session.status());
                    }
                    EngineRequest::ListEmployees { reply } => {
                        let result = session
                            .employees()
                            .map(|all| {
                                all.into_iter()
                                    .map(|t| EmployeeSummary {
                                        templates: t.embeddings.len(),
                                        employee_id: t.employee_id,
                                        name: t.name,
                                    })
                                    .collect()
                            })
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::RemoveEmployee { employee_id, reply } => {
                        let result = session.remove_employee(&employee_id).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::RecentSessions { limit, reply } => {
                        let result = session.recent_sessions(limit).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle {
        tx,
        events,
        in_flight,
        cancel,
    }
}

/// Drive the engine at a fixed period. Ticks that find a cycle in flight are dropped.
pub async fn run_ticker(engine: EngineHandle, period: Duration) {
    let mut interval = tokio::time::interval(period.max(MIN_TICK_PERIOD));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if engine.is_closed() {
            break;
        }
        if !engine.tick() {
            tracing::trace!("cycle still running, tick skipped");
        }
    }
}

/// One scan cycle. Faults are logged and yield no event; a timeout yields
/// the session's terminal event.
fn run_cycle<D, E, G, A, S>(session: &mut ScanSession<D, E, G, A>, source: &mut S) -> Option<CycleEvent>
where
    D: Detector,
    E: Embedder,
    G: Gallery,
    A: AttendanceStore,
    S: FrameSource,
{
    if !session.is_scanning() {
        return None;
    }
    if let Err(SessionError::TimedOut(secs)) = session.check_timeout(Utc::now()) {
        return Some(timed_out(secs));
    }

    let frame = match source.capture() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "frame capture failed, skipping cycle");
            return None;
        }
    };

    match session.cycle(&frame, Utc::now()) {
        Ok(event) => Some(event),
        Err(SessionError::TimedOut(secs)) => Some(timed_out(secs)),
        Err(SessionError::Cancelled) => {
            tracing::debug!("cycle cancelled");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "cycle failed");
            None
        }
    }
}

fn timed_out(secs: i64) -> CycleEvent {
    tracing::info!(timeout_secs = secs, "scanning stopped by session timeout");
    CycleEvent::timed_out(Utc::now(), secs)
}

fn run_enroll<D, E, G, A, S>(
    session: &mut ScanSession<D, E, G, A>,
    source: &mut S,
    options: &EnrollOptions,
    employee_id: &str,
    name: &str,
    image_paths: &[PathBuf],
) -> Result<EmployeeTemplate, EngineError>
where
    D: Detector,
    E: Embedder,
    G: Gallery,
    A: AttendanceStore,
    S: FrameSource,
{
    let frames: Vec<RgbImage> = if image_paths.is_empty() {
        let mut frames = Vec::with_capacity(options.frames);
        for i in 0..options.frames {
            if i > 0 && !options.capture_delay.is_zero() {
                std::thread::sleep(options.capture_delay);
            }
            frames.push(source.capture()?);
        }
        frames
    } else {
        image_paths
            .iter()
            .map(|p| capture::load_image(p))
            .collect::<Result<_, _>>()?
    };
    tracing::debug!(employee_id, frames = frames.len(), "enroll: frames acquired");

    let mut samples = Vec::with_capacity(frames.len());
    for (i, frame) in frames.iter().enumerate() {
        match session.capture_sample(frame) {
            Ok(sample) => samples.push(sample),
            Err(SessionError::NoFace) => {
                tracing::warn!(employee_id, frame = i, "enroll: no face in frame");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if samples.is_empty() {
        return Err(EngineError::NoFaceDetected);
    }

    Ok(session.register_identity(employee_id, name, &samples)?)
}
