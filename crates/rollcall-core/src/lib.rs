//! rollcall-core: Face attendance matching and decision engine.
//!
//! YOLOv8-face detection and MobileFaceNet embeddings run via ONNX Runtime;
//! everything downstream of the raw tensors (box post-processing, embedding
//! validation, margin-gated matching, temporal voting and the attendance
//! session state machine) is plain Rust over the storage traits in [`store`].

pub mod attendance;
pub mod detector;
pub mod embedding;
pub mod enroll;
pub mod matcher;
pub mod postprocess;
pub mod recognizer;
pub mod session;
pub mod store;
pub mod types;
pub mod voting;

pub use attendance::{AttendanceConfig, AttendanceResult, AttendanceTracker};
pub use detector::{Detector, DetectorError, YoloFaceDetector};
pub use embedding::EmbeddingError;
pub use enroll::{RegistrationConfig, RegistrationError};
pub use matcher::{CosineMatcher, Matcher, MatcherConfig};
pub use postprocess::PostprocessConfig;
pub use recognizer::{Embedder, FaceNetEmbedder, RecognizerError};
pub use session::{CycleEvent, ScanSession, SessionConfig, SessionError, SessionStatus, StopReason};
pub use store::{AttendanceSession, AttendanceStore, Gallery, StorageError};
pub use types::{Embedding, EmployeeTemplate, FaceBox, FaceOutcome, MatchResult, RejectReason, Vote};
pub use voting::{Decision, ScanState, VotingConfig, VotingEngine};
