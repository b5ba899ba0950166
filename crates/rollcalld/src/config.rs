use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::TimeDelta;
use rollcall_core::attendance::{AttendanceConfig, DEFAULT_MIN_SESSION_GAP_SECS};
use rollcall_core::embedding::DEFAULT_STABILITY_THRESHOLD;
use rollcall_core::enroll::{RegistrationConfig, DEFAULT_MIN_SAMPLES};
use rollcall_core::matcher::{MatcherConfig, DEFAULT_MARGIN_THRESHOLD, DEFAULT_SIMILARITY_THRESHOLD};
use rollcall_core::postprocess::{
    PostprocessConfig, DEFAULT_INPUT_SIZE, DEFAULT_IOU_THRESHOLD, DEFAULT_MIN_BOX_SIZE,
    DEFAULT_PADDING, ENROLL_CONFIDENCE_THRESHOLD, VERIFY_CONFIDENCE_THRESHOLD,
};
use rollcall_core::recognizer::DEFAULT_EMBEDDING_DIM;
use rollcall_core::session::{
    SessionConfig, DEFAULT_DEBOUNCE_SECS, DEFAULT_MAX_FACES, DEFAULT_SESSION_TIMEOUT_SECS,
};
use rollcall_core::voting::{
    VotingConfig, DEFAULT_PROTECT_SECS, DEFAULT_UNKNOWN_STREAK, DEFAULT_VOTES_TO_CONFIRM,
    DEFAULT_WINDOW,
};

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Image file the camera application keeps overwriting with the latest frame.
    pub snapshot_path: PathBuf,
    /// Connect to the system bus instead of the session bus.
    pub system_bus: bool,
    /// Begin scanning as soon as the daemon is up.
    pub autostart: bool,
    /// Milliseconds between scan cycles.
    pub scan_interval_ms: u64,
    /// Frames captured from the snapshot when enrolling without image files.
    pub frames_per_enroll: usize,
    /// Delay between enrollment captures, so the snapshot can change.
    pub enroll_capture_delay_ms: u64,
    pub embedding_dim: usize,
    pub input_size: usize,
    pub verify_confidence: f32,
    pub enroll_confidence: f32,
    pub iou_threshold: f32,
    pub min_box_size: f32,
    pub padding: f32,
    pub similarity_threshold: f32,
    pub margin_threshold: f32,
    pub stability_threshold: f32,
    pub min_samples: usize,
    pub vote_window: usize,
    pub votes_to_confirm: usize,
    pub unknown_streak: usize,
    pub max_faces: usize,
    pub protect_secs: u64,
    pub debounce_secs: u64,
    pub session_timeout_secs: u64,
    pub min_session_gap_secs: u64,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let snapshot_path = std::env::var("ROLLCALL_SNAPSHOT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("snapshot.jpg"));

        Self {
            model_dir,
            db_path,
            snapshot_path,
            system_bus: env_flag("ROLLCALL_SYSTEM_BUS", false),
            autostart: env_flag("ROLLCALL_AUTOSTART", false),
            scan_interval_ms: env_u64("ROLLCALL_SCAN_INTERVAL_MS", 500),
            frames_per_enroll: env_usize("ROLLCALL_FRAMES_PER_ENROLL", 5),
            enroll_capture_delay_ms: env_u64("ROLLCALL_ENROLL_CAPTURE_DELAY_MS", 300),
            embedding_dim: env_usize("ROLLCALL_EMBEDDING_DIM", DEFAULT_EMBEDDING_DIM),
            input_size: env_usize("ROLLCALL_INPUT_SIZE", DEFAULT_INPUT_SIZE),
            verify_confidence: env_f32("ROLLCALL_VERIFY_CONFIDENCE", VERIFY_CONFIDENCE_THRESHOLD),
            enroll_confidence: env_f32("ROLLCALL_ENROLL_CONFIDENCE", ENROLL_CONFIDENCE_THRESHOLD),
            iou_threshold: env_f32("ROLLCALL_IOU_THRESHOLD", DEFAULT_IOU_THRESHOLD),
            min_box_size: env_f32("ROLLCALL_MIN_BOX_SIZE", DEFAULT_MIN_BOX_SIZE),
            padding: env_f32("ROLLCALL_BOX_PADDING", DEFAULT_PADDING),
            similarity_threshold: env_f32("ROLLCALL_SIMILARITY_THRESHOLD", DEFAULT_SIMILARITY_THRESHOLD),
            margin_threshold: env_f32("ROLLCALL_MARGIN_THRESHOLD", DEFAULT_MARGIN_THRESHOLD),
            stability_threshold: env_f32("ROLLCALL_STABILITY_THRESHOLD", DEFAULT_STABILITY_THRESHOLD),
            min_samples: env_usize("ROLLCALL_MIN_SAMPLES", DEFAULT_MIN_SAMPLES),
            vote_window: env_usize("ROLLCALL_VOTE_WINDOW", DEFAULT_WINDOW),
            votes_to_confirm: env_usize("ROLLCALL_VOTES_TO_CONFIRM", DEFAULT_VOTES_TO_CONFIRM),
            unknown_streak: env_usize("ROLLCALL_UNKNOWN_STREAK", DEFAULT_UNKNOWN_STREAK),
            max_faces: env_usize("ROLLCALL_MAX_FACES", DEFAULT_MAX_FACES),
            protect_secs: env_u64("ROLLCALL_PROTECT_SECS", DEFAULT_PROTECT_SECS as u64),
            debounce_secs: env_u64("ROLLCALL_DEBOUNCE_SECS", DEFAULT_DEBOUNCE_SECS as u64),
            session_timeout_secs: env_u64(
                "ROLLCALL_SESSION_TIMEOUT_SECS",
                DEFAULT_SESSION_TIMEOUT_SECS as u64,
            ),
            min_session_gap_secs: env_u64(
                "ROLLCALL_MIN_SESSION_GAP_SECS",
                DEFAULT_MIN_SESSION_GAP_SECS as u64,
            ),
        }
        .sanitized()
    }

    /// Pull out-of-range values back to the nearest usable setting.
    fn sanitized(mut self) -> Self {
        self.vote_window = at_least("ROLLCALL_VOTE_WINDOW", self.vote_window, 1);
        self.votes_to_confirm = clamp_usize(
            "ROLLCALL_VOTES_TO_CONFIRM",
            self.votes_to_confirm,
            1,
            self.vote_window,
        );
        self.unknown_streak = at_least("ROLLCALL_UNKNOWN_STREAK", self.unknown_streak, 1);
        self.max_faces = at_least("ROLLCALL_MAX_FACES", self.max_faces, 1);
        self.min_samples = at_least("ROLLCALL_MIN_SAMPLES", self.min_samples, 1);
        self.frames_per_enroll = at_least("ROLLCALL_FRAMES_PER_ENROLL", self.frames_per_enroll, 1);
        self.embedding_dim = at_least("ROLLCALL_EMBEDDING_DIM", self.embedding_dim, 1);
        self.input_size = at_least("ROLLCALL_INPUT_SIZE", self.input_size, 32);
        self.verify_confidence = clamp_f32("ROLLCALL_VERIFY_CONFIDENCE", self.verify_confidence, 0.0, 1.0);
        self.enroll_confidence = clamp_f32("ROLLCALL_ENROLL_CONFIDENCE", self.enroll_confidence, 0.0, 1.0);
        self.iou_threshold = clamp_f32("ROLLCALL_IOU_THRESHOLD", self.iou_threshold, 0.0, 1.0);
        self.min_box_size = clamp_f32("ROLLCALL_MIN_BOX_SIZE", self.min_box_size, 0.0, f32::MAX);
        self.padding = clamp_f32("ROLLCALL_BOX_PADDING", self.padding, 0.0, 1.0);
        self.similarity_threshold =
            clamp_f32("ROLLCALL_SIMILARITY_THRESHOLD", self.similarity_threshold, -1.0, 1.0);
        self.margin_threshold = clamp_f32("ROLLCALL_MARGIN_THRESHOLD", self.margin_threshold, 0.0, 2.0);
        self.stability_threshold =
            clamp_f32("ROLLCALL_STABILITY_THRESHOLD", self.stability_threshold, -1.0, 1.0);
        self
    }

    /// Path to the YOLOv8-face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("yolov8n-face.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the MobileFaceNet embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("mobilefacenet.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn postprocess_config(&self) -> PostprocessConfig {
        PostprocessConfig {
            input_size: self.input_size,
            confidence_threshold: self.verify_confidence,
            iou_threshold: self.iou_threshold,
            min_box_size: self.min_box_size,
            padding: self.padding,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_faces: self.max_faces,
            debounce: secs(self.debounce_secs),
            timeout: secs(self.session_timeout_secs),
            verify_confidence: self.verify_confidence,
            enroll_confidence: self.enroll_confidence,
            matcher: MatcherConfig {
                similarity_threshold: self.similarity_threshold,
                margin_threshold: self.margin_threshold,
            },
            voting: VotingConfig {
                window: self.vote_window,
                votes_to_confirm: self.votes_to_confirm,
                unknown_streak: self.unknown_streak,
                protect_for: secs(self.protect_secs),
            },
            attendance: AttendanceConfig {
                min_session_gap: secs(self.min_session_gap_secs),
            },
            registration: RegistrationConfig {
                stability_threshold: self.stability_threshold,
                min_samples: self.min_samples,
                expected_dim: Some(self.embedding_dim),
            },
        }
    }
}

/// Upper bound for configured durations, keeps timestamp arithmetic in range.
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn secs(value: u64) -> TimeDelta {
    TimeDelta::seconds(value.min(MAX_DURATION_SECS) as i64)
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_parse(key, default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parse(key, default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_parse(key, default)
}

/// Parse `key` if set; an unparsable value logs and falls back to `default`.
fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "invalid config value, using default");
            default
        }
    }
}

fn at_least(key: &str, value: usize, min: usize) -> usize {
    clamp_usize(key, value, min, usize::MAX)
}

fn clamp_usize(key: &str, value: usize, min: usize, max: usize) -> usize {
    let clamped = value.clamp(min, max.max(min));
    if clamped != value {
        tracing::warn!(key, value, clamped, "config value out of range");
    }
    clamped
}

fn clamp_f32(key: &str, value: f32, min: f32, max: f32) -> f32 {
    let clamped = if value.is_nan() { min } else { value.clamp(min, max) };
    if clamped != value {
        tracing::warn!(key, value, clamped, "config value out of range");
    }
    clamped
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_carries_defaults() {
        let config = Config::from_env();
        let session = config.session_config();
        assert_eq!(session.voting.window, config.vote_window);
        assert_eq!(session.registration.expected_dim, Some(config.embedding_dim));
        assert_eq!(session.debounce, TimeDelta::seconds(config.debounce_secs as i64));
        assert_eq!(config.postprocess_config().input_size, config.input_size);
    }

    #[test]
    fn test_votes_to_confirm_bounded_by_window() {
        let mut config = Config::from_env();
        config.vote_window = 5;
        config.votes_to_confirm = 0;
        assert_eq!(config.clone().sanitized().votes_to_confirm, 1);
        config.votes_to_confirm = 9;
        assert_eq!(config.clone().sanitized().votes_to_confirm, 5);
        config.vote_window = 0;
        let fixed = config.sanitized();
        assert_eq!(fixed.vote_window, 1);
        assert_eq!(fixed.votes_to_confirm, 1);
    }

    #[test]
    fn test_thresholds_clamped() {
        let mut config = Config::from_env();
        config.similarity_threshold = 3.0;
        config.verify_confidence = -0.5;
        config.margin_threshold = f32::NAN;
        config.unknown_streak = 0;
        let fixed = config.sanitized();
        assert_eq!(fixed.similarity_threshold, 1.0);
        assert_eq!(fixed.verify_confidence, 0.0);
        assert_eq!(fixed.margin_threshold, 0.0);
        assert_eq!(fixed.unknown_streak, 1);
    }

    #[test]
    fn test_in_range_values_untouched() {
        let config = Config::from_env();
        let fixed = config.clone().sanitized();
        assert_eq!(fixed.votes_to_confirm, config.votes_to_confirm);
        assert_eq!(fixed.similarity_threshold, config.similarity_threshold);
    }

    #[test]
    fn test_unparsable_value_falls_back() {
        std::env::set_var("ROLLCALL_TEST_UNPARSABLE", "five");
        assert_eq!(env_usize("ROLLCALL_TEST_UNPARSABLE", 5), 5);
        std::env::set_var("ROLLCALL_TEST_PARSABLE", " 7 ");
        assert_eq!(env_usize("ROLLCALL_TEST_PARSABLE", 5), 7);
    }

    #[test]
    fn test_secs_saturates() {
        assert!(secs(u64::MAX) > TimeDelta::days(365));
    }
}
