//! Environment-driven configuration.
//!
//! Every knob has a default; unparsable or out-of-range values fall back to
//! it instead of failing startup.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::logging::LogFormat;

const DEFAULT_DEBOUNCE_MS: u64 = 3000;
const DEFAULT_MAX_MEDIA_BYTES: u64 = 20 * 1024 * 1024;
const DEFAULT_MAX_VIDEO_SECS: f64 = 300.0;
const DEFAULT_CLASSIFY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FRAME_PREFETCH: usize = 4;
const DEFAULT_FFMPEG_THREADS: usize = 1;
const DEFAULT_PORT: u16 = 3000;

/// Size and duration ceilings checked before any transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaLimits {
    pub max_size_bytes: u64,
    pub max_duration_secs: f64,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_MEDIA_BYTES,
            max_duration_secs: DEFAULT_MAX_VIDEO_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub debounce: Duration,
    pub limits: MediaLimits,
    pub classify_timeout: Duration,
    /// Frames extracted concurrently ahead of the evaluation cursor.
    ///
    /// Once a frame is flagged, up to `frame_prefetch - 1` later frames may
    /// already have been extracted; none of them is classified. Set to 1 to
    /// extract nothing past the flagged frame.
    pub frame_prefetch: usize,
    pub ffmpeg_threads: usize,
    pub scratch_dir: PathBuf,
    pub classifier_url: Option<String>,
    pub classifier_api_key: Option<String>,
    pub media_base_url: Option<String>,
    pub media_api_token: Option<String>,
    pub local_storage_path: Option<PathBuf>,
    pub action_webhook_url: Option<String>,
    pub database_url: Option<String>,
    pub policy_file: Option<PathBuf>,
    pub port: u16,
    pub log_format: LogFormat,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            limits: MediaLimits::default(),
            classify_timeout: Duration::from_secs(DEFAULT_CLASSIFY_TIMEOUT_SECS),
            frame_prefetch: DEFAULT_FRAME_PREFETCH,
            ffmpeg_threads: DEFAULT_FFMPEG_THREADS,
            scratch_dir: env::temp_dir().join("mediaguard"),
            classifier_url: None,
            classifier_api_key: None,
            media_base_url: None,
            media_api_token: None,
            local_storage_path: None,
            action_webhook_url: None,
            database_url: None,
            policy_file: None,
            port: DEFAULT_PORT,
            log_format: LogFormat::Human,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests don't touch process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let positive = |key: &str, default: u64| {
            parsed(&lookup, key).filter(|v: &u64| *v > 0).unwrap_or(default)
        };

        Self {
            debounce: Duration::from_millis(positive("ALBUM_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)),
            limits: MediaLimits {
                max_size_bytes: positive("MAX_MEDIA_BYTES", DEFAULT_MAX_MEDIA_BYTES),
                max_duration_secs: parsed(&lookup, "MAX_VIDEO_SECS")
                    .filter(|v: &f64| v.is_finite() && *v > 0.0)
                    .unwrap_or(DEFAULT_MAX_VIDEO_SECS),
            },
            classify_timeout: Duration::from_secs(positive(
                "CLASSIFY_TIMEOUT_SECS",
                DEFAULT_CLASSIFY_TIMEOUT_SECS,
            )),
            frame_prefetch: parsed(&lookup, "FRAME_PREFETCH")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(DEFAULT_FRAME_PREFETCH),
            ffmpeg_threads: parsed(&lookup, "FFMPEG_THREADS")
                .filter(|v: &usize| *v > 0)
                .unwrap_or(DEFAULT_FFMPEG_THREADS),
            scratch_dir: non_empty(&lookup, "SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            classifier_url: non_empty(&lookup, "CLASSIFIER_URL"),
            classifier_api_key: non_empty(&lookup, "CLASSIFIER_API_KEY"),
            media_base_url: non_empty(&lookup, "MEDIA_BASE_URL"),
            media_api_token: non_empty(&lookup, "MEDIA_API_TOKEN"),
            local_storage_path: non_empty(&lookup, "LOCAL_STORAGE_PATH").map(PathBuf::from),
            action_webhook_url: non_empty(&lookup, "ACTION_WEBHOOK_URL"),
            database_url: non_empty(&lookup, "DATABASE_URL"),
            policy_file: non_empty(&lookup, "POLICY_FILE").map(PathBuf::from),
            port: parsed(&lookup, "PORT").unwrap_or(DEFAULT_PORT),
            log_format: parsed(&lookup, "LOG_FORMAT").unwrap_or(LogFormat::Human),
            log_level: non_empty(&lookup, "LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    non_empty(lookup, key).and_then(|v| v.parse().ok())
}
