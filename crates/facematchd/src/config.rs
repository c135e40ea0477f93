use facematch_core::{Aggregation, MatcherConfig, DEFAULT_DISTANCE_THRESHOLD};
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Largest Euclidean distance still accepted as a match.
    pub distance_threshold: f32,
    /// How a label's reference distances are combined (`min` or `mean`).
    pub aggregation: Aggregation,
    /// Rebuild the matcher snapshot after every enrollment or removal.
    /// When off, only an explicit rebuild refreshes it.
    pub rebuild_on_enroll: bool,
    /// Capacity of the request channel into the engine thread.
    pub queue_depth: usize,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facematch");

        let db_path = std::env::var("FACEMATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.db"));

        let aggregation = match std::env::var("FACEMATCH_AGGREGATION") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "ignoring FACEMATCH_AGGREGATION");
                Aggregation::default()
            }),
            Err(_) => Aggregation::default(),
        };

        Self {
            db_path,
            distance_threshold: env_f32("FACEMATCH_DISTANCE_THRESHOLD", DEFAULT_DISTANCE_THRESHOLD),
            aggregation,
            rebuild_on_enroll: env_flag("FACEMATCH_REBUILD_ON_ENROLL", true),
            queue_depth: env_usize("FACEMATCH_QUEUE_DEPTH", 16).max(1),
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            threshold: self.distance_threshold,
            aggregation: self.aggregation,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v: &f32| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
