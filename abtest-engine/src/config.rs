//! Engine configuration.
//!
//! Resolution order: built-in defaults, then an optional JSON file, then
//! environment overrides:
//!
//! ```text
//! ABTEST_DB_PATH=/var/lib/abtest/experiments.db
//! ABTEST_CONFIDENCE=0.99
//! ABTEST_SWEEP_INTERVAL=600      # seconds between expiry sweeps
//! ABTEST_BRANCH=release
//! ABTEST_REPO=/srv/site
//! ```
//!
//! Unparseable numeric overrides are ignored with a warning.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, EngineResult};
use crate::experiment::CreationDefaults;

const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "experiments.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub default_confidence_threshold: f64,
    pub default_duration_days: u32,
    pub min_duration_days: u32,
    pub max_duration_days: u32,
    /// Analyze only the most recent N samples
    pub max_analysis_samples: Option<usize>,
    pub sweep_interval_secs: u64,
    pub default_branch: String,
    /// Git working tree winners are committed into
    pub repo_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let defaults = CreationDefaults::default();
        Self {
            db_path: abtest_dir().map_or_else(|| PathBuf::from(DB_FILE), |dir| dir.join(DB_FILE)),
            default_confidence_threshold: defaults.confidence_threshold,
            default_duration_days: defaults.duration_days,
            min_duration_days: defaults.min_duration_days,
            max_duration_days: defaults.max_duration_days,
            max_analysis_samples: None,
            sweep_interval_secs: 3600,
            default_branch: "main".to_string(),
            repo_path: PathBuf::from("."),
        }
    }
}

/// `~/.abtest`, if a home directory exists
pub fn abtest_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".abtest"))
}

impl EngineConfig {
    /// Load configuration from `path`, or from `~/.abtest/config.json` when it
    /// exists, then apply environment overrides.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file is not.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match abtest_dir().map(|dir| dir.join(CONFIG_FILE)) {
                Some(default_path) if default_path.exists() => Self::from_file(&default_path)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_value("config", format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            EngineError::invalid_value("config", format!("cannot parse {}: {e}", path.display()))
        })
    }

    /// Apply `ABTEST_*` environment overrides in place
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("ABTEST_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(confidence) = parse_env::<f64>("ABTEST_CONFIDENCE") {
            self.default_confidence_threshold = confidence;
        }
        if let Some(interval) = parse_env::<u64>("ABTEST_SWEEP_INTERVAL") {
            self.sweep_interval_secs = interval;
        }
        if let Ok(branch) = std::env::var("ABTEST_BRANCH") {
            if !branch.trim().is_empty() {
                self.default_branch = branch;
            }
        }
        if let Ok(repo) = std::env::var("ABTEST_REPO") {
            self.repo_path = PathBuf::from(repo);
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let threshold = self.default_confidence_threshold;
        if !(threshold > 0.0 && threshold < 1.0) {
            return Err(EngineError::invalid_value(
                "default_confidence_threshold",
                format!("{threshold} is not in (0, 1)"),
            ));
        }
        if self.min_duration_days == 0 || self.min_duration_days > self.max_duration_days {
            return Err(EngineError::invalid_value(
                "min_duration_days",
                "must be positive and not above max_duration_days",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(EngineError::invalid_value(
                "sweep_interval_secs",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn creation_defaults(&self) -> CreationDefaults {
        CreationDefaults {
            confidence_threshold: self.default_confidence_threshold,
            duration_days: self.default_duration_days,
            min_duration_days: self.min_duration_days,
            max_duration_days: self.max_duration_days,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {name}={raw}: not a valid value");
            None
        }
    }
}
