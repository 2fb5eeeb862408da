//! Per-target configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shadow_apply::ConflictPolicy;
use shadow_core::{Result, ShadowError, SourceGuid};

fn default_idle_timeout() -> u64 {
    10
}

fn default_error_timeout() -> u64 {
    60
}

/// Configuration of one replication target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target database identifier, used for thread names and log context.
    pub name: String,

    /// Directory the producer archives journal segments into.
    pub source_directory: PathBuf,

    /// Accept segments from this source only; `None` accepts any source.
    #[serde(default)]
    pub source_guid: Option<SourceGuid>,

    /// Seconds to sleep after a sweep that found no work.
    #[serde(default = "default_idle_timeout")]
    pub apply_idle_timeout_secs: u64,

    /// Seconds to sleep after a sweep that failed.
    #[serde(default = "default_error_timeout")]
    pub apply_error_timeout_secs: u64,

    /// Trace every skip/delete/preserve decision.
    #[serde(default)]
    pub verbose: bool,

    /// Rename replicated segments to `~name` instead of deleting them.
    #[serde(default)]
    pub preserve_segments: bool,

    /// What to do when the received image diverges from local row state.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl TargetConfig {
    /// A config with default timeouts and policies.
    pub fn new(name: impl Into<String>, source_directory: impl Into<PathBuf>) -> Self {
        TargetConfig {
            name: name.into(),
            source_directory: source_directory.into(),
            source_guid: None,
            apply_idle_timeout_secs: default_idle_timeout(),
            apply_error_timeout_secs: default_error_timeout(),
            verbose: false,
            preserve_segments: false,
            conflict_policy: ConflictPolicy::default(),
        }
    }

    /// Restrict the target to one source GUID.
    pub fn with_source_guid(mut self, guid: SourceGuid) -> Self {
        self.source_guid = Some(guid);
        self
    }

    /// Override the idle backoff.
    pub fn with_idle_timeout(mut self, seconds: u64) -> Self {
        self.apply_idle_timeout_secs = seconds;
        self
    }

    /// Override the error backoff.
    pub fn with_error_timeout(mut self, seconds: u64) -> Self {
        self.apply_error_timeout_secs = seconds;
        self
    }

    /// Enable verbose decision tracing.
    pub fn with_verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    /// Enable preserve mode.
    pub fn with_preserve_segments(mut self, on: bool) -> Self {
        self.preserve_segments = on;
        self
    }

    /// Override the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Idle backoff as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_idle_timeout_secs)
    }

    /// Error backoff as a duration.
    pub fn error_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_error_timeout_secs)
    }
}

/// Load a JSON array of target configurations from a file.
pub fn load_targets(path: &Path) -> Result<Vec<TargetConfig>> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| ShadowError::Format(format!("invalid target config {}: {e}", path.display())))
}
