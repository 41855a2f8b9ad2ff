//! Workspace configuration loaded from `concierge.toml`.
//!
//! Every field has a default, so a workspace without the file behaves as if
//! it held an empty one. `CONCIERGE_WORKSPACE` takes precedence over the
//! current directory when locating the workspace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConciergeError, Result};
use crate::matcher::DEFAULT_MIN_TOKEN_LEN;

pub const CONFIG_FILE: &str = "concierge.toml";
pub const WORKSPACE_ENV: &str = "CONCIERGE_WORKSPACE";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConciergeConfig {
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Per-worker overrides keyed by worker id.
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,
}

/// Scoring knobs for the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    #[serde(default = "default_verb_bonus")]
    pub verb_bonus: f64,
    /// Runner-ups closer than this to the top score make the match ambiguous.
    #[serde(default = "default_ambiguity_margin")]
    pub ambiguity_margin: f64,
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
}

fn default_verb_bonus() -> f64 {
    0.2
}

fn default_ambiguity_margin() -> f64 {
    0.1
}

fn default_min_token_len() -> usize {
    DEFAULT_MIN_TOKEN_LEN
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            verb_bonus: default_verb_bonus(),
            ambiguity_margin: default_ambiguity_margin(),
            min_token_len: default_min_token_len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Applies to every worker without its own `timeout_secs`.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Record a system approval for confident plans of recipes that do not
    /// require a human.
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,
    /// Name recorded on approvals when the caller gives none.
    #[serde(default = "default_approver")]
    pub approver: String,
}

fn default_auto_approve_threshold() -> f64 {
    0.95
}

fn default_approver() -> String {
    "user".to_string()
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            auto_approve_threshold: default_auto_approve_threshold(),
            approver: default_approver(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            timeout_secs: None,
        }
    }
}

impl ConciergeConfig {
    /// Load `concierge.toml` from `workspace`, falling back to defaults when
    /// the file does not exist.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = workspace.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: ConciergeConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.matcher.verb_bonus) {
            return Err(ConciergeError::Config(format!(
                "matcher.verb_bonus must be within [0.0, 1.0]: {}",
                self.matcher.verb_bonus
            )));
        }
        if !unit.contains(&self.matcher.ambiguity_margin) {
            return Err(ConciergeError::Config(format!(
                "matcher.ambiguity_margin must be within [0.0, 1.0]: {}",
                self.matcher.ambiguity_margin
            )));
        }
        if !unit.contains(&self.approval.auto_approve_threshold) {
            return Err(ConciergeError::Config(format!(
                "approval.auto_approve_threshold must be within [0.0, 1.0]: {}",
                self.approval.auto_approve_threshold
            )));
        }
        if self.executor.default_timeout_secs == 0 {
            return Err(ConciergeError::Config(
                "executor.default_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some((id, _)) = self.workers.iter().find(|(_, w)| w.timeout_secs == Some(0)) {
            return Err(ConciergeError::Config(format!(
                "workers.{id}.timeout_secs must be positive"
            )));
        }
        Ok(())
    }

    pub fn worker_enabled(&self, worker_id: &str) -> bool {
        self.workers.get(worker_id).is_none_or(|w| w.enabled)
    }

    pub fn worker_timeout(&self, worker_id: &str) -> Duration {
        let secs = self
            .workers
            .get(worker_id)
            .and_then(|w| w.timeout_secs)
            .unwrap_or(self.executor.default_timeout_secs);
        Duration::from_secs(secs)
    }

    /// Workspace directory: explicit argument, then `CONCIERGE_WORKSPACE`,
    /// then the current directory.
    pub fn resolve_workspace(explicit: Option<PathBuf>) -> PathBuf {
        if let Some(path) = explicit {
            return path;
        }
        if let Ok(path) = std::env::var(WORKSPACE_ENV)
            && !path.is_empty()
        {
            return PathBuf::from(path);
        }
        PathBuf::from(".")
    }
}
