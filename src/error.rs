use thiserror::Error;

use crate::matcher::Candidate;
use crate::state_machine::JobStatus;

pub type Result<T> = std::result::Result<T, ConciergeError>;

#[derive(Debug, Error)]
pub enum ConciergeError {
    #[error("Invalid transition: job is {from}, cannot move to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Ambiguous match between {}; re-specify or pick a recipe explicitly", format_candidates(.candidates))]
    AmbiguousMatch { candidates: Vec<Candidate> },

    #[error("No recipe matched the requirement")]
    NoMatch,

    #[error("Job {0} is already running")]
    AlreadyRunning(String),

    #[error("Recipe {recipe_id} needs inputs that were not supplied: {}", .missing.join(", "))]
    UnresolvedInputs {
        recipe_id: String,
        missing: Vec<String>,
    },

    #[error("Invalid recipe {recipe_id}: {}", .problems.join("; "))]
    InvalidRecipe {
        recipe_id: String,
        problems: Vec<String>,
    },

    #[error("Recipe already published: {id} v{version}")]
    RecipeExists { id: String, version: String },

    #[error("Recipe not found: {0}")]
    RecipeNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Plan {0} does not match its recorded hash")]
    PlanTampered(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),
}

fn format_candidates(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(|c| format!("{} ({:.2})", c.recipe_id, c.score))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Classifies a step failure for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The recipe or its data was wrong (missing input, worker rejected the work).
    Business,
    /// The environment failed (unknown or disabled worker, timeout).
    System,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business => write!(f, "Business"),
            FailureKind::System => write!(f, "System"),
        }
    }
}

/// Reason a single pipeline step failed. Recorded in the event log and
/// never returned to the caller of `execute`.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum StepError {
    #[error("Step {step_id}: input not found in context: {input}")]
    MissingInput { step_id: String, input: String },

    #[error("Step {step_id}: unknown worker: {worker_id}")]
    UnknownWorker { step_id: String, worker_id: String },

    #[error("Step {step_id}: worker {worker_id} is disabled")]
    WorkerDisabled { step_id: String, worker_id: String },

    #[error("Step {step_id}: worker {worker_id} failed: {message}")]
    WorkerFailure {
        step_id: String,
        worker_id: String,
        message: String,
    },

    #[error("Step {step_id}: worker {worker_id} timed out after {timeout_ms}ms")]
    WorkerTimeout {
        step_id: String,
        worker_id: String,
        timeout_ms: u64,
    },
}

impl StepError {
    pub fn step_id(&self) -> &str {
        match self {
            StepError::MissingInput { step_id, .. }
            | StepError::UnknownWorker { step_id, .. }
            | StepError::WorkerDisabled { step_id, .. }
            | StepError::WorkerFailure { step_id, .. }
            | StepError::WorkerTimeout { step_id, .. } => step_id,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::MissingInput { .. } | StepError::WorkerFailure { .. } => {
                FailureKind::Business
            }
            StepError::UnknownWorker { .. }
            | StepError::WorkerDisabled { .. }
            | StepError::WorkerTimeout { .. } => FailureKind::System,
        }
    }
}

/// Error reported by a worker capability.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
