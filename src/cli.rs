//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--workspace`, `--verbose`) and one
//! [`Command`] per job operation.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Supervised job orchestration: match a request to a recipe, approve the
/// plan, run it with a full audit trail.
#[derive(Debug, Parser)]
#[command(name = "concierge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Workspace directory. Defaults to $CONCIERGE_WORKSPACE, then the
    /// current directory.
    #[arg(long, short, global = true)]
    pub workspace: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a job from a natural-language request.
    New {
        /// What needs to be done.
        request: String,

        /// Known input as NAME=VALUE; VALUE is parsed as JSON when possible.
        #[arg(long = "input", short, value_parser = parse_input)]
        inputs: Vec<(String, serde_json::Value)>,

        /// Only consider recipes in this category.
        #[arg(long)]
        category: Option<String>,
    },

    /// Match a job to a recipe and attach the plan.
    Plan {
        job_id: String,

        /// Choose this recipe among the qualifying candidates.
        #[arg(long, conflicts_with = "force")]
        pick: Option<String>,

        /// Take the best candidate even when the match is ambiguous.
        #[arg(long)]
        force: bool,
    },

    /// Grant approval for a job's plan.
    Approve(DecisionArgs),

    /// Deny approval for a job's plan.
    Deny(DecisionArgs),

    /// Execute an approved job.
    Run { job_id: String },

    /// Halt a job. Running jobs stop at the next step boundary.
    Halt {
        job_id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Show one job, or list all jobs.
    Status { job_id: Option<String> },

    /// Show the events of a job's run.
    Logs {
        job_id: String,

        /// Run to show; defaults to the most recent.
        #[arg(long)]
        run: Option<String>,

        /// Only events of this kind, e.g. step.failed.
        #[arg(long)]
        kind: Option<String>,

        /// Only events of this step.
        #[arg(long)]
        step: Option<String>,

        /// Only the last N events.
        #[arg(long)]
        tail: Option<usize>,

        /// Print a run summary instead of events.
        #[arg(long)]
        summary: bool,
    },

    /// Manage the recipe registry.
    #[command(subcommand)]
    Recipes(RecipesCommand),
}

#[derive(Debug, Args)]
pub struct DecisionArgs {
    pub job_id: String,

    #[arg(long)]
    pub note: Option<String>,

    /// Name recorded with the decision.
    #[arg(long)]
    pub approver: Option<String>,

    /// Plan to decide on; defaults to the current plan.
    #[arg(long)]
    pub plan: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum RecipesCommand {
    /// List published recipes.
    List {
        #[arg(long)]
        category: Option<String>,
    },

    /// Validate a recipe file and install it into the workspace.
    Add { file: PathBuf },

    /// Find recipes by category, verb or keyword.
    Search {
        #[arg(long)]
        category: Option<String>,

        #[arg(long = "verb")]
        verbs: Vec<String>,

        #[arg(long = "keyword")]
        keywords: Vec<String>,
    },
}

fn parse_input(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw}"))?;
    if name.is_empty() {
        return Err(format!("input name must not be empty: {raw}"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}
