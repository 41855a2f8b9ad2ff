mod cli;
mod ui;

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, DecisionArgs, RecipesCommand};
use concierge::events::EventKind;
use concierge::matcher::Selection;
use concierge::registry::{Recipe, RecipeRegistry};
use concierge::{ConciergeConfig, ConciergeError, DecisionRequest, HaltOutcome, Orchestrator};
use ui::{Printer, RunProgress};

const LOG_ENV: &str = "CONCIERGE_LOG";

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let workspace = ConciergeConfig::resolve_workspace(cli.workspace);
    dispatch(&workspace, cli.command, &Printer::default())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(workspace: &Path, command: Command, printer: &Printer) -> Result<()> {
    let open = || {
        Orchestrator::open(workspace)
            .with_context(|| format!("failed to open workspace {}", workspace.display()))
    };

    match command {
        Command::New {
            request,
            inputs,
            category,
        } => {
            let job = open()?.create_job(&request, inputs.into_iter().collect(), category)?;
            printer.job_created(&job.id, &job.requirement.description);
        }
        Command::Plan {
            job_id,
            pick,
            force,
        } => {
            let selection = match (pick, force) {
                (Some(recipe_id), _) => Selection::Pick(recipe_id),
                (None, true) => Selection::Forced,
                (None, false) => Selection::Strict,
            };
            match open()?.synthesize_plan(&job_id, &selection) {
                Ok(outcome) => printer.plan(&outcome),
                Err(ConciergeError::AmbiguousMatch { candidates }) => {
                    printer.ambiguous(&candidates);
                    bail!("plan not attached: ambiguous match");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Approve(args) => {
            let (job_id, request) = decision(DecisionRequest::grant(), args);
            printer.decision(&open()?.decide(&job_id, request)?);
        }
        Command::Deny(args) => {
            let (job_id, request) = decision(DecisionRequest::deny(), args);
            printer.decision(&open()?.decide(&job_id, request)?);
        }
        Command::Run { job_id } => {
            let orch = open()?;
            let progress = RunProgress::start(&job_id);
            let result = orch.execute(&job_id);
            progress.finish();
            printer.run(&result?);
        }
        Command::Halt { job_id, reason } => match open()?.halt(&job_id, reason)? {
            HaltOutcome::Halted => println!("  {job_id} halted"),
            HaltOutcome::Requested => println!("  {job_id} will halt at the next step boundary"),
        },
        Command::Status { job_id: Some(job_id) } => printer.report(&open()?.status(&job_id)?),
        Command::Status { job_id: None } => printer.jobs(&open()?.list_jobs()?),
        Command::Logs {
            job_id,
            run,
            kind,
            step,
            tail,
            summary,
        } => {
            let events = open()?.run_events(&job_id, run.as_deref())?;
            if summary {
                match events.summary() {
                    Some(summary) => printer.summary(&summary),
                    None => println!("  no events"),
                }
                return Ok(());
            }

            let kind = kind
                .map(|k| k.parse::<EventKind>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let selected: Vec<_> = events
                .all()
                .iter()
                .filter(|e| kind.is_none_or(|k| e.kind == k))
                .filter(|e| step.as_deref().is_none_or(|s| e.step_id.as_deref() == Some(s)))
                .collect();
            let start = tail.map_or(0, |n| selected.len().saturating_sub(n));
            printer.events(selected[start..].iter().copied());
        }
        Command::Recipes(command) => recipes(workspace, command, printer)?,
    }
    Ok(())
}

fn decision(mut request: DecisionRequest, args: DecisionArgs) -> (String, DecisionRequest) {
    request.note = args.note;
    request.approver = args.approver;
    request.plan_id = args.plan;
    (args.job_id, request)
}

fn recipes(workspace: &Path, command: RecipesCommand, printer: &Printer) -> Result<()> {
    let dir = workspace.join("recipes");
    let mut registry = RecipeRegistry::load_dir(&dir)?;

    match command {
        RecipesCommand::List { category } => printer.recipes(registry.list(category.as_deref())),
        RecipesCommand::Add { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let recipe: Recipe = toml::from_str(&text)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let path = registry.install(&dir, recipe)?;
            printer.installed(&path);
        }
        RecipesCommand::Search {
            category,
            verbs,
            keywords,
        } => {
            let verbs: Vec<&str> = verbs.iter().map(String::as_str).collect();
            let keywords: Vec<&str> = keywords.iter().map(String::as_str).collect();
            printer.recipes(registry.search(category.as_deref(), &verbs, &keywords));
        }
    }
    Ok(())
}
