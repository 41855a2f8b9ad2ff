//! Terminal output: a run spinner and colored reports.
//!
//! Uses `indicatif` for the spinner and `console` for styling, as
//! [`RunProgress`] and [`Printer`] do below.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use concierge::events::{Event, EventKind, RunSummary};
use concierge::executor::RunOutcome;
use concierge::matcher::Candidate;
use concierge::orchestrator::{DecisionOutcome, JobReport, PlanOutcome};
use concierge::registry::Recipe;
use concierge::state_machine::{AuditRecord, JobStatus};

/// Spinner shown while a plan executes.
pub struct RunProgress {
    pb: ProgressBar,
}

impl RunProgress {
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("RUNNING: {job_id}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    pub fn finish(self) {
        self.pb.finish_and_clear();
    }
}

/// Styled printing for every command's result.
pub struct Printer {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for Printer {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }
}

impl Printer {
    fn status_style(&self, status: JobStatus) -> &Style {
        match status {
            JobStatus::Completed | JobStatus::Approved => &self.green,
            JobStatus::Failed | JobStatus::Halted => &self.red,
            _ => &self.yellow,
        }
    }

    pub fn job_created(&self, job_id: &str, description: &str) {
        println!("  {} Created {job_id}", self.green.apply_to("✓"));
        println!("    {}", self.dim.apply_to(description));
    }

    pub fn plan(&self, outcome: &PlanOutcome) {
        let plan = &outcome.plan;
        println!(
            "  {} Planned {} v{} (confidence {:.2}, threshold {:.2})",
            self.green.apply_to("✓"),
            plan.recipe_id,
            plan.recipe_version,
            plan.confidence,
            plan.threshold
        );
        println!("    plan: {}", plan.id);
        for (index, step) in plan.steps.iter().enumerate() {
            println!(
                "    {}. {} → {}",
                index + 1,
                step.id,
                self.dim.apply_to(&step.worker)
            );
        }
        let r = &plan.resources;
        println!(
            "    resources: {} cpu, {} MB memory, {} MB disk{}",
            r.total_cpu_cores,
            r.total_memory_mb,
            r.total_disk_mb,
            if r.gpu_required { ", gpu" } else { "" }
        );
        if outcome.auto_approved {
            println!("  {} Auto-approved", self.green.apply_to("✓"));
        } else {
            println!(
                "  {} Awaiting approval",
                self.status_style(outcome.status).apply_to(outcome.status)
            );
        }
    }

    pub fn ambiguous(&self, candidates: &[Candidate]) {
        println!("  {} Ambiguous match; use --pick or --force:", self.yellow.apply_to("?"));
        for c in candidates {
            println!("    {} v{} ({:.2})", c.recipe_id, c.version, c.score);
        }
    }

    pub fn decision(&self, outcome: &DecisionOutcome) {
        println!(
            "  {} Recorded {} by {} for {}",
            self.green.apply_to("✓"),
            outcome.approval.decision,
            outcome.approval.approver,
            outcome.approval.plan_id
        );
        println!(
            "    job is {}",
            self.status_style(outcome.status).apply_to(outcome.status)
        );
    }

    pub fn run(&self, outcome: &RunOutcome) {
        match outcome.status {
            JobStatus::Completed => {
                println!("  {} Job completed ({})", self.green.apply_to("✓"), outcome.run.id);
            }
            JobStatus::Halted => {
                println!("  {} Job halted ({})", self.yellow.apply_to("■"), outcome.run.id);
            }
            status => {
                let reason = outcome
                    .failure
                    .as_ref()
                    .map(|f| format!("{f} [{}]", f.kind()))
                    .unwrap_or_else(|| status.to_string());
                println!("  {} Job failed: {reason}", self.red.apply_to("✗"));
            }
        }
    }

    pub fn report(&self, report: &JobReport) {
        let audit = &report.audit;
        println!(
            "{}",
            self.status_style(audit.status)
                .apply_to(format!("─── {} ───", audit.job_id))
        );
        println!(
            "{}",
            serde_json::to_string_pretty(report).unwrap_or_default()
        );
    }

    pub fn jobs(&self, records: &[AuditRecord]) {
        if records.is_empty() {
            println!("  {}", self.dim.apply_to("no jobs"));
            return;
        }
        for record in records {
            println!(
                "  {:<42} {:<10} {}",
                record.job_id,
                self.status_style(record.status).apply_to(record.status),
                record.description
            );
        }
    }

    pub fn events<'a>(&self, events: impl IntoIterator<Item = &'a Event>) {
        for event in events {
            let style = match event.kind {
                EventKind::JobFailed | EventKind::StepFailed => &self.red,
                EventKind::JobCompleted | EventKind::StepCompleted => &self.green,
                EventKind::JobHalted => &self.yellow,
                _ => &self.dim,
            };
            println!(
                "  {} {:<15} {:<12} {}",
                event.timestamp.format("%H:%M:%S%.3f"),
                style.apply_to(event.kind),
                event.step_id.as_deref().unwrap_or("-"),
                event.payload
            );
        }
    }

    pub fn summary(&self, summary: &RunSummary) {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).unwrap_or_default()
        );
    }

    pub fn recipes<'a>(&self, recipes: impl IntoIterator<Item = &'a Recipe>) {
        for recipe in recipes {
            println!(
                "  {:<28} v{:<8} {}",
                recipe.id,
                recipe.version,
                self.dim.apply_to(&recipe.title)
            );
        }
    }

    pub fn installed(&self, path: &std::path::Path) {
        println!("  {} Installed {}", self.green.apply_to("✓"), path.display());
    }
}
