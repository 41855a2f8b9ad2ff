use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::ConciergeConfig;
use crate::error::{ConciergeError, Result};
use crate::events::{EventLog, RunEvents, RunRecord};
use crate::executor::{PipelineExecutor, RunOutcome, WorkerRegistry};
use crate::intent::{KeywordExtractor, RequirementExtractor};
use crate::matcher::{Matcher, Selection};
use crate::plan::Plan;
use crate::registry::RecipeRegistry;
use crate::state_machine::{
    Approval, AuditRecord, Decision, Job, JobStatus, StateMachine, Transition,
};
use crate::store::{FsStore, JobStore};

/// Approver recorded on automatic approvals.
pub const SYSTEM_APPROVER: &str = "system";

/// An approval decision as submitted by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub decision: Decision,
    pub note: Option<String>,
    /// Falls back to the configured approver.
    pub approver: Option<String>,
    /// Falls back to the job's current plan.
    pub plan_id: Option<String>,
}

impl DecisionRequest {
    pub fn grant() -> Self {
        Self::new(Decision::Granted)
    }

    pub fn deny() -> Self {
        Self::new(Decision::Denied)
    }

    fn new(decision: Decision) -> Self {
        Self {
            decision,
            note: None,
            approver: None,
            plan_id: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn by(mut self, approver: impl Into<String>) -> Self {
        self.approver = Some(approver.into());
        self
    }

    pub fn for_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    pub approval: Approval,
    pub transition: Transition,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub status: JobStatus,
    pub auto_approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltOutcome {
    /// The job is now `HALTED`.
    Halted,
    /// The job is running; it halts at the next step boundary.
    Requested,
}

/// Everything known about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub audit: AuditRecord,
    pub job: Job,
    pub plan: Option<Plan>,
    pub runs: Vec<RunRecord>,
}

/// Entry point for every job operation.
///
/// Holds the store, the read-only recipe registry, the worker table and the
/// configuration; nothing is process-global.
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    registry: Arc<RecipeRegistry>,
    workers: WorkerRegistry,
    config: ConciergeConfig,
    extractor: Box<dyn RequirementExtractor>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RecipeRegistry>,
        workers: WorkerRegistry,
        config: ConciergeConfig,
    ) -> Self {
        Self {
            store,
            registry,
            workers,
            config,
            extractor: Box::new(KeywordExtractor),
        }
    }

    /// Filesystem-backed orchestrator for a workspace directory, with the
    /// built-in workers.
    pub fn open(workspace: &Path) -> Result<Self> {
        let config = ConciergeConfig::load(workspace)?;
        let registry = RecipeRegistry::load_dir(&workspace.join("recipes"))?;
        info!(
            workspace = %workspace.display(),
            recipes = registry.len(),
            "Opened workspace"
        );
        Ok(Self::new(
            Arc::new(FsStore::new(workspace)),
            Arc::new(registry),
            WorkerRegistry::builtin(),
            config,
        ))
    }

    pub fn with_extractor(mut self, extractor: impl RequirementExtractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn registry(&self) -> &RecipeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ConciergeConfig {
        &self.config
    }

    /// Distill `raw` into a requirement and persist a `DRAFT` job.
    pub fn create_job(
        &self,
        raw: &str,
        inputs: BTreeMap<String, serde_json::Value>,
        category: Option<String>,
    ) -> Result<Job> {
        let mut requirement = self.extractor.extract(raw);
        if let Some(category) = category {
            requirement = requirement.with_category(category);
        }
        let job = Job::new(requirement, inputs);
        self.store.create_job(&job)?;
        info!(job_id = %job.id, description = %job.requirement.description, "Created job");
        Ok(job)
    }

    /// Match the job against the registry and attach the resulting plan.
    ///
    /// Ambiguity and no-match are returned as errors and leave the job
    /// untouched.
    pub fn synthesize_plan(&self, job_id: &str, selection: &Selection) -> Result<PlanOutcome> {
        let job = self.store.load_job(job_id)?;
        if !matches!(job.status, JobStatus::Draft | JobStatus::Planned) {
            return Err(ConciergeError::InvalidTransition {
                from: job.status,
                to: JobStatus::Planned,
            });
        }

        let plan = Matcher::new(&self.registry, &self.config.matcher).plan(&job, selection)?;
        self.store.save_plan(&plan)?;

        let approval = &self.config.approval;
        let auto_approve = approval.auto_approve
            && !plan.approval_required
            && plan.confidence >= approval.auto_approve_threshold;

        let job = self.store.update_job(job_id, &mut |job| {
            StateMachine::attach_plan(job, &plan)?;
            if auto_approve {
                let grant = Approval::grant(&plan.id, SYSTEM_APPROVER, Some("auto-approved".into()));
                StateMachine::record_decision(job, grant, &plan)?;
            }
            Ok(())
        })?;

        info!(
            job_id,
            plan_id = %plan.id,
            recipe_id = %plan.recipe_id,
            confidence = plan.confidence,
            auto_approve,
            "Plan synthesized"
        );
        Ok(PlanOutcome {
            plan,
            status: job.status,
            auto_approved: auto_approve,
        })
    }

    /// Record an approval decision. Every accepted attempt is appended; only
    /// a grant against the current plan of a `PLANNED` job unlocks it.
    pub fn decide(&self, job_id: &str, request: DecisionRequest) -> Result<DecisionOutcome> {
        let approver = request
            .approver
            .clone()
            .unwrap_or_else(|| self.config.approval.approver.clone());
        let mut recorded = None;

        let job = self.store.update_job(job_id, &mut |job| {
            let from = job.status;
            let refused = ConciergeError::InvalidTransition {
                from,
                to: JobStatus::Approved,
            };
            if !matches!(from, JobStatus::Planned | JobStatus::Approved) {
                return Err(refused);
            }
            let Some(plan_id) = request.plan_id.clone().or_else(|| job.plan_id.clone()) else {
                return Err(refused);
            };

            let plan = self.store.load_plan(&job.id, &plan_id)?;
            let approval = Approval::new(&plan.id, request.decision, &approver, request.note.clone());
            let transition = StateMachine::record_decision(job, approval.clone(), &plan)?;
            recorded = Some((approval, transition));
            Ok(())
        })?;

        let (approval, transition) = recorded.ok_or_else(|| ConciergeError::JobNotFound(job_id.to_string()))?;
        Ok(DecisionOutcome {
            approval,
            transition,
            status: job.status,
        })
    }

    /// Move an approved job to `RUNNING` and execute its current plan to a
    /// terminal state.
    pub fn execute(&self, job_id: &str) -> Result<RunOutcome> {
        let job = self.store.load_job(job_id)?;
        if job.status == JobStatus::Running {
            return Err(ConciergeError::AlreadyRunning(job.id));
        }
        let Some(plan_id) = job.plan_id.clone() else {
            return Err(ConciergeError::InvalidTransition {
                from: job.status,
                to: JobStatus::Running,
            });
        };
        let plan = self.store.load_plan(job_id, &plan_id)?;
        if !plan.verify_hash() {
            return Err(ConciergeError::PlanTampered(plan.id));
        }

        // Refuse before any run artifact exists, then open the log while the
        // job is still untouched so a storage failure leaves it APPROVED.
        StateMachine::check_start(&job)?;
        let run = RunRecord::new(job_id, &plan.id);
        let mut log = EventLog::new(&run.id, job_id, self.store.open_run_log(job_id, &run.id)?);

        self.store.update_job(job_id, &mut |job| {
            if job.plan_id.as_deref() != Some(plan.id.as_str()) && job.status != JobStatus::Running {
                return Err(ConciergeError::InvalidTransition {
                    from: job.status,
                    to: JobStatus::Running,
                });
            }
            StateMachine::start(job).map(|_| ())
        })?;

        info!(job_id, run_id = %run.id, plan_id = %plan.id, "Executing plan");

        PipelineExecutor::new(self.store.as_ref(), &self.workers, &self.config).run(&plan, &mut log, run)
    }

    pub fn halt(&self, job_id: &str, reason: Option<String>) -> Result<HaltOutcome> {
        let mut outcome = HaltOutcome::Halted;
        self.store.update_job(job_id, &mut |job| {
            outcome = match StateMachine::halt(job, reason.clone())? {
                Transition::HaltPending => HaltOutcome::Requested,
                _ => HaltOutcome::Halted,
            };
            Ok(())
        })?;
        info!(job_id, ?outcome, "Halt processed");
        Ok(outcome)
    }

    pub fn status(&self, job_id: &str) -> Result<JobReport> {
        let job = self.store.load_job(job_id)?;
        let plan = match &job.plan_id {
            Some(plan_id) => Some(self.store.load_plan(job_id, plan_id)?),
            None => None,
        };
        Ok(JobReport {
            audit: AuditRecord::from_job(&job),
            runs: self.store.list_runs(job_id)?,
            plan,
            job,
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<AuditRecord>> {
        Ok(self
            .store
            .list_jobs()?
            .iter()
            .map(AuditRecord::from_job)
            .collect())
    }

    /// Events of `run_id`, or of the job's most recent run.
    pub fn run_events(&self, job_id: &str, run_id: Option<&str>) -> Result<RunEvents> {
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => self
                .store
                .list_runs(job_id)?
                .pop()
                .map(|run| run.id)
                .ok_or_else(|| ConciergeError::RunNotFound(format!("no runs for {job_id}")))?,
        };
        Ok(RunEvents::new(self.store.read_run_events(job_id, &run_id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventKind, EventSink};
    use crate::registry::ContractField;
    use crate::store::MemoryStore;
    use crate::test_support::recipe;
    use serde_json::json;

    fn orchestrator_with(config: ConciergeConfig, approval_required: bool) -> Orchestrator {
        let mut registry = RecipeRegistry::new();
        let mut echo = recipe("text.echo", "1.0.0", &["echo"], &["message", "text"], 0.5);
        echo.approval_required = approval_required;
        echo.inputs = vec![ContractField {
            name: "message".into(),
            kind: Default::default(),
            description: String::new(),
            required: true,
            default: None,
        }];
        echo.steps[0].inputs = vec!["message".into()];
        registry.publish(echo).unwrap();

        Orchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(registry),
            WorkerRegistry::builtin(),
            config,
        )
    }

    fn orchestrator() -> Orchestrator {
        orchestrator_with(ConciergeConfig::default(), true)
    }

    fn inputs() -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([("message".to_string(), json!("hello"))])
    }

    #[test]
    fn full_lifecycle() {
        let orch = orchestrator();
        let job = orch.create_job("Echo the message text", inputs(), None).unwrap();
        assert_eq!(job.status, JobStatus::Draft);

        let planned = orch.synthesize_plan(&job.id, &Selection::Strict).unwrap();
        assert_eq!(planned.status, JobStatus::Planned);
        assert!(!planned.auto_approved);
        assert_eq!(planned.plan.recipe_id, "text.echo");

        let decided = orch.decide(&job.id, DecisionRequest::grant().by("ops")).unwrap();
        assert_eq!(decided.status, JobStatus::Approved);
        assert_eq!(decided.approval.approver, "ops");

        let outcome = orch.execute(&job.id).unwrap();
        assert_eq!(outcome.status, JobStatus::Completed);

        let report = orch.status(&job.id).unwrap();
        assert_eq!(report.job.status, JobStatus::Completed);
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.plan.unwrap().id, planned.plan.id);
        assert_eq!(
            report.audit.state_transitions,
            vec![
                JobStatus::Draft,
                JobStatus::Planned,
                JobStatus::Approved,
                JobStatus::Running,
                JobStatus::Completed
            ]
        );

        let events = orch.run_events(&job.id, None).unwrap();
        assert_eq!(events.all()[0].kind, EventKind::JobStarted);
        assert_eq!(events.latest().unwrap().kind, EventKind::JobCompleted);
        assert_eq!(orch.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn unmatched_job_stays_draft() {
        let orch = orchestrator();
        let job = orch.create_job("Compile the kernel", BTreeMap::new(), None).unwrap();
        let err = orch.synthesize_plan(&job.id, &Selection::Strict).unwrap_err();
        assert!(matches!(err, ConciergeError::NoMatch));
        assert_eq!(orch.status(&job.id).unwrap().job.status, JobStatus::Draft);
    }

    #[test]
    fn missing_required_input_stays_draft() {
        let orch = orchestrator();
        let job = orch.create_job("Echo the message text", BTreeMap::new(), None).unwrap();
        let err = orch.synthesize_plan(&job.id, &Selection::Strict).unwrap_err();
        assert!(matches!(err, ConciergeError::UnresolvedInputs { .. }));
        assert_eq!(orch.status(&job.id).unwrap().job.status, JobStatus::Draft);
    }

    #[test]
    fn approving_draft_is_invalid_transition() {
        let orch = orchestrator();
        let job = orch.create_job("Echo the message text", inputs(), None).unwrap();
        let err = orch.decide(&job.id, DecisionRequest::grant()).unwrap_err();
        assert!(matches!(
            err,
            ConciergeError::InvalidTransition {
                from: JobStatus::Draft,
                to: JobStatus::Approved
            }
        ));
        assert!(orch.status(&job.id).unwrap().job.approvals.is_empty());
    }

    #[test]
    fn denial_keeps_planned() {
        let orch = orchestrator();
        let job = orch.create_job("Echo the message text", inputs(), None).unwrap();
        orch.synthesize_plan(&job.id, &Selection::Strict).unwrap();

        let outcome = orch
            .decide(&job.id, DecisionRequest::deny().with_note("not now"))
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Planned);
        assert_eq!(outcome.approval.approver, "user");

        let job = orch.status(&job.id).unwrap().job;
        assert_eq!(job.approvals.len(), 1);
        assert_eq!(job.approvals[0].note.as_deref(), Some("not now"));
        assert!(matches!(
            orch.execute(&job.id),
            Err(ConciergeError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn replanning_supersedes_earlier_plan() {
        let orch = orchestrator();
        let job = orch.create_job("Echo the message text", inputs(), None).unwrap();
        let first = orch.synthesize_plan(&job.id, &Selection::Strict).unwrap().plan;
        let second = orch.synthesize_plan(&job.id, &Selection::Strict).unwrap().plan;

        let stale = orch
            .decide(&job.id, DecisionRequest::grant().for_plan(&first.id))
            .unwrap();
        assert_eq!(stale.status, JobStatus::Planned);

        let current = orch.decide(&job.id, DecisionRequest::grant()).unwrap();
        assert_eq!(current.approval.plan_id, second.id);
        assert_eq!(current.status, JobStatus::Approved);
        assert_eq!(orch.status(&job.id).unwrap().job.plan_history.len(), 2);
    }

    #[test]
    fn auto_approval_for_confident_unsupervised_recipe() {
        let mut config = ConciergeConfig::default();
        config.approval.auto_approve = true;
        let orch = orchestrator_with(config, false);
        let job = orch.create_job("Echo the message text", inputs(), None).unwrap();

        let planned = orch.synthesize_plan(&job.id, &Selection::Strict).unwrap();
        assert!(planned.auto_approved);
        assert_eq!(planned.status, JobStatus::Approved);
        let job = orch.status(&job.id).unwrap().job;
        assert_eq!(job.approvals[0].approver, SYSTEM_APPROVER);
    }

    #[test]
    fn auto_approval_respects_recipe_flag() {
        let mut config = ConciergeConfig::default();
        config.approval.auto_approve = true;
        let orch = orchestrator_with(config, true);
        let job = orch.create_job("Echo the message text", inputs(), None).unwrap();
        let planned = orch.synthesize_plan(&job.id, &Selection::Strict).unwrap();
        assert!(!planned.auto_approved);
        assert_eq!(planned.status, JobStatus::Planned);
    }

    #[test]
    fn halt_before_run_is_immediate() {
        let orch = orchestrator();
        let job = orch.create_job("Echo the message text", inputs(), None).unwrap();
        orch.synthesize_plan(&job.id, &Selection::Strict).unwrap();
        assert_eq!(orch.halt(&job.id, None).unwrap(), HaltOutcome::Halted);
        assert!(orch.halt(&job.id, None).is_err());
        assert!(orch.synthesize_plan(&job.id, &Selection::Strict).is_err());
    }

    #[test]
    fn tampered_plan_is_not_executed() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = RecipeRegistry::new();
        registry
            .publish(recipe("text.echo", "1.0.0", &["echo"], &["text"], 0.5))
            .unwrap();
        let orch = Orchestrator::new(
            store.clone(),
            Arc::new(registry),
            WorkerRegistry::builtin(),
            ConciergeConfig::default(),
        );
        let job = orch.create_job("echo text", BTreeMap::new(), None).unwrap();
        let mut plan = orch.synthesize_plan(&job.id, &Selection::Strict).unwrap().plan;
        orch.decide(&job.id, DecisionRequest::grant()).unwrap();

        plan.steps[0].worker = "file_copy_worker".into();
        store.save_plan(&plan).unwrap();
        assert!(matches!(
            orch.execute(&job.id),
            Err(ConciergeError::PlanTampered(_))
        ));
        assert_eq!(orch.status(&job.id).unwrap().job.status, JobStatus::Approved);
    }

    fn approved_job(orch: &Orchestrator) -> String {
        let job = orch.create_job("echo text", BTreeMap::new(), None).unwrap();
        orch.synthesize_plan(&job.id, &Selection::Strict).unwrap();
        orch.decide(&job.id, DecisionRequest::grant()).unwrap();
        job.id
    }

    fn echo_registry() -> Arc<RecipeRegistry> {
        let mut registry = RecipeRegistry::new();
        registry
            .publish(recipe("text.echo", "1.0.0", &["echo"], &["text"], 0.5))
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn unwritable_log_leaves_job_approved() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(
            Arc::new(FsStore::new(dir.path())),
            echo_registry(),
            WorkerRegistry::builtin(),
            ConciergeConfig::default(),
        );
        let job_id = approved_job(&orch);

        let logs = dir.path().join("jobs").join(&job_id).join("logs");
        std::fs::write(&logs, "not a directory").unwrap();
        assert!(matches!(orch.execute(&job_id), Err(ConciergeError::Io(_))));
        let report = orch.status(&job_id).unwrap();
        assert_eq!(report.job.status, JobStatus::Approved);
        assert!(report.runs.is_empty());

        std::fs::remove_file(&logs).unwrap();
        assert_eq!(orch.execute(&job_id).unwrap().status, JobStatus::Completed);
    }

    /// Memory store whose run records can never be written.
    struct NoRunsStore(MemoryStore);

    impl JobStore for NoRunsStore {
        fn create_job(&self, job: &Job) -> Result<()> {
            self.0.create_job(job)
        }
        fn load_job(&self, job_id: &str) -> Result<Job> {
            self.0.load_job(job_id)
        }
        fn update_job(
            &self,
            job_id: &str,
            apply: &mut dyn FnMut(&mut Job) -> Result<()>,
        ) -> Result<Job> {
            self.0.update_job(job_id, apply)
        }
        fn list_jobs(&self) -> Result<Vec<Job>> {
            self.0.list_jobs()
        }
        fn save_plan(&self, plan: &Plan) -> Result<()> {
            self.0.save_plan(plan)
        }
        fn load_plan(&self, job_id: &str, plan_id: &str) -> Result<Plan> {
            self.0.load_plan(job_id, plan_id)
        }
        fn list_plans(&self, job_id: &str) -> Result<Vec<Plan>> {
            self.0.list_plans(job_id)
        }
        fn save_run(&self, _run: &RunRecord) -> Result<()> {
            Err(std::io::Error::other("disk full").into())
        }
        fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>> {
            self.0.list_runs(job_id)
        }
        fn open_run_log(&self, job_id: &str, run_id: &str) -> Result<Box<dyn EventSink>> {
            self.0.open_run_log(job_id, run_id)
        }
        fn read_run_events(&self, job_id: &str, run_id: &str) -> Result<Vec<Event>> {
            self.0.read_run_events(job_id, run_id)
        }
    }

    #[test]
    fn unsaved_run_record_fails_the_job() {
        let orch = Orchestrator::new(
            Arc::new(NoRunsStore(MemoryStore::new())),
            echo_registry(),
            WorkerRegistry::builtin(),
            ConciergeConfig::default(),
        );
        let job_id = approved_job(&orch);

        assert!(matches!(orch.execute(&job_id), Err(ConciergeError::Io(_))));
        assert_eq!(orch.status(&job_id).unwrap().job.status, JobStatus::Failed);
        assert!(matches!(
            orch.execute(&job_id),
            Err(ConciergeError::InvalidTransition {
                from: JobStatus::Failed,
                ..
            })
        ));
    }
}
