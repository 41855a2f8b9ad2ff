//! Sequential pipeline execution.
//!
//! [`PipelineExecutor::run`] drives one approved plan from the first step to
//! a terminal state, threading values through an [`ExecutionContext`] and
//! recording every observable fact in the run's [`EventLog`].

mod context;
mod worker;

pub use context::ExecutionContext;
pub use worker::{
    CounterWorker, EchoWorker, FileCopyWorker, SleepWorker, Values, WorkerCapability,
    WorkerRegistry,
};

use std::time::Instant;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::ConciergeConfig;
use crate::error::{ConciergeError, Result, StepError};
use crate::events::{EventKind, EventLog, RunRecord, RunStatus};
use crate::plan::Plan;
use crate::registry::{FailurePolicy, PipelineStep};
use crate::state_machine::{JobStatus, StateMachine};
use crate::store::JobStore;
use worker::{Invocation, invoke_with_timeout};

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: RunRecord,
    pub status: JobStatus,
    pub context: ExecutionContext,
    /// The step failure that ended the run, if any.
    pub failure: Option<StepError>,
}

/// How the step loop ended.
enum Ending {
    Completed,
    Failed(StepError),
    Halted { before_step: String },
}

pub struct PipelineExecutor<'a> {
    store: &'a dyn JobStore,
    workers: &'a WorkerRegistry,
    config: &'a ConciergeConfig,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(
        store: &'a dyn JobStore,
        workers: &'a WorkerRegistry,
        config: &'a ConciergeConfig,
    ) -> Self {
        Self {
            store,
            workers,
            config,
        }
    }

    /// Execute `plan` for a job that is already `RUNNING`.
    ///
    /// Step failures end the run in `FAILED` and are reported in the outcome,
    /// not as `Err`. `Err` means the log or store could not be written; the
    /// job is still moved to `FAILED` on a best-effort basis.
    pub fn run(&self, plan: &Plan, log: &mut EventLog, mut run: RunRecord) -> Result<RunOutcome> {
        let mut context = ExecutionContext::from_plan(plan);

        let driven = self
            .store
            .save_run(&run)
            .and_then(|()| self.drive(plan, log, &mut context));
        let ending = match driven {
            Ok(ending) => ending,
            Err(e) => {
                error!(job_id = %plan.job_id, run_id = %run.id, error = %e, "Run aborted");
                run.finish(RunStatus::Failed);
                self.abandon(&run, &e);
                return Err(e);
            }
        };

        let (status, run_status, reason, failure) = match ending {
            Ending::Completed => (JobStatus::Completed, RunStatus::Completed, None, None),
            Ending::Failed(err) => (
                JobStatus::Failed,
                RunStatus::Failed,
                Some(err.to_string()),
                Some(err),
            ),
            Ending::Halted { before_step } => (
                JobStatus::Halted,
                RunStatus::Halted,
                Some(format!("halted before step {before_step}")),
                None,
            ),
        };

        self.commit_finish(&plan.job_id, status, reason)?;
        run.finish(run_status);
        self.store.save_run(&run)?;
        info!(job_id = %plan.job_id, run_id = %run.id, %status, "Run finished");

        Ok(RunOutcome {
            run,
            status,
            context,
            failure,
        })
    }

    fn drive(
        &self,
        plan: &Plan,
        log: &mut EventLog,
        context: &mut ExecutionContext,
    ) -> Result<Ending> {
        log.append(
            EventKind::JobStarted,
            None,
            json!({
                "plan_id": plan.id,
                "recipe_id": plan.recipe_id,
                "recipe_version": plan.recipe_version.to_string(),
                "steps": plan.steps.len(),
            }),
        )?;

        for step in &plan.steps {
            if self.store.load_job(&plan.job_id)?.halt_requested {
                log.append(
                    EventKind::JobHalted,
                    None,
                    json!({ "before_step": step.id, "context": context }),
                )?;
                warn!(job_id = %plan.job_id, step_id = %step.id, "Halt honored at step boundary");
                return Ok(Ending::Halted {
                    before_step: step.id.clone(),
                });
            }

            if let Err(err) = self.run_step(step, log, context)? {
                log.append(
                    EventKind::StepFailed,
                    Some(&step.id),
                    json!({
                        "worker": step.worker,
                        "error": err,
                        "message": err.to_string(),
                        "failure_kind": err.kind(),
                    }),
                )?;

                match step.on_failure {
                    FailurePolicy::Abort => {
                        log.append(
                            EventKind::JobFailed,
                            None,
                            json!({
                                "step_id": step.id,
                                "error": err.to_string(),
                                "failure_kind": err.kind(),
                            }),
                        )?;
                        return Ok(Ending::Failed(err));
                    }
                }
            }
        }

        log.append(EventKind::JobCompleted, None, json!({ "context": context }))?;
        Ok(Ending::Completed)
    }

    /// Run one step. The outer `Result` is for log failures, the inner one
    /// for the step itself.
    fn run_step(
        &self,
        step: &PipelineStep,
        log: &mut EventLog,
        context: &mut ExecutionContext,
    ) -> Result<std::result::Result<(), StepError>> {
        log.append(
            EventKind::StepStarted,
            Some(&step.id),
            json!({ "worker": step.worker }),
        )?;
        let started = Instant::now();

        let inputs = match context.gather(step) {
            Ok(inputs) => inputs,
            Err(err) => return Ok(Err(err)),
        };

        if !self.config.worker_enabled(&step.worker) {
            return Ok(Err(StepError::WorkerDisabled {
                step_id: step.id.clone(),
                worker_id: step.worker.clone(),
            }));
        }
        let Some(worker) = self.workers.get(&step.worker) else {
            return Ok(Err(StepError::UnknownWorker {
                step_id: step.id.clone(),
                worker_id: step.worker.clone(),
            }));
        };

        let timeout = self.config.worker_timeout(&step.worker);
        log.append(
            EventKind::WorkerInvoked,
            Some(&step.id),
            json!({
                "worker": step.worker,
                "inputs": inputs.keys().collect::<Vec<_>>(),
                "timeout_ms": timeout.as_millis() as u64,
            }),
        )?;
        debug!(step_id = %step.id, worker = %step.worker, "Invoking worker");

        let produced = match invoke_with_timeout(
            &step.worker,
            worker,
            inputs,
            step.params.clone(),
            timeout,
        ) {
            Invocation::Finished(Ok(outputs)) => outputs,
            Invocation::Finished(Err(e)) => {
                return Ok(Err(StepError::WorkerFailure {
                    step_id: step.id.clone(),
                    worker_id: step.worker.clone(),
                    message: e.to_string(),
                }));
            }
            Invocation::Lost(message) => {
                return Ok(Err(StepError::WorkerFailure {
                    step_id: step.id.clone(),
                    worker_id: step.worker.clone(),
                    message,
                }));
            }
            Invocation::TimedOut => {
                return Ok(Err(StepError::WorkerTimeout {
                    step_id: step.id.clone(),
                    worker_id: step.worker.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }));
            }
        };

        log.append(
            EventKind::WorkerOutput,
            Some(&step.id),
            json!({ "worker": step.worker, "outputs": produced }),
        )?;

        let outputs = match ExecutionContext::declared_outputs(step, &produced) {
            Ok(outputs) => outputs,
            Err(err) => return Ok(Err(err)),
        };

        log.append(
            EventKind::StepCompleted,
            Some(&step.id),
            json!({
                "worker": step.worker,
                "duration_ms": started.elapsed().as_millis() as u64,
                "outputs": outputs,
            }),
        )?;
        context.extend(outputs);
        Ok(Ok(()))
    }

    /// Best-effort `FAILED` commit after the log or store broke mid-run.
    fn abandon(&self, run: &RunRecord, cause: &ConciergeError) {
        if let Err(e) = self.store.save_run(run) {
            warn!(run_id = %run.id, error = %e, "Could not record failed run");
        }
        if let Err(e) = self.commit_finish(&run.job_id, JobStatus::Failed, Some(cause.to_string())) {
            warn!(job_id = %run.job_id, error = %e, "Could not mark job failed");
        }
    }

    fn commit_finish(&self, job_id: &str, to: JobStatus, reason: Option<String>) -> Result<()> {
        self.store.update_job(job_id, &mut |job| {
            StateMachine::finish(job, to, reason.clone()).map(|_| ())
        })?;
        Ok(())
    }
}
