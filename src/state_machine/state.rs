use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::job::{Approval, Decision, Job};
use crate::error::{ConciergeError, Result};
use crate::plan::Plan;

/// The seven states of a job.
///
/// Each job flows through: DRAFT → PLANNED → APPROVED → RUNNING → COMPLETED | FAILED,
/// and any non-terminal state may be HALTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
    Planned,
    Approved,
    Running,
    Completed,
    Failed,
    Halted,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Draft => write!(f, "DRAFT"),
            JobStatus::Planned => write!(f, "PLANNED"),
            JobStatus::Approved => write!(f, "APPROVED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Halted => write!(f, "HALTED"),
        }
    }
}

impl JobStatus {
    /// Whether the transition table has an edge from `self` to `target`.
    pub fn can_transition_to(self, target: JobStatus) -> bool {
        use JobStatus::*;

        match (self, target) {
            (Draft, Planned) | (Planned, Approved) | (Approved, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (from, Halted) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Halted
        )
    }
}

/// One committed edge in a job's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The effect of a state machine operation on a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The job moved along an edge of the transition table.
    Next { from: JobStatus, to: JobStatus },
    /// A record was appended but the status did not change.
    Unchanged(JobStatus),
    /// A halt was requested on a running job and will be honored at the
    /// next step boundary.
    HaltPending,
}

/// Validates and applies every status change a job goes through.
///
/// All operations mutate the job in place and either fully succeed or leave
/// it untouched; callers commit the mutated record as one unit.
pub struct StateMachine;

impl StateMachine {
    /// Attach a freshly matched plan.
    ///
    /// - `DRAFT` moves to `PLANNED`.
    /// - `PLANNED` keeps its status; the new plan replaces the current one
    ///   and becomes the only plan eligible for approval.
    pub fn attach_plan(job: &mut Job, plan: &Plan) -> Result<Transition> {
        let from = job.status;
        if plan.job_id != job.id || !plan.meets_threshold() {
            return Err(ConciergeError::InvalidTransition {
                from,
                to: JobStatus::Planned,
            });
        }

        match from {
            JobStatus::Draft => {
                job.attach_plan_id(&plan.id);
                Self::apply(
                    job,
                    JobStatus::Planned,
                    Some(format!("matched {} v{}", plan.recipe_id, plan.recipe_version)),
                )
            }
            JobStatus::Planned => {
                job.attach_plan_id(&plan.id);
                job.touch();
                info!(job_id = %job.id, plan_id = %plan.id, "Replaced current plan");
                Ok(Transition::Unchanged(JobStatus::Planned))
            }
            _ => Err(ConciergeError::InvalidTransition {
                from,
                to: JobStatus::Planned,
            }),
        }
    }

    /// Append an approval decision.
    ///
    /// A granted decision against the current plan moves `PLANNED` to
    /// `APPROVED`. Denials, and decisions against a superseded plan, are
    /// recorded without a status change. A job that is already `APPROVED`
    /// still records late decisions so that no attempt is lost.
    pub fn record_decision(job: &mut Job, approval: Approval, plan: &Plan) -> Result<Transition> {
        let from = job.status;
        match from {
            JobStatus::Planned | JobStatus::Approved => {}
            _ => {
                return Err(ConciergeError::InvalidTransition {
                    from,
                    to: JobStatus::Approved,
                });
            }
        }

        let unlocks = from == JobStatus::Planned
            && approval.decision == Decision::Granted
            && job.plan_id.as_deref() == Some(approval.plan_id.as_str())
            && plan.id == approval.plan_id
            && plan.meets_threshold();

        info!(
            job_id = %job.id,
            plan_id = %approval.plan_id,
            decision = %approval.decision,
            "Recorded approval decision"
        );
        job.approvals.push(approval);

        if unlocks {
            Self::apply(job, JobStatus::Approved, None)
        } else {
            job.touch();
            Ok(Transition::Unchanged(from))
        }
    }

    /// `APPROVED → RUNNING`. The commit of this edge is what gives a run
    /// ownership of the job.
    pub fn start(job: &mut Job) -> Result<Transition> {
        Self::check_start(job)?;
        job.halt_requested = false;
        Self::apply(job, JobStatus::Running, None)
    }

    /// Whether [`StateMachine::start`] would succeed, without touching the job.
    pub fn check_start(job: &Job) -> Result<()> {
        match job.status {
            JobStatus::Running => Err(ConciergeError::AlreadyRunning(job.id.clone())),
            JobStatus::Approved if job.current_plan_granted() => Ok(()),
            from => Err(ConciergeError::InvalidTransition {
                from,
                to: JobStatus::Running,
            }),
        }
    }

    /// `RUNNING → COMPLETED | FAILED | HALTED`, driven by the executor.
    pub fn finish(job: &mut Job, to: JobStatus, reason: Option<String>) -> Result<Transition> {
        let from = job.status;
        if from != JobStatus::Running || !matches!(to, JobStatus::Completed | JobStatus::Failed | JobStatus::Halted) {
            return Err(ConciergeError::InvalidTransition { from, to });
        }
        job.halt_requested = false;
        Self::apply(job, to, reason)
    }

    /// External halt request. Idle jobs halt immediately; a running job only
    /// has the request recorded.
    pub fn halt(job: &mut Job, reason: Option<String>) -> Result<Transition> {
        match job.status {
            JobStatus::Running => {
                if !job.halt_requested {
                    job.halt_requested = true;
                    job.touch();
                    info!(job_id = %job.id, "Halt requested for running job");
                }
                Ok(Transition::HaltPending)
            }
            _ => Self::apply(job, JobStatus::Halted, reason),
        }
    }

    fn apply(job: &mut Job, to: JobStatus, reason: Option<String>) -> Result<Transition> {
        let from = job.status;
        if !from.can_transition_to(to) {
            return Err(ConciergeError::InvalidTransition { from, to });
        }

        job.transitions.push(StateTransition {
            from,
            to,
            at: Utc::now(),
            reason,
        });
        job.status = to;
        job.touch();

        info!(job_id = %job.id, %from, %to, "Job transition");
        Ok(Transition::Next { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Requirement;
    use crate::state_machine::job::Approval;
    use crate::test_support::plan_for;

    fn make_job() -> Job {
        Job::new(
            Requirement::new("normalize the audio", vec!["normalize".into(), "audio".into()]),
            Default::default(),
        )
    }

    fn planned_job() -> (Job, Plan) {
        let mut job = make_job();
        let plan = plan_for(&job, 0.9, 0.5);
        StateMachine::attach_plan(&mut job, &plan).unwrap();
        (job, plan)
    }

    #[test]
    fn happy_path_walks_all_states() {
        let (mut job, plan) = planned_job();
        assert_eq!(job.status, JobStatus::Planned);

        let t = StateMachine::record_decision(&mut job, Approval::grant(&plan.id, "ops", None), &plan)
            .unwrap();
        assert_eq!(
            t,
            Transition::Next {
                from: JobStatus::Planned,
                to: JobStatus::Approved
            }
        );

        StateMachine::start(&mut job).unwrap();
        assert_eq!(job.status, JobStatus::Running);

        StateMachine::finish(&mut job, JobStatus::Completed, None).unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let path: Vec<_> = job.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                JobStatus::Planned,
                JobStatus::Approved,
                JobStatus::Running,
                JobStatus::Completed
            ]
        );
    }

    #[test]
    fn approving_draft_is_invalid() {
        let mut job = make_job();
        let plan = plan_for(&job, 0.9, 0.5);
        let err = StateMachine::record_decision(&mut job, Approval::grant(&plan.id, "ops", None), &plan)
            .unwrap_err();
        assert!(matches!(
            err,
            ConciergeError::InvalidTransition {
                from: JobStatus::Draft,
                to: JobStatus::Approved
            }
        ));
        assert!(job.approvals.is_empty());
        assert_eq!(job.status, JobStatus::Draft);
    }

    #[test]
    fn denial_stays_planned_and_appends_one_record() {
        let (mut job, plan) = planned_job();
        let t = StateMachine::record_decision(
            &mut job,
            Approval::deny(&plan.id, "ops", Some("wrong recipe".into())),
            &plan,
        )
        .unwrap();
        assert_eq!(t, Transition::Unchanged(JobStatus::Planned));
        assert_eq!(job.status, JobStatus::Planned);
        assert_eq!(job.approvals.len(), 1);
    }

    #[test]
    fn grant_against_superseded_plan_does_not_unlock() {
        let (mut job, old_plan) = planned_job();
        let new_plan = plan_for(&job, 0.8, 0.5);
        StateMachine::attach_plan(&mut job, &new_plan).unwrap();
        assert_eq!(job.plan_history.len(), 2);

        let t = StateMachine::record_decision(
            &mut job,
            Approval::grant(&old_plan.id, "ops", None),
            &old_plan,
        )
        .unwrap();
        assert_eq!(t, Transition::Unchanged(JobStatus::Planned));
        assert_eq!(job.approvals.len(), 1);
    }

    #[test]
    fn late_grant_is_recorded_without_transition() {
        let (mut job, plan) = planned_job();
        StateMachine::record_decision(&mut job, Approval::grant(&plan.id, "a", None), &plan).unwrap();
        let t = StateMachine::record_decision(&mut job, Approval::grant(&plan.id, "b", None), &plan)
            .unwrap();
        assert_eq!(t, Transition::Unchanged(JobStatus::Approved));
        assert_eq!(job.approvals.len(), 2);
    }

    #[test]
    fn start_requires_approval() {
        let (mut job, _) = planned_job();
        let err = StateMachine::start(&mut job).unwrap_err();
        assert!(matches!(
            err,
            ConciergeError::InvalidTransition {
                from: JobStatus::Planned,
                to: JobStatus::Running
            }
        ));
    }

    #[test]
    fn start_on_running_job_is_already_running() {
        let (mut job, plan) = planned_job();
        StateMachine::record_decision(&mut job, Approval::grant(&plan.id, "a", None), &plan).unwrap();
        StateMachine::start(&mut job).unwrap();
        let err = StateMachine::start(&mut job).unwrap_err();
        assert!(matches!(err, ConciergeError::AlreadyRunning(id) if id == job.id));
    }

    #[test]
    fn halt_idle_job_is_immediate() {
        let (mut job, _) = planned_job();
        let t = StateMachine::halt(&mut job, Some("operator".into())).unwrap();
        assert_eq!(
            t,
            Transition::Next {
                from: JobStatus::Planned,
                to: JobStatus::Halted
            }
        );
        assert!(StateMachine::halt(&mut job, None).is_err());
    }

    #[test]
    fn halt_running_job_is_deferred() {
        let (mut job, plan) = planned_job();
        StateMachine::record_decision(&mut job, Approval::grant(&plan.id, "a", None), &plan).unwrap();
        StateMachine::start(&mut job).unwrap();

        let t = StateMachine::halt(&mut job, None).unwrap();
        assert_eq!(t, Transition::HaltPending);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.halt_requested);

        StateMachine::finish(&mut job, JobStatus::Halted, None).unwrap();
        assert_eq!(job.status, JobStatus::Halted);
        assert!(!job.halt_requested);
    }

    #[test]
    fn finish_rejects_non_terminal_targets() {
        let (mut job, _) = planned_job();
        assert!(StateMachine::finish(&mut job, JobStatus::Completed, None).is_err());
        assert_eq!(job.status, JobStatus::Planned);
    }

    #[test]
    fn plan_below_threshold_is_refused() {
        let mut job = make_job();
        let plan = plan_for(&job, 0.4, 0.5);
        assert!(StateMachine::attach_plan(&mut job, &plan).is_err());
        assert_eq!(job.status, JobStatus::Draft);
        assert!(job.plan_id.is_none());
    }

    #[test]
    fn transition_table_edges() {
        use JobStatus::*;
        assert!(Draft.can_transition_to(Planned));
        assert!(!Draft.can_transition_to(Running));
        assert!(!Planned.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Approved.can_transition_to(Halted));
        assert!(!Completed.can_transition_to(Halted));
        assert!(!Failed.can_transition_to(Planned));
    }

    #[test]
    fn status_display() {
        assert_eq!(JobStatus::Draft.to_string(), "DRAFT");
        assert_eq!(JobStatus::Running.to_string(), "RUNNING");
        assert_eq!(JobStatus::Halted.to_string(), "HALTED");
    }
}
