use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobStatus, StateTransition};
use crate::intent::Requirement;

/// Outcome of an approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Granted,
    Denied,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Granted => write!(f, "granted"),
            Decision::Denied => write!(f, "denied"),
        }
    }
}

/// One immutable approval record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub plan_id: String,
    pub decision: Decision,
    pub decided_at: DateTime<Utc>,
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Approval {
    pub fn grant(plan_id: &str, approver: &str, note: Option<String>) -> Self {
        Self::new(plan_id, Decision::Granted, approver, note)
    }

    pub fn deny(plan_id: &str, approver: &str, note: Option<String>) -> Self {
        Self::new(plan_id, Decision::Denied, approver, note)
    }

    pub fn new(plan_id: &str, decision: Decision, approver: &str, note: Option<String>) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            decision,
            decided_at: Utc::now(),
            approver: approver.to_string(),
            note,
        }
    }
}

/// The unit of work tracked end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub requirement: Requirement,
    /// Inputs known when the job was created, resolved against a recipe's
    /// input contract at match time.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    pub status: JobStatus,
    /// Append-only.
    #[serde(default)]
    pub approvals: Vec<Approval>,
    /// The only plan eligible for approval.
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub plan_history: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
    #[serde(default)]
    pub halt_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(requirement: Requirement, inputs: BTreeMap<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("job-{}", Uuid::new_v4()),
            requirement,
            inputs,
            status: JobStatus::Draft,
            approvals: Vec::new(),
            plan_id: None,
            plan_history: Vec::new(),
            transitions: Vec::new(),
            halt_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Approvals recorded against one plan, oldest first.
    pub fn approvals_for<'a>(&'a self, plan_id: &'a str) -> impl Iterator<Item = &'a Approval> + 'a {
        self.approvals.iter().filter(move |a| a.plan_id == plan_id)
    }

    pub fn latest_approval(&self) -> Option<&Approval> {
        self.approvals.last()
    }

    /// Whether the current plan holds at least one granted approval.
    pub fn current_plan_granted(&self) -> bool {
        match &self.plan_id {
            Some(plan_id) => self
                .approvals_for(plan_id)
                .any(|a| a.decision == Decision::Granted),
            None => false,
        }
    }

    pub(crate) fn attach_plan_id(&mut self, plan_id: &str) {
        self.plan_id = Some(plan_id.to_string());
        self.plan_history.push(plan_id.to_string());
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Flattened view of a job for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: String,
    pub description: String,
    pub status: JobStatus,
    pub state_transitions: Vec<JobStatus>,
    pub plan_id: Option<String>,
    pub plans_generated: usize,
    pub approvals: usize,
    pub denials: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub age_ms: i64,
}

impl AuditRecord {
    pub fn from_job(job: &Job) -> Self {
        let mut transitions = vec![JobStatus::Draft];
        transitions.extend(job.transitions.iter().map(|t| t.to));

        let denials = job
            .approvals
            .iter()
            .filter(|a| a.decision == Decision::Denied)
            .count();

        Self {
            job_id: job.id.clone(),
            description: job.requirement.description.clone(),
            status: job.status,
            state_transitions: transitions,
            plan_id: job.plan_id.clone(),
            plans_generated: job.plan_history.len(),
            approvals: job.approvals.len() - denials,
            denials,
            created_at: job.created_at,
            updated_at: job.updated_at,
            age_ms: (Utc::now() - job.created_at).num_milliseconds(),
        }
    }
}
