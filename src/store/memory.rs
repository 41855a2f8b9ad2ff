use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{JobLocks, JobStore, lock_ignoring_poison};
use crate::error::{ConciergeError, Result};
use crate::events::{Event, EventSink, MemorySink, RunRecord};
use crate::plan::Plan;
use crate::state_machine::Job;

/// Volatile store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, Job>>,
    plans: Mutex<HashMap<String, BTreeMap<String, Plan>>>,
    runs: Mutex<HashMap<String, BTreeMap<String, RunRecord>>>,
    logs: Mutex<HashMap<String, MemorySink>>,
    locks: JobLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryStore {
    fn create_job(&self, job: &Job) -> Result<()> {
        let mut jobs = lock_ignoring_poison(&self.jobs);
        if jobs.contains_key(&job.id) {
            return Err(ConciergeError::Config(format!("job already exists: {}", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Job> {
        lock_ignoring_poison(&self.jobs)
            .get(job_id)
            .cloned()
            .ok_or_else(|| ConciergeError::JobNotFound(job_id.to_string()))
    }

    fn update_job(
        &self,
        job_id: &str,
        apply: &mut dyn FnMut(&mut Job) -> Result<()>,
    ) -> Result<Job> {
        let handle = self.locks.handle(job_id);
        let _guard = lock_ignoring_poison(&handle);

        let mut job = self.load_job(job_id)?;
        apply(&mut job)?;
        lock_ignoring_poison(&self.jobs).insert(job_id.to_string(), job.clone());
        Ok(job)
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = lock_ignoring_poison(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn save_plan(&self, plan: &Plan) -> Result<()> {
        lock_ignoring_poison(&self.plans)
            .entry(plan.job_id.clone())
            .or_default()
            .insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    fn load_plan(&self, job_id: &str, plan_id: &str) -> Result<Plan> {
        lock_ignoring_poison(&self.plans)
            .get(job_id)
            .and_then(|plans| plans.get(plan_id))
            .cloned()
            .ok_or_else(|| ConciergeError::PlanNotFound(plan_id.to_string()))
    }

    fn list_plans(&self, job_id: &str) -> Result<Vec<Plan>> {
        let mut plans: Vec<Plan> = lock_ignoring_poison(&self.plans)
            .get(job_id)
            .map(|plans| plans.values().cloned().collect())
            .unwrap_or_default();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    fn save_run(&self, run: &RunRecord) -> Result<()> {
        lock_ignoring_poison(&self.runs)
            .entry(run.job_id.clone())
            .or_default()
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = lock_ignoring_poison(&self.runs)
            .get(job_id)
            .map(|runs| runs.values().cloned().collect())
            .unwrap_or_default();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    fn open_run_log(&self, _job_id: &str, run_id: &str) -> Result<Box<dyn EventSink>> {
        let sink = lock_ignoring_poison(&self.logs)
            .entry(run_id.to_string())
            .or_default()
            .clone();
        Ok(Box::new(sink))
    }

    fn read_run_events(&self, _job_id: &str, run_id: &str) -> Result<Vec<Event>> {
        lock_ignoring_poison(&self.logs)
            .get(run_id)
            .map(MemorySink::events)
            .ok_or_else(|| ConciergeError::RunNotFound(run_id.to_string()))
    }
}
