//! Durable job, plan and run records.
//!
//! [`JobStore`] is the only way the orchestrator touches persistence. Job
//! records change exclusively through [`JobStore::update_job`], which
//! serializes commits per job id.

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::events::{Event, EventSink, RunRecord};
use crate::plan::Plan;
use crate::state_machine::Job;

pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails if the id is already taken.
    fn create_job(&self, job: &Job) -> Result<()>;

    fn load_job(&self, job_id: &str) -> Result<Job>;

    /// Load, mutate and commit a job as one unit while holding the job's
    /// commit lock. If `apply` fails nothing is written. Returns the
    /// committed record.
    fn update_job(
        &self,
        job_id: &str,
        apply: &mut dyn FnMut(&mut Job) -> Result<()>,
    ) -> Result<Job>;

    /// Every job, oldest first.
    fn list_jobs(&self) -> Result<Vec<Job>>;

    fn save_plan(&self, plan: &Plan) -> Result<()>;

    fn load_plan(&self, job_id: &str, plan_id: &str) -> Result<Plan>;

    /// Every plan generated for a job, oldest first.
    fn list_plans(&self, job_id: &str) -> Result<Vec<Plan>>;

    /// Insert or replace a run record.
    fn save_run(&self, run: &RunRecord) -> Result<()>;

    /// Every run of a job, oldest first.
    fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>>;

    /// Fresh append target for a run's events.
    fn open_run_log(&self, job_id: &str, run_id: &str) -> Result<Box<dyn EventSink>>;

    fn read_run_events(&self, job_id: &str, run_id: &str) -> Result<Vec<Event>>;
}

/// In-process mutex per job id.
#[derive(Debug, Default)]
pub(crate) struct JobLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobLocks {
    pub(crate) fn handle(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut locks = lock_ignoring_poison(&self.locks);
        locks.entry(job_id.to_string()).or_default().clone()
    }
}

/// A panic while a commit lock is held leaves nothing half-written, so a
/// poisoned lock is still usable.
pub(crate) fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
