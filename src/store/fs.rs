use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{JobLocks, JobStore, lock_ignoring_poison};
use crate::error::{ConciergeError, Result};
use crate::events::{self, Event, EventSink, JsonlSink, RunRecord};
use crate::plan::Plan;
use crate::state_machine::Job;

/// Filesystem store rooted at a workspace:
///
/// ```text
/// jobs/<job_id>/job.json
/// jobs/<job_id>/job.lock
/// jobs/<job_id>/plans/<plan_id>.json
/// jobs/<job_id>/runs/<run_id>.json
/// jobs/<job_id>/logs/<run_id>.jsonl
/// ```
///
/// Job commits take the in-process lock for the job and then an exclusive
/// `fs2` lock on `job.lock`, so concurrent CLI invocations serialize too.
#[derive(Debug)]
pub struct FsStore {
    jobs_dir: PathBuf,
    locks: JobLocks,
}

impl FsStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            jobs_dir: workspace.join("jobs"),
            locks: JobLocks::default(),
        }
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(job_id)
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("job.json")
    }

    fn read_job(&self, job_id: &str) -> Result<Job> {
        let path = self.job_path(job_id);
        if !path.exists() {
            return Err(ConciergeError::JobNotFound(job_id.to_string()));
        }
        read_json(&path)
    }
}

impl JobStore for FsStore {
    fn create_job(&self, job: &Job) -> Result<()> {
        let dir = self.job_dir(&job.id);
        fs::create_dir_all(&dir)?;
        let path = dir.join("job.json");
        if path.exists() {
            return Err(ConciergeError::Config(format!("job already exists: {}", job.id)));
        }
        write_json_atomic(&path, job)?;
        debug!(job_id = %job.id, path = %path.display(), "Created job record");
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Job> {
        self.read_job(job_id)
    }

    fn update_job(
        &self,
        job_id: &str,
        apply: &mut dyn FnMut(&mut Job) -> Result<()>,
    ) -> Result<Job> {
        let dir = self.job_dir(job_id);
        if !dir.join("job.json").exists() {
            return Err(ConciergeError::JobNotFound(job_id.to_string()));
        }

        let handle = self.locks.handle(job_id);
        let _guard = lock_ignoring_poison(&handle);

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("job.lock"))?;
        // fs2's method, not std's `File::lock_exclusive`.
        FileExt::lock_exclusive(&lock_file)?;

        let mut job = self.read_job(job_id)?;
        apply(&mut job)?;
        write_json_atomic(&self.job_path(job_id), &job)?;

        // Closing the file releases the lock as well.
        FileExt::unlock(&lock_file)?;
        Ok(job)
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        if !self.jobs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.jobs_dir)? {
            let path = entry?.path().join("job.json");
            if !path.exists() {
                continue;
            }
            match read_json::<Job>(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job"),
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn save_plan(&self, plan: &Plan) -> Result<()> {
        let dir = self.job_dir(&plan.job_id).join("plans");
        fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(format!("{}.json", plan.id)), plan)
    }

    fn load_plan(&self, job_id: &str, plan_id: &str) -> Result<Plan> {
        let path = self
            .job_dir(job_id)
            .join("plans")
            .join(format!("{plan_id}.json"));
        if !path.exists() {
            return Err(ConciergeError::PlanNotFound(plan_id.to_string()));
        }
        read_json(&path)
    }

    fn list_plans(&self, job_id: &str) -> Result<Vec<Plan>> {
        let mut plans: Vec<Plan> = read_json_dir(&self.job_dir(job_id).join("plans"))?;
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    fn save_run(&self, run: &RunRecord) -> Result<()> {
        let dir = self.job_dir(&run.job_id).join("runs");
        fs::create_dir_all(&dir)?;
        write_json_atomic(&dir.join(format!("{}.json", run.id)), run)
    }

    fn list_runs(&self, job_id: &str) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = read_json_dir(&self.job_dir(job_id).join("runs"))?;
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    fn open_run_log(&self, job_id: &str, run_id: &str) -> Result<Box<dyn EventSink>> {
        let dir = self.job_dir(job_id).join("logs");
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{run_id}.jsonl")))?;
        Ok(Box::new(JsonlSink::new(file)))
    }

    fn read_run_events(&self, job_id: &str, run_id: &str) -> Result<Vec<Event>> {
        let path = self
            .job_dir(job_id)
            .join("logs")
            .join(format!("{run_id}.jsonl"));
        if !path.exists() {
            return Err(ConciergeError::RunNotFound(run_id.to_string()));
        }
        events::read_jsonl(BufReader::new(File::open(path)?))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Every parseable `*.json` file in `dir`; a missing directory is empty.
fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        match read_json(&path) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }
    Ok(records)
}

/// Write to a sibling temp file, then rename over the target.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
