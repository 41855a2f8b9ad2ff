//! Worker capabilities and the table they are looked up in.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::warn;

use crate::error::WorkerError;

/// Named values passed into and returned from a worker.
pub type Values = BTreeMap<String, Value>;

/// A unit of work a pipeline step can invoke.
///
/// `inputs` holds exactly the step's declared inputs; `params` the step's
/// static parameters from the recipe.
pub trait WorkerCapability: Send + Sync {
    fn invoke(&self, inputs: &Values, params: &Values) -> Result<Values, WorkerError>;
}

impl<F> WorkerCapability for F
where
    F: Fn(&Values, &Values) -> Result<Values, WorkerError> + Send + Sync,
{
    fn invoke(&self, inputs: &Values, params: &Values) -> Result<Values, WorkerError> {
        self(inputs, params)
    }
}

/// Worker table keyed by id, built once at startup.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, Arc<dyn WorkerCapability>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in workers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("echo_worker", EchoWorker);
        registry.register("counter_worker", CounterWorker);
        registry.register("file_copy_worker", FileCopyWorker);
        registry.register("sleep_worker", SleepWorker);
        registry
    }

    /// Add or replace the worker registered under `id`.
    pub fn register(&mut self, id: &str, worker: impl WorkerCapability + 'static) {
        self.workers.insert(id.to_string(), Arc::new(worker));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn WorkerCapability>> {
        self.workers.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// How a bounded invocation ended.
#[derive(Debug)]
pub(crate) enum Invocation {
    Finished(Result<Values, WorkerError>),
    TimedOut,
    /// The worker thread died before reporting (panic or failed spawn).
    Lost(String),
}

/// Run `worker` on its own thread and wait at most `timeout` for it.
///
/// A worker that overruns is left to finish on its own; its result is
/// dropped.
pub(crate) fn invoke_with_timeout(
    worker_id: &str,
    worker: Arc<dyn WorkerCapability>,
    inputs: Values,
    params: Values,
    timeout: Duration,
) -> Invocation {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("worker-{worker_id}"))
        .spawn(move || {
            let _ = tx.send(worker.invoke(&inputs, &params));
        });

    if let Err(e) = spawned {
        return Invocation::Lost(format!("failed to spawn worker thread: {e}"));
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => Invocation::Finished(result),
        Err(RecvTimeoutError::Timeout) => {
            warn!(worker_id, timeout_ms = timeout.as_millis() as u64, "Worker timed out; detaching");
            Invocation::TimedOut
        }
        Err(RecvTimeoutError::Disconnected) => {
            Invocation::Lost("worker thread exited without a result".to_string())
        }
    }
}

/// `message` → `output`, optionally stamped with the current time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoWorker;

impl WorkerCapability for EchoWorker {
    fn invoke(&self, inputs: &Values, params: &Values) -> Result<Values, WorkerError> {
        let message = match inputs.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let stamp = params
            .get("timestamp")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let output = if stamp {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            format!("{message} [echoed at {now}]")
        } else {
            format!("{message} [echoed]")
        };
        Ok(Values::from([("output".to_string(), json!(output))]))
    }
}

/// `items` → `count`. Counts array elements or string characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterWorker;

impl WorkerCapability for CounterWorker {
    fn invoke(&self, inputs: &Values, _params: &Values) -> Result<Values, WorkerError> {
        let count = match inputs.get("items") {
            Some(Value::Array(items)) => items.len(),
            Some(Value::String(s)) => s.chars().count(),
            Some(Value::Object(map)) => map.len(),
            _ => 0,
        };
        Ok(Values::from([("count".to_string(), json!(count))]))
    }
}

/// `source_file` + `destination_path` → `copied_file`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCopyWorker;

impl WorkerCapability for FileCopyWorker {
    fn invoke(&self, inputs: &Values, _params: &Values) -> Result<Values, WorkerError> {
        let source = inputs.get("source_file").and_then(Value::as_str).unwrap_or_default();
        let destination = inputs
            .get("destination_path")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if source.is_empty() || destination.is_empty() {
            return Err(WorkerError::InvalidInput(
                "source_file and destination_path are required".to_string(),
            ));
        }

        let destination = Path::new(destination);
        if let Some(parent) = destination.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, destination)?;

        let copied = fs::canonicalize(destination)?;
        Ok(Values::from([(
            "copied_file".to_string(),
            json!(copied.display().to_string()),
        )]))
    }
}

/// Sleeps for `params.millis` (default 1000) and reports `slept_ms`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepWorker;

impl WorkerCapability for SleepWorker {
    fn invoke(&self, _inputs: &Values, params: &Values) -> Result<Values, WorkerError> {
        let millis = params.get("millis").and_then(Value::as_u64).unwrap_or(1000);
        thread::sleep(Duration::from_millis(millis));
        Ok(Values::from([("slept_ms".to_string(), json!(millis))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, Value)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn builtin_registry_has_all_workers() {
        let registry = WorkerRegistry::builtin();
        let ids: Vec<_> = registry.ids().collect();
        assert_eq!(
            ids,
            vec!["counter_worker", "echo_worker", "file_copy_worker", "sleep_worker"]
        );
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn echo_without_timestamp() {
        let out = EchoWorker
            .invoke(
                &values(&[("message", json!("hello"))]),
                &values(&[("timestamp", json!(false))]),
            )
            .unwrap();
        assert_eq!(out["output"], json!("hello [echoed]"));
    }

    #[test]
    fn echo_with_timestamp() {
        let out = EchoWorker
            .invoke(&values(&[("message", json!("hi"))]), &Values::new())
            .unwrap();
        let text = out["output"].as_str().unwrap();
        assert!(text.starts_with("hi [echoed at "));
        assert!(text.ends_with("Z]"));
    }

    #[test]
    fn counter_counts_arrays_and_strings() {
        let params = Values::new();
        let out = CounterWorker
            .invoke(&values(&[("items", json!([1, 2, 3]))]), &params)
            .unwrap();
        assert_eq!(out["count"], json!(3));
        let out = CounterWorker
            .invoke(&values(&[("items", json!("abcd"))]), &params)
            .unwrap();
        assert_eq!(out["count"], json!(4));
        let out = CounterWorker.invoke(&Values::new(), &params).unwrap();
        assert_eq!(out["count"], json!(0));
    }

    #[test]
    fn file_copy_copies_and_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.txt");
        fs::write(&source, "data").unwrap();
        let dest = dir.path().join("nested/out.txt");

        let out = FileCopyWorker
            .invoke(
                &values(&[
                    ("source_file", json!(source.display().to_string())),
                    ("destination_path", json!(dest.display().to_string())),
                ]),
                &Values::new(),
            )
            .unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "data");
        assert!(out["copied_file"].as_str().unwrap().ends_with("out.txt"));
    }

    #[test]
    fn file_copy_requires_both_paths() {
        let err = FileCopyWorker
            .invoke(&values(&[("source_file", json!("a"))]), &Values::new())
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidInput(_)));
    }

    #[test]
    fn closures_are_workers() {
        let mut registry = WorkerRegistry::new();
        registry.register("upper", |inputs: &Values, _: &Values| -> Result<Values, WorkerError> {
            let text = inputs["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(Values::from([("text".to_string(), json!(text))]))
        });
        let worker = registry.get("upper").unwrap();
        let out = worker
            .invoke(&values(&[("text", json!("abc"))]), &Values::new())
            .unwrap();
        assert_eq!(out["text"], json!("ABC"));
    }

    #[test]
    fn timeout_detaches_slow_worker() {
        let worker: Arc<dyn WorkerCapability> = Arc::new(SleepWorker);
        let outcome = invoke_with_timeout(
            "sleep_worker",
            worker,
            Values::new(),
            values(&[("millis", json!(500))]),
            Duration::from_millis(20),
        );
        assert!(matches!(outcome, Invocation::TimedOut));
    }

    #[test]
    fn fast_worker_finishes_within_timeout() {
        let worker: Arc<dyn WorkerCapability> = Arc::new(SleepWorker);
        let outcome = invoke_with_timeout(
            "sleep_worker",
            worker,
            Values::new(),
            values(&[("millis", json!(1))]),
            Duration::from_secs(5),
        );
        match outcome {
            Invocation::Finished(Ok(out)) => assert_eq!(out["slept_ms"], json!(1)),
            other => panic!("expected finished, got {other:?}"),
        }
    }

    #[test]
    fn panicking_worker_is_lost() {
        let worker: Arc<dyn WorkerCapability> =
            Arc::new(|_: &Values, _: &Values| -> Result<Values, WorkerError> { panic!("boom") });
        let outcome = invoke_with_timeout(
            "boom",
            worker,
            Values::new(),
            Values::new(),
            Duration::from_secs(5),
        );
        assert!(matches!(outcome, Invocation::Lost(_)));
    }
}
