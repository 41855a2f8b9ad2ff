//! Append-only run events.
//!
//! Each run owns one [`EventLog`]. Only the executor appends to it; everyone
//! else reads the persisted sequence through [`RunEvents`].

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.halted")]
    JobHalted,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "worker.invoked")]
    WorkerInvoked,
    #[serde(rename = "worker.output")]
    WorkerOutput,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::JobStarted,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::JobHalted,
        EventKind::StepStarted,
        EventKind::StepCompleted,
        EventKind::StepFailed,
        EventKind::WorkerInvoked,
        EventKind::WorkerOutput,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::JobStarted => "job.started",
            EventKind::JobCompleted => "job.completed",
            EventKind::JobFailed => "job.failed",
            EventKind::JobHalted => "job.halted",
            EventKind::StepStarted => "step.started",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepFailed => "step.failed",
            EventKind::WorkerInvoked => "worker.invoked",
            EventKind::WorkerOutput => "worker.output",
        }
    }

    /// Kinds that close a run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::JobCompleted | EventKind::JobFailed | EventKind::JobHalted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

/// One immutable, timestamped fact about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Halted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Halted => write!(f, "halted"),
        }
    }
}

/// Durable summary of one execution attempt of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub job_id: String,
    pub plan_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(job_id: &str, plan_id: &str) -> Self {
        Self {
            id: format!("run-{}", Uuid::new_v4()),
            job_id: job_id.to_string(),
            plan_id: plan_id.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Destination for appended events.
pub trait EventSink: Send {
    fn write(&mut self, event: &Event) -> Result<()>;
}

/// One compact JSON object per line, flushed after every event.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn new(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }
}

impl EventSink for JsonlSink {
    fn write(&mut self, event: &Event) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Shared in-memory buffer; clones see the same events.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl EventSink for MemorySink {
    fn write(&mut self, event: &Event) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event.clone());
        Ok(())
    }
}

/// Write side of a single run's event sequence.
pub struct EventLog {
    run_id: String,
    job_id: String,
    sink: Box<dyn EventSink>,
    appended: usize,
}

impl EventLog {
    pub fn new(run_id: &str, job_id: &str, sink: Box<dyn EventSink>) -> Self {
        Self {
            run_id: run_id.to_string(),
            job_id: job_id.to_string(),
            sink,
            appended: 0,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn len(&self) -> usize {
        self.appended
    }

    pub fn is_empty(&self) -> bool {
        self.appended == 0
    }

    pub(crate) fn append(
        &mut self,
        kind: EventKind,
        step_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let event = Event {
            kind,
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            job_id: self.job_id.clone(),
            step_id: step_id.map(str::to_string),
            payload,
        };
        self.sink.write(&event)?;
        self.appended += 1;
        trace!(run_id = %self.run_id, %kind, "Appended event");
        Ok(event)
    }
}

/// Parse a JSONL event stream. Blank and malformed lines are skipped.
pub fn read_jsonl(reader: impl BufRead) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed event"),
        }
    }
    Ok(events)
}

/// Monitoring view over a run's events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub job_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps_started: usize,
    pub steps_completed: usize,
    pub failed_step: Option<String>,
    pub event_count: usize,
}

/// Read side of a run's event sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunEvents {
    events: Vec<Event>,
}

impl RunEvents {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn all(&self) -> &[Event] {
        &self.events
    }

    pub fn into_inner(self) -> Vec<Event> {
        self.events
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<&Event> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }

    pub fn for_step(&self, step_id: &str) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.step_id.as_deref() == Some(step_id))
            .collect()
    }

    pub fn latest(&self) -> Option<&Event> {
        self.events.last()
    }

    /// The last `n` events, oldest first.
    pub fn tail(&self, n: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }

    pub fn summary(&self) -> Option<RunSummary> {
        let first = self.events.first()?;
        let terminal = self.events.iter().rev().find(|e| e.kind.is_terminal());

        let status = match terminal.map(|e| e.kind) {
            Some(EventKind::JobCompleted) => RunStatus::Completed,
            Some(EventKind::JobFailed) => RunStatus::Failed,
            Some(EventKind::JobHalted) => RunStatus::Halted,
            _ => RunStatus::Running,
        };

        Some(RunSummary {
            run_id: first.run_id.clone(),
            job_id: first.job_id.clone(),
            status,
            started_at: self
                .events
                .iter()
                .find(|e| e.kind == EventKind::JobStarted)
                .map(|e| e.timestamp),
            finished_at: terminal.map(|e| e.timestamp),
            steps_started: self.of_kind(EventKind::StepStarted).len(),
            steps_completed: self.of_kind(EventKind::StepCompleted).len(),
            failed_step: self
                .of_kind(EventKind::StepFailed)
                .last()
                .and_then(|e| e.step_id.clone()),
            event_count: self.events.len(),
        })
    }
}
