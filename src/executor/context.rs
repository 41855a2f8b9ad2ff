use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use super::worker::Values;
use crate::error::StepError;
use crate::events::{Event, EventKind};
use crate::plan::Plan;
use crate::registry::PipelineStep;

/// Name → value map threaded through a run.
///
/// Seeded from the plan's resolved inputs and extended by each step's
/// declared outputs. Later writes to a name replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    values: BTreeMap<String, Value>,
}

impl ExecutionContext {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            values: plan.resolved_inputs.clone(),
        }
    }

    /// Rebuild the context a run reached by applying the outputs of every
    /// `step.completed` event, in order, over the plan's inputs.
    pub fn replay<'a>(plan: &Plan, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut context = Self::from_plan(plan);
        for event in events {
            if event.kind != EventKind::StepCompleted {
                continue;
            }
            if let Some(outputs) = event.payload.get("outputs").and_then(Value::as_object) {
                for (name, value) in outputs {
                    context.values.insert(name.clone(), value.clone());
                }
            }
        }
        context
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Collect the step's declared inputs. Fails on the first one missing.
    pub(crate) fn gather(&self, step: &PipelineStep) -> Result<Values, StepError> {
        step.inputs
            .iter()
            .map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
                    .ok_or_else(|| StepError::MissingInput {
                        step_id: step.id.clone(),
                        input: name.clone(),
                    })
            })
            .collect()
    }

    /// Keep only the step's declared outputs, failing if any is absent.
    pub(crate) fn declared_outputs(
        step: &PipelineStep,
        produced: &Values,
    ) -> Result<Values, StepError> {
        let missing: Vec<&str> = step
            .outputs
            .iter()
            .filter(|name| !produced.contains_key(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(StepError::WorkerFailure {
                step_id: step.id.clone(),
                worker_id: step.worker.clone(),
                message: format!("declared outputs not produced: {}", missing.join(", ")),
            });
        }

        Ok(step
            .outputs
            .iter()
            .filter_map(|name| produced.get(name).map(|v| (name.clone(), v.clone())))
            .collect())
    }

    pub(crate) fn extend(&mut self, outputs: Values) {
        self.values.extend(outputs);
    }
}
