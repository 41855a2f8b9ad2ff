use std::collections::{BTreeMap, BTreeSet, HashSet};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::plan::ResourceRequirements;

/// A versioned, declarative description of how to do one class of task.
///
/// Recipes are authored as TOML and are immutable once published under a
/// given `id` + `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// `<category>.<name>`, e.g. `audio.normalize`.
    pub id: String,
    pub version: Version,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_approval_required")]
    pub approval_required: bool,
    #[serde(rename = "match")]
    pub matching: MatchSpec,
    #[serde(default)]
    pub inputs: Vec<ContractField>,
    #[serde(default)]
    pub outputs: Vec<ContractField>,
    pub steps: Vec<PipelineStep>,
}

fn default_approval_required() -> bool {
    true
}

/// How a requirement is matched against this recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSpec {
    pub category: String,
    /// Action words. Weighted higher than plain keywords.
    #[serde(default)]
    pub verbs: Vec<String>,
    /// Objects and entities the recipe works with.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.7
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    File,
    Folder,
    #[default]
    String,
    Integer,
    Boolean,
    Any,
}

/// One named field of an input or output contract. Kinds are advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractField {
    pub name: String,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

fn default_required() -> bool {
    true
}

/// What happens to the rest of the pipeline when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the pipeline and fail the job.
    #[default]
    Abort,
}

/// Per-step resource declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceProfile {
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
    #[serde(default)]
    pub gpu_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,
    /// Identifier of the worker capability to invoke.
    pub worker: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub resources: ResourceProfile,
}

/// A step input that nothing upstream provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiedInput {
    pub step_id: String,
    pub input: String,
}

impl Recipe {
    pub fn category(&self) -> &str {
        &self.matching.category
    }

    /// Lowercased match vocabulary: verbs, keywords and the category.
    pub fn vocabulary(&self) -> HashSet<String> {
        self.matching
            .verbs
            .iter()
            .chain(&self.matching.keywords)
            .chain(std::iter::once(&self.matching.category))
            .map(|w| w.to_lowercase())
            .collect()
    }

    pub fn resource_summary(&self) -> ResourceRequirements {
        ResourceRequirements::aggregate(&self.steps)
    }

    /// Walk the steps in order and report every input that is neither in
    /// `available` nor produced by an earlier step.
    pub fn unsatisfied_inputs(&self, mut available: BTreeSet<String>) -> Vec<UnsatisfiedInput> {
        let mut missing = Vec::new();
        for step in &self.steps {
            for input in &step.inputs {
                if !available.contains(input) {
                    missing.push(UnsatisfiedInput {
                        step_id: step.id.clone(),
                        input: input.clone(),
                    });
                }
            }
            available.extend(step.outputs.iter().cloned());
        }
        missing
    }

    /// Structural checks run at publish time. Returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.id.split_once('.') {
            Some((category, name)) if !category.is_empty() && !name.is_empty() => {}
            _ => problems.push(format!(
                "id must be <category>.<name> (e.g. audio.normalize): {}",
                self.id
            )),
        }

        if !(0.0..=1.0).contains(&self.matching.threshold) {
            problems.push(format!(
                "threshold must be within [0.0, 1.0]: {}",
                self.matching.threshold
            ));
        }

        if self.steps.is_empty() {
            problems.push("pipeline must contain at least one step".to_string());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                problems.push("pipeline step must have an id".to_string());
            } else if !seen.insert(step.id.as_str()) {
                problems.push(format!("duplicate step id: {}", step.id));
            }
            if step.worker.is_empty() {
                problems.push(format!("step {} must name a worker", step.id));
            }
        }

        let contract: BTreeSet<String> = self.inputs.iter().map(|f| f.name.clone()).collect();
        for gap in self.unsatisfied_inputs(contract) {
            problems.push(format!(
                "step {} references undefined input: {}",
                gap.step_id, gap.input
            ));
        }

        let produced: HashSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.outputs.iter().map(String::as_str))
            .collect();
        for output in &self.outputs {
            if !produced.contains(output.name.as_str()) {
                problems.push(format!(
                    "output {} is not produced by any pipeline step",
                    output.name
                ));
            }
        }

        problems
    }
}
