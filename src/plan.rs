use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::registry::{PipelineStep, Recipe};

/// Aggregated resource needs of a whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    pub total_cpu_cores: u32,
    pub total_memory_mb: u64,
    pub total_disk_mb: u64,
    pub gpu_required: bool,
}

impl ResourceRequirements {
    /// Sum CPU, memory and disk across steps, saturating at the type's
    /// maximum; GPU is required if any step requires it.
    pub fn aggregate(steps: &[PipelineStep]) -> Self {
        steps.iter().fold(Self::default(), |acc, step| Self {
            total_cpu_cores: acc.total_cpu_cores.saturating_add(step.resources.cpu_cores),
            total_memory_mb: acc.total_memory_mb.saturating_add(step.resources.memory_mb),
            total_disk_mb: acc.total_disk_mb.saturating_add(step.resources.disk_mb),
            gpu_required: acc.gpu_required || step.resources.gpu_required,
        })
    }
}

/// A recipe matched to a job, frozen at match time.
///
/// The pipeline is copied by value so later recipe changes cannot alter an
/// in-flight job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub recipe_id: String,
    pub recipe_version: Version,
    pub confidence: f64,
    /// The recipe's threshold when the plan was made.
    pub threshold: f64,
    pub approval_required: bool,
    pub resolved_inputs: BTreeMap<String, serde_json::Value>,
    pub steps: Vec<PipelineStep>,
    pub resources: ResourceRequirements,
    /// SHA-256 over the plan's canonical content.
    pub hash: String,
}

impl Plan {
    pub fn new(
        job_id: &str,
        recipe: &Recipe,
        confidence: f64,
        resolved_inputs: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut plan = Self {
            id: format!("plan-{}", Uuid::new_v4()),
            job_id: job_id.to_string(),
            created_at: Utc::now(),
            recipe_id: recipe.id.clone(),
            recipe_version: recipe.version.clone(),
            confidence,
            threshold: recipe.matching.threshold,
            approval_required: recipe.approval_required,
            resolved_inputs,
            steps: recipe.steps.clone(),
            resources: recipe.resource_summary(),
            hash: String::new(),
        };
        plan.hash = plan.compute_hash();
        plan
    }

    pub fn meets_threshold(&self) -> bool {
        self.confidence >= self.threshold
    }

    /// Hash of everything that determines what the plan will do and whether
    /// it needs approval. Ids and timestamps are excluded so equal plans hash
    /// equally.
    pub fn compute_hash(&self) -> String {
        let canonical = serde_json::json!({
            "job_id": self.job_id,
            "recipe_id": self.recipe_id,
            "recipe_version": self.recipe_version.to_string(),
            "confidence": self.confidence,
            "threshold": self.threshold,
            "approval_required": self.approval_required,
            "resolved_inputs": self.resolved_inputs,
            "steps": self.steps,
            "resources": self.resources,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the stored hash still matches the content.
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}
