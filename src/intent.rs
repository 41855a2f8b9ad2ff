//! Requirement extraction.
//!
//! Turns raw request text into the short description and keyword list the
//! matcher consumes. [`KeywordExtractor`] is the built-in heuristic; any
//! other [`RequirementExtractor`] can be injected into the orchestrator.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::matcher::{DEFAULT_MIN_TOKEN_LEN, tokenize};

const MAX_DESCRIPTION_CHARS: usize = 100;

static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^.*?[.!?]+(?:\s|$)").expect("sentence pattern is valid"));

/// What the user asked for, in matcher-ready form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Short description, at most 100 characters.
    pub description: String,
    pub keywords: Vec<String>,
    /// Restricts matching to one recipe category when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Requirement {
    pub fn new(description: impl Into<String>, keywords: Vec<String>) -> Self {
        Self {
            description: description.into(),
            keywords,
            category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Upstream collaborator that distills raw text into a [`Requirement`].
pub trait RequirementExtractor: Send + Sync {
    fn extract(&self, raw: &str) -> Requirement;
}

/// Rule-based extractor: first sentence as description, every non-stop-word
/// token as a keyword.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordExtractor;

impl RequirementExtractor for KeywordExtractor {
    fn extract(&self, raw: &str) -> Requirement {
        Requirement::new(distill(raw), tokenize(raw, DEFAULT_MIN_TOKEN_LEN))
    }
}

/// First sentence of `text`, truncated to 100 characters with an ellipsis.
fn distill(text: &str) -> String {
    let text = text.trim();
    let first = SENTENCE
        .find(text)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(text);

    if first.chars().count() > MAX_DESCRIPTION_CHARS {
        let cut: String = first.chars().take(MAX_DESCRIPTION_CHARS).collect();
        format!("{}...", cut.trim_end())
    } else {
        first.to_string()
    }
}
