use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MatcherConfig;
use crate::error::{ConciergeError, Result};
use crate::intent::Requirement;
use crate::plan::Plan;
use crate::registry::{Recipe, RecipeRegistry};
use crate::state_machine::Job;

pub const DEFAULT_MIN_TOKEN_LEN: usize = 2;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "in", "on", "at", "to", "from", "is", "are", "be",
];

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+").expect("word pattern is valid"));

/// Lowercase, split into words, drop stop words and short tokens, and
/// de-duplicate keeping first-seen order.
pub fn tokenize(text: &str, min_len: usize) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut seen = HashSet::new();
    WORD.find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|w| w.chars().count() >= min_len && !STOP_WORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .map(str::to_string)
        .collect()
}

/// A recipe that cleared its own threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub recipe_id: String,
    pub version: semver::Version,
    pub score: f64,
}

/// How to settle near-ties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// Surface ambiguity to the caller.
    #[default]
    Strict,
    /// Take the best candidate, breaking ties by recipe id.
    Forced,
    /// Take this recipe, provided it cleared its threshold.
    Pick(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(Candidate),
    Ambiguous(Vec<Candidate>),
    NoMatch,
}

/// Scores recipes against a requirement and turns the winner into a plan.
pub struct Matcher<'a> {
    registry: &'a RecipeRegistry,
    config: &'a MatcherConfig,
}

impl<'a> Matcher<'a> {
    pub fn new(registry: &'a RecipeRegistry, config: &'a MatcherConfig) -> Self {
        Self { registry, config }
    }

    /// Requirement tokens: description words plus extracted keywords.
    pub fn requirement_tokens(&self, requirement: &Requirement) -> Vec<String> {
        let mut text = requirement.description.clone();
        for keyword in &requirement.keywords {
            text.push(' ');
            text.push_str(keyword);
        }
        tokenize(&text, self.config.min_token_len)
    }

    /// Fraction of tokens in the recipe's vocabulary, plus a bonus for each
    /// token that is one of its verbs. Clamped to 1.0.
    pub fn score(&self, tokens: &[String], recipe: &Recipe) -> f64 {
        if tokens.is_empty() {
            return 0.0;
        }

        let vocabulary = recipe.vocabulary();
        let verbs: HashSet<String> = recipe
            .matching
            .verbs
            .iter()
            .map(|v| v.to_lowercase())
            .collect();

        let matched = tokens.iter().filter(|t| vocabulary.contains(*t)).count();
        let verb_hits = tokens.iter().filter(|t| verbs.contains(*t)).count();

        let base = matched as f64 / tokens.len() as f64;
        (base + verb_hits as f64 * self.config.verb_bonus).min(1.0)
    }

    /// Every recipe that clears its own threshold, best first, ties broken
    /// by recipe id.
    pub fn rank(&self, requirement: &Requirement) -> Vec<Candidate> {
        let tokens = self.requirement_tokens(requirement);
        let mut survivors: Vec<Candidate> = self
            .registry
            .candidates(requirement.category.as_deref())
            .into_iter()
            .filter_map(|recipe| {
                let score = self.score(&tokens, recipe);
                debug!(recipe_id = %recipe.id, score, threshold = recipe.matching.threshold, "Scored recipe");
                (score >= recipe.matching.threshold).then(|| Candidate {
                    recipe_id: recipe.id.clone(),
                    version: recipe.version.clone(),
                    score,
                })
            })
            .collect();

        survivors.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.recipe_id.cmp(&b.recipe_id))
        });
        survivors
    }

    pub fn select(&self, requirement: &Requirement, selection: &Selection) -> MatchOutcome {
        let ranked = self.rank(requirement);
        let Some(top) = ranked.first() else {
            return MatchOutcome::NoMatch;
        };

        match selection {
            Selection::Pick(recipe_id) => ranked
                .iter()
                .find(|c| &c.recipe_id == recipe_id)
                .cloned()
                .map_or(MatchOutcome::NoMatch, MatchOutcome::Matched),
            Selection::Forced => MatchOutcome::Matched(top.clone()),
            Selection::Strict => {
                let contenders: Vec<Candidate> = ranked
                    .iter()
                    .take_while(|c| top.score - c.score < self.config.ambiguity_margin)
                    .cloned()
                    .collect();
                if contenders.len() > 1 {
                    MatchOutcome::Ambiguous(contenders)
                } else {
                    MatchOutcome::Matched(top.clone())
                }
            }
        }
    }

    /// Match `job` and build its plan. Ambiguity and no-match are errors so
    /// the caller can re-specify.
    pub fn plan(&self, job: &Job, selection: &Selection) -> Result<Plan> {
        let winner = match self.select(&job.requirement, selection) {
            MatchOutcome::Matched(candidate) => candidate,
            MatchOutcome::Ambiguous(candidates) => {
                return Err(ConciergeError::AmbiguousMatch { candidates });
            }
            MatchOutcome::NoMatch => return Err(ConciergeError::NoMatch),
        };

        let recipe = self
            .registry
            .get(&winner.recipe_id, &winner.version)
            .ok_or_else(|| ConciergeError::RecipeNotFound(winner.recipe_id.clone()))?;

        let resolved = resolve_inputs(&job.inputs, recipe)?;
        Ok(Plan::new(&job.id, recipe, winner.score, resolved))
    }
}

/// Resolve job inputs by name against the recipe's input contract, then
/// check that every step input is reachable from them.
fn resolve_inputs(
    known: &BTreeMap<String, serde_json::Value>,
    recipe: &Recipe,
) -> Result<BTreeMap<String, serde_json::Value>> {
    let mut resolved = BTreeMap::new();
    let mut missing = Vec::new();

    for field in &recipe.inputs {
        if let Some(value) = known.get(&field.name) {
            resolved.insert(field.name.clone(), value.clone());
        } else if let Some(default) = &field.default {
            resolved.insert(field.name.clone(), default.clone());
        } else if field.required {
            missing.push(field.name.clone());
        }
    }

    let available: BTreeSet<String> = resolved.keys().cloned().collect();
    for gap in recipe.unsatisfied_inputs(available) {
        if !missing.contains(&gap.input) {
            missing.push(gap.input);
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(ConciergeError::UnresolvedInputs {
            recipe_id: recipe.id.clone(),
            missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ContractField;
    use crate::state_machine::Job;
    use crate::test_support::recipe;

    fn registry(recipes: Vec<Recipe>) -> RecipeRegistry {
        let mut registry = RecipeRegistry::new();
        for r in recipes {
            registry.publish(r).unwrap();
        }
        registry
    }

    fn requirement(words: &[&str]) -> Requirement {
        Requirement::new("", words.iter().map(|w| w.to_string()).collect())
    }

    #[test]
    fn tokenize_drops_stop_words_and_short_tokens() {
        assert_eq!(
            tokenize("Normalize THE audio, a b to it!", 2),
            vec!["normalize", "audio", "it"]
        );
        assert_eq!(tokenize("go go go", 2), vec!["go"]);
        assert_eq!(tokenize("go it", 3), Vec::<String>::new());
    }

    #[test]
    fn verb_match_earns_bonus() {
        let config = MatcherConfig::default();
        let reg = registry(vec![recipe("audio.normalize", "1.0.0", &["normalize"], &["audio"], 0.5)]);
        let matcher = Matcher::new(&reg, &config);

        match matcher.select(&requirement(&["normalize", "audio"]), &Selection::Strict) {
            MatchOutcome::Matched(c) => {
                assert_eq!(c.recipe_id, "audio.normalize");
                assert!(c.score >= 0.5 + config.verb_bonus);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn score_is_fraction_plus_verb_bonus() {
        let config = MatcherConfig::default();
        let reg = RecipeRegistry::new();
        let matcher = Matcher::new(&reg, &config);
        let r = recipe("audio.extract", "1.0.0", &["extract"], &["stems"], 0.1);

        let tokens: Vec<String> = ["extract", "vocals", "song", "track"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let score = matcher.score(&tokens, &r);
        assert!((score - (0.25 + 0.2)).abs() < 1e-9);
        assert_eq!(matcher.score(&[], &r), 0.0);
    }

    #[test]
    fn empty_registry_is_no_match() {
        let config = MatcherConfig::default();
        let reg = RecipeRegistry::new();
        let matcher = Matcher::new(&reg, &config);
        assert_eq!(
            matcher.select(&requirement(&["normalize", "audio"]), &Selection::Strict),
            MatchOutcome::NoMatch
        );
    }

    #[test]
    fn below_threshold_is_discarded() {
        let config = MatcherConfig::default();
        let reg = registry(vec![recipe("video.trim", "1.0.0", &["trim"], &["video"], 0.9)]);
        let matcher = Matcher::new(&reg, &config);
        assert_eq!(
            matcher.select(&requirement(&["trim", "audio", "file", "now"]), &Selection::Strict),
            MatchOutcome::NoMatch
        );
    }

    #[test]
    fn near_tie_is_ambiguous_unless_forced() {
        let config = MatcherConfig::default();
        let reg = registry(vec![
            recipe("audio.boost", "1.0.0", &["normalize"], &["audio"], 0.5),
            recipe("audio.normalize", "1.0.0", &["normalize"], &["audio"], 0.5),
        ]);
        let matcher = Matcher::new(&reg, &config);
        let req = requirement(&["normalize", "audio"]);

        match matcher.select(&req, &Selection::Strict) {
            MatchOutcome::Ambiguous(candidates) => {
                let ids: Vec<_> = candidates.iter().map(|c| c.recipe_id.as_str()).collect();
                assert_eq!(ids, vec!["audio.boost", "audio.normalize"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }

        match matcher.select(&req, &Selection::Forced) {
            MatchOutcome::Matched(c) => assert_eq!(c.recipe_id, "audio.boost"),
            other => panic!("expected forced match, got {other:?}"),
        }

        match matcher.select(&req, &Selection::Pick("audio.normalize".into())) {
            MatchOutcome::Matched(c) => assert_eq!(c.recipe_id, "audio.normalize"),
            other => panic!("expected picked match, got {other:?}"),
        }

        assert_eq!(
            matcher.select(&req, &Selection::Pick("video.trim".into())),
            MatchOutcome::NoMatch
        );
    }

    #[test]
    fn clear_winner_outside_margin() {
        let config = MatcherConfig::default();
        let reg = registry(vec![
            recipe("audio.normalize", "1.0.0", &["normalize"], &["audio", "loudness"], 0.3),
            recipe("audio.extract", "1.0.0", &["extract"], &["audio"], 0.3),
        ]);
        let matcher = Matcher::new(&reg, &config);
        let req = requirement(&["normalize", "audio", "loudness", "track"]);

        // normalize: 3/4 + 0.2 = 0.95, extract: 1/4 = 0.25 (discarded)
        match matcher.select(&req, &Selection::Strict) {
            MatchOutcome::Matched(c) => assert_eq!(c.recipe_id, "audio.normalize"),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn ambiguity_margin_is_configurable() {
        let config = MatcherConfig {
            ambiguity_margin: 0.0,
            ..MatcherConfig::default()
        };
        let reg = registry(vec![
            recipe("audio.boost", "1.0.0", &["normalize"], &["audio"], 0.5),
            recipe("audio.normalize", "1.0.0", &["normalize"], &["audio"], 0.5),
        ]);
        let matcher = Matcher::new(&reg, &config);
        assert!(matches!(
            matcher.select(&requirement(&["normalize", "audio"]), &Selection::Strict),
            MatchOutcome::Matched(_)
        ));
    }

    #[test]
    fn matching_is_deterministic() {
        let config = MatcherConfig::default();
        let reg = registry(vec![
            recipe("audio.normalize", "1.0.0", &["normalize"], &["audio"], 0.3),
            recipe("audio.extract", "1.0.0", &["extract"], &["audio", "stems"], 0.3),
            recipe("audio.mix", "1.0.0", &["mix"], &["audio"], 0.3),
        ]);
        let matcher = Matcher::new(&reg, &config);
        let req = requirement(&["extract", "audio", "stems", "mix"]);
        let first = matcher.rank(&req);
        for _ in 0..10 {
            assert_eq!(matcher.rank(&req), first);
        }
    }

    #[test]
    fn category_hint_filters_candidates() {
        let config = MatcherConfig::default();
        let reg = registry(vec![
            recipe("audio.trim", "1.0.0", &["trim"], &["clip"], 0.3),
            recipe("video.trim", "1.0.0", &["trim"], &["clip"], 0.3),
        ]);
        let matcher = Matcher::new(&reg, &config);
        let req = requirement(&["trim", "clip"]).with_category("video");
        match matcher.select(&req, &Selection::Strict) {
            MatchOutcome::Matched(c) => assert_eq!(c.recipe_id, "video.trim"),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn plan_resolves_inputs_and_defaults() {
        let config = MatcherConfig::default();
        let mut r = recipe("text.echo", "1.0.0", &["echo"], &["message"], 0.3);
        r.inputs = vec![
            ContractField {
                name: "message".into(),
                kind: Default::default(),
                description: String::new(),
                required: true,
                default: None,
            },
            ContractField {
                name: "suffix".into(),
                kind: Default::default(),
                description: String::new(),
                required: false,
                default: Some(serde_json::json!("!")),
            },
        ];
        r.steps[0].inputs = vec!["message".into(), "suffix".into()];
        let reg = registry(vec![r]);
        let matcher = Matcher::new(&reg, &config);

        let job = Job::new(
            requirement(&["echo", "message"]),
            BTreeMap::from([("message".to_string(), serde_json::json!("hello"))]),
        );
        let plan = matcher.plan(&job, &Selection::Strict).unwrap();
        assert_eq!(plan.job_id, job.id);
        assert_eq!(plan.recipe_id, "text.echo");
        assert_eq!(plan.resolved_inputs["message"], serde_json::json!("hello"));
        assert_eq!(plan.resolved_inputs["suffix"], serde_json::json!("!"));

        let bare = Job::new(requirement(&["echo", "message"]), BTreeMap::new());
        let err = matcher.plan(&bare, &Selection::Strict).unwrap_err();
        match err {
            ConciergeError::UnresolvedInputs { recipe_id, missing } => {
                assert_eq!(recipe_id, "text.echo");
                assert_eq!(missing, vec!["message".to_string()]);
            }
            other => panic!("expected unresolved inputs, got {other:?}"),
        }
    }

    #[test]
    fn plan_surfaces_ambiguity_and_no_match() {
        let config = MatcherConfig::default();
        let reg = registry(vec![
            recipe("audio.boost", "1.0.0", &["normalize"], &["audio"], 0.5),
            recipe("audio.normalize", "1.0.0", &["normalize"], &["audio"], 0.5),
        ]);
        let matcher = Matcher::new(&reg, &config);

        let job = Job::new(requirement(&["normalize", "audio"]), BTreeMap::new());
        assert!(matches!(
            matcher.plan(&job, &Selection::Strict),
            Err(ConciergeError::AmbiguousMatch { candidates }) if candidates.len() == 2
        ));

        let unrelated = Job::new(requirement(&["compile", "rust"]), BTreeMap::new());
        assert!(matches!(
            matcher.plan(&unrelated, &Selection::Strict),
            Err(ConciergeError::NoMatch)
        ));
    }
}
