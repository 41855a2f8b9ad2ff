//! Versioned recipe storage.
//!
//! The registry is built once at startup (from a directory of TOML files or
//! programmatically) and is read-only while jobs execute, so it can be shared
//! freely between threads.

mod recipe;

pub use recipe::{
    ContractField, FailurePolicy, FieldKind, MatchSpec, PipelineStep, Recipe, ResourceProfile,
    UnsatisfiedInput,
};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use tracing::{debug, warn};

use crate::error::{ConciergeError, Result};

#[derive(Debug, Clone, Default)]
pub struct RecipeRegistry {
    recipes: BTreeMap<String, BTreeMap<Version, Recipe>>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a recipe. A published id + version can never be
    /// replaced.
    pub fn publish(&mut self, recipe: Recipe) -> Result<()> {
        let problems = recipe.validate();
        if !problems.is_empty() {
            return Err(ConciergeError::InvalidRecipe {
                recipe_id: recipe.id,
                problems,
            });
        }

        let versions = self.recipes.entry(recipe.id.clone()).or_default();
        if versions.contains_key(&recipe.version) {
            return Err(ConciergeError::RecipeExists {
                id: recipe.id,
                version: recipe.version.to_string(),
            });
        }

        debug!(recipe_id = %recipe.id, version = %recipe.version, "Published recipe");
        versions.insert(recipe.version.clone(), recipe);
        Ok(())
    }

    pub fn get(&self, id: &str, version: &Version) -> Option<&Recipe> {
        self.recipes.get(id).and_then(|v| v.get(version))
    }

    /// Highest published version of `id`.
    pub fn latest(&self, id: &str) -> Option<&Recipe> {
        self.recipes
            .get(id)
            .and_then(|v| v.last_key_value())
            .map(|(_, r)| r)
    }

    /// Every published version, ordered by id then version.
    pub fn list(&self, category: Option<&str>) -> Vec<&Recipe> {
        self.recipes
            .values()
            .flat_map(|versions| versions.values())
            .filter(|r| category.is_none_or(|c| r.category() == c))
            .collect()
    }

    /// Latest version of each recipe id, ordered by id. This is the set the
    /// matcher scores.
    pub fn candidates(&self, category: Option<&str>) -> Vec<&Recipe> {
        self.recipes
            .values()
            .filter_map(|versions| versions.values().next_back())
            .filter(|r| category.is_none_or(|c| r.category() == c))
            .collect()
    }

    /// Latest recipes matching every given criterion; `verbs` and `keywords`
    /// match when any listed word is declared.
    pub fn search(&self, category: Option<&str>, verbs: &[&str], keywords: &[&str]) -> Vec<&Recipe> {
        self.candidates(category)
            .into_iter()
            .filter(|r| verbs.is_empty() || verbs.iter().any(|v| r.matching.verbs.iter().any(|rv| rv == v)))
            .filter(|r| {
                keywords.is_empty()
                    || keywords
                        .iter()
                        .any(|k| r.matching.keywords.iter().any(|rk| rk == k))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.recipes.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every `*.toml` file below `dir`. Unreadable or invalid files are
    /// skipped with a warning; a missing directory yields an empty registry.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::new();
        if !dir.exists() {
            return Ok(registry);
        }

        let mut files = Vec::new();
        collect_toml_files(dir, &mut files)?;
        files.sort();

        for path in files {
            let parsed = fs::read_to_string(&path)
                .map_err(ConciergeError::from)
                .and_then(|text| toml::from_str::<Recipe>(&text).map_err(ConciergeError::from));
            match parsed.and_then(|recipe| registry.publish(recipe)) {
                Ok(()) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping recipe file"),
            }
        }

        Ok(registry)
    }

    /// Write `recipe` into `dir` using the `<category>/<name>/v<version>.toml`
    /// layout and publish it. Fails if that version already exists.
    pub fn install(&mut self, dir: &Path, recipe: Recipe) -> Result<PathBuf> {
        let path = recipe_path(dir, &recipe)?;
        if path.exists() || self.get(&recipe.id, &recipe.version).is_some() {
            return Err(ConciergeError::RecipeExists {
                id: recipe.id,
                version: recipe.version.to_string(),
            });
        }

        let text = toml::to_string_pretty(&recipe)?;
        self.publish(recipe)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, text)?;
        Ok(path)
    }
}

fn recipe_path(dir: &Path, recipe: &Recipe) -> Result<PathBuf> {
    let (category, name) = recipe
        .id
        .split_once('.')
        .ok_or_else(|| ConciergeError::InvalidRecipe {
            recipe_id: recipe.id.clone(),
            problems: vec!["id must be <category>.<name>".to_string()],
        })?;
    Ok(dir
        .join(category)
        .join(name)
        .join(format!("v{}.toml", recipe.version)))
}

fn collect_toml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_toml_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            out.push(path);
        }
    }
    Ok(())
}
