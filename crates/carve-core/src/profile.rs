//! Generator profiles: named synthesis setups (model, prompts, budgets)
//! stored as `profiles/<name>.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::synthesis::SynthesisConfig;

pub const DEFAULT_PROFILE: &str = "default";

const DEFAULT_SYSTEM_PROMPT: &str = "You write CSS selector rules that extract the main textual content of web pages. \
Given HTML samples from one site section and the text a human expects from each, answer with four selector lists: \
`root` (the subtree(s) containing the content), `keep` (elements to keep inside root, empty for everything), \
`drop` (boilerplate to remove: navigation, ads, share widgets, related links) and `unwrap` (inline wrappers whose \
text belongs to the surrounding words). Prefer stable selectors (semantic tags, ids, long-lived class names) that \
generalize across pages of the section.";

const DEFAULT_REFLECTION_PROMPT: &str = "Your previous rules were applied to the samples and scored against the expected text. \
Diffs mark text that should not be there as {+added+} and text that is missing as [-removed-]. \
Revise the rules so the extracted text matches the expected text. Keep what works.";

/// Named configuration of the synthesis loop and its proposal model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorProfile {
    /// Filled from the file name when loaded from disk.
    #[serde(skip_deserializing)]
    pub name: String,
    pub model: String,
    pub base_url: String,
    pub system_prompt: String,
    /// Appended to the system prompt on refinement rounds. Without it the
    /// loop re-proposes from scratch instead of reflecting.
    pub reflection_prompt: Option<String>,
    pub acceptance_threshold: f64,
    pub max_iterations: u32,
    pub max_prompt_samples: usize,
    /// Per-sample HTML budget in characters after cleaning.
    pub max_snippet_chars: usize,
}

impl Default for GeneratorProfile {
    fn default() -> Self {
        let synthesis = SynthesisConfig::default();
        Self {
            name: DEFAULT_PROFILE.to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            reflection_prompt: Some(DEFAULT_REFLECTION_PROMPT.to_string()),
            acceptance_threshold: synthesis.acceptance_threshold,
            max_iterations: synthesis.max_iterations,
            max_prompt_samples: synthesis.max_prompt_samples,
            max_snippet_chars: 40_000,
        }
    }
}

impl GeneratorProfile {
    /// Load `<dir>/<name>.json`. The built-in `default` profile is used when
    /// that file does not exist.
    pub fn load(dir: &Path, name: &str) -> Result<Self, AppError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(AppError::ConfigError(format!("Invalid profile name: {name}")));
        }

        let path = dir.join(format!("{name}.json"));
        if !path.exists() {
            if name == DEFAULT_PROFILE {
                return Ok(Self::default());
            }
            return Err(AppError::ConfigError(format!(
                "Profile not found: {}",
                path.display()
            )));
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| AppError::ConfigError(format!("{}: {e}", path.display())))?;
        let mut profile: GeneratorProfile = serde_json::from_str(&raw)
            .map_err(|e| AppError::ConfigError(format!("{}: {e}", path.display())))?;
        profile.name = name.to_string();
        profile.validate()?;
        Ok(profile)
    }

    /// Names of all profiles in `dir`, sorted. Always includes `default`.
    pub fn list(dir: &Path) -> Result<Vec<String>, AppError> {
        let mut names = vec![DEFAULT_PROFILE.to_string()];
        if dir.is_dir() {
            let entries = std::fs::read_dir(dir)
                .map_err(|e| AppError::ConfigError(format!("{}: {e}", dir.display())))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json")
                    && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                    && !names.iter().any(|n| n == stem)
                {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.acceptance_threshold) {
            return Err(AppError::ConfigError(format!(
                "Profile '{}': acceptance_threshold must be within [0, 1]",
                self.name
            )));
        }
        if self.max_iterations == 0 || self.max_prompt_samples == 0 {
            return Err(AppError::ConfigError(format!(
                "Profile '{}': max_iterations and max_prompt_samples must be positive",
                self.name
            )));
        }
        if self.model.trim().is_empty() {
            return Err(AppError::ConfigError(format!(
                "Profile '{}': model is required",
                self.name
            )));
        }
        Ok(())
    }

    /// Synthesis settings derived from this profile.
    pub fn synthesis_config(&self, promote_on_accept: bool) -> SynthesisConfig {
        SynthesisConfig {
            acceptance_threshold: self.acceptance_threshold,
            max_iterations: self.max_iterations,
            max_prompt_samples: self.max_prompt_samples,
            promote_on_accept,
            ..SynthesisConfig::default()
        }
    }
}
