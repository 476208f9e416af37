//! What the synthesis loop sends to a proposal service, and how its
//! untrusted answer is checked before use.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AppError;
use crate::models::SelectorSet;
use crate::selector::CompiledSelectors;

/// JSON schema of a proposed selector set. Also sent to the model as the
/// structured-output format.
pub static SELECTOR_SET_SCHEMA: LazyLock<serde_json::Value> = LazyLock::new(|| {
    let list = json!({ "type": "array", "items": { "type": "string" } });
    json!({
        "type": "object",
        "properties": {
            "root": list,
            "keep": list,
            "drop": list,
            "unwrap": list,
        },
        "required": ["root", "keep", "drop", "unwrap"],
        "additionalProperties": false,
    })
});

/// One labeled page shown to the proposal service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSample {
    pub url: String,
    pub html: String,
    pub expected_content: String,
}

/// A validation case the previous candidate got wrong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureCase {
    pub url: String,
    pub accuracy: f64,
    pub missing_content: bool,
    pub extra_content: bool,
    /// Word diff of expected vs. extracted text, rendered inline.
    pub diff: String,
}

/// Feedback for a refinement round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub candidate: SelectorSet,
    pub accuracy: f64,
    pub failures: Vec<FailureCase>,
}

/// Input to [`crate::traits::ConfigProposer::propose`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub prefix: String,
    pub samples: Vec<PromptSample>,
    /// Previous candidate and how it failed. `None` on the first round.
    pub reflection: Option<Reflection>,
    /// Why the previous answer was rejected, if it was malformed.
    pub rejection: Option<String>,
}

/// Check an untrusted proposal and turn it into a selector set.
///
/// The value must match [`SELECTOR_SET_SCHEMA`] and every selector must
/// compile. Any failure is a `ProposalError`.
pub fn validate_proposal(value: &serde_json::Value) -> Result<SelectorSet, AppError> {
    let validator = jsonschema::validator_for(&SELECTOR_SET_SCHEMA)
        .map_err(|e| AppError::Generic(format!("Selector schema does not compile: {e}")))?;

    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if !errors.is_empty() {
        return Err(AppError::ProposalError(format!(
            "Output does not match selector schema: {}",
            errors.join("; ")
        )));
    }

    let parsed: SelectorSet = serde_json::from_value(value.clone())
        .map_err(|e| AppError::ProposalError(e.to_string()))?;
    // Trim and dedupe each list.
    let selectors = parsed.merge(&SelectorSet::default());

    CompiledSelectors::compile(&selectors).map_err(|e| AppError::ProposalError(e.to_string()))?;
    Ok(selectors)
}

/// Parse a model's text answer as JSON, tolerating a surrounding code fence.
pub fn parse_proposal_text(text: &str) -> Result<serde_json::Value, AppError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim())
        .map_err(|e| AppError::ProposalError(format!("Output is not JSON: {e}")))
}
