use std::fmt::Write as _;
use std::time::Duration;

use carve_core::error::AppError;
use carve_core::profile::GeneratorProfile;
use carve_core::proposal::{ProposalRequest, SELECTOR_SET_SCHEMA, parse_proposal_text};
use carve_core::traits::{ConfigProposer, ConfigProposerFactory};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::cleaner::PromptCleaner;

const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Phrases OpenAI-compatible APIs use when the prompt is too long.
const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "context window",
    "too many tokens",
    "prompt is too long",
];

/// OpenAI-compatible proposal service.
///
/// Sends cleaned samples (and, on refinement rounds, the previous candidate
/// with its failure diffs) to a chat completions endpoint and asks for a
/// selector set as structured output. Works with any OpenAI-compatible API,
/// including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
#[derive(Clone)]
pub struct OpenAiProposer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
    reflection_prompt: Option<String>,
    cleaner: PromptCleaner,
}

impl OpenAiProposer {
    pub fn from_profile(api_key: &str, profile: &GeneratorProfile) -> Result<Self, AppError> {
        Self::build(api_key, profile, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ..self
        })
    }

    fn build(
        api_key: &str,
        profile: &GeneratorProfile,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        if api_key.trim().is_empty() {
            return Err(AppError::ConfigError("LLM API key is empty".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: profile.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: profile.model.clone(),
            timeout_secs: timeout.as_secs(),
            system_prompt: profile.system_prompt.clone(),
            reflection_prompt: profile.reflection_prompt.clone(),
            cleaner: PromptCleaner::new(profile.max_snippet_chars),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaWrapper,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: &'static str,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

impl ConfigProposer for OpenAiProposer {
    async fn propose(&self, request: &ProposalRequest) -> Result<serde_json::Value, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: build_messages(
                &self.system_prompt,
                self.reflection_prompt.as_deref(),
                &self.cleaner,
                request,
            ),
            response_format: ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaWrapper {
                    name: "selector_set",
                    strict: true,
                    schema: SELECTOR_SET_SCHEMA.clone(),
                },
            },
        };

        tracing::debug!(
            prefix = %request.prefix,
            model = %self.model,
            samples = request.samples.len(),
            reflecting = request.reflection.is_some(),
            "Calling proposal model"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to parse LLM response: {e}")))?;

        let message = chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| AppError::ProposalError("LLM returned no choices".into()))?;

        if let Some(refusal) = message.refusal {
            return Err(AppError::ProposalError(format!("Model refused: {refusal}")));
        }
        let content = message
            .content
            .ok_or_else(|| AppError::ProposalError("Empty response from LLM".into()))?;

        parse_proposal_text(&content)
    }
}

/// Map a non-success response to an error the synthesis loop can act on.
fn classify_error(status_code: u16, body: &str) -> AppError {
    let detail = serde_json::from_str::<ApiError>(body).ok().map(|e| e.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .unwrap_or_else(|| format!("HTTP {status_code}: {body}"));

    let code = detail.as_ref().and_then(|d| d.code.as_deref()).unwrap_or("");
    let lowered = message.to_lowercase();
    if status_code == 413
        || CONTEXT_OVERFLOW_MARKERS
            .iter()
            .any(|m| code == *m || lowered.contains(m))
    {
        return AppError::ContextWindowExceeded(message);
    }

    if status_code == 429 {
        return AppError::RateLimitExceeded;
    }

    AppError::LlmError {
        message,
        status_code,
        retryable: status_code >= 500,
    }
}

fn build_messages(
    system_prompt: &str,
    reflection_prompt: Option<&str>,
    cleaner: &PromptCleaner,
    request: &ProposalRequest,
) -> Vec<Message> {
    // Without a reflection prompt every round starts from scratch.
    let reflection = reflection_prompt.zip(request.reflection.as_ref());

    let mut system = system_prompt.to_string();
    if let Some((prompt, _)) = reflection {
        system.push_str("\n\n");
        system.push_str(prompt);
    }

    let mut user = String::new();
    let _ = writeln!(user, "Site section: {}\n", request.prefix);
    for (i, sample) in request.samples.iter().enumerate() {
        let _ = writeln!(user, "## Sample {}: {}", i + 1, sample.url);
        let _ = writeln!(user, "### HTML\n```html\n{}\n```", cleaner.clean(&sample.html));
        let _ = writeln!(user, "### Expected text\n{}\n", sample.expected_content);
    }

    if let Some((_, reflection)) = reflection {
        let candidate = serde_json::to_string_pretty(&reflection.candidate).unwrap_or_default();
        let _ = writeln!(
            user,
            "## Previous rules (accuracy {:.3})\n```json\n{candidate}\n```",
            reflection.accuracy
        );
        for failure in &reflection.failures {
            let mut flags = String::new();
            if failure.missing_content {
                flags.push_str(", missing content");
            }
            if failure.extra_content {
                flags.push_str(", extra content");
            }
            let _ = writeln!(
                user,
                "### {} (accuracy {:.3}{flags})\n{}\n",
                failure.url, failure.accuracy, failure.diff
            );
        }
    }

    if let Some(rejection) = &request.rejection {
        let _ = writeln!(user, "## Your previous answer was rejected\n{rejection}\n");
    }
    user.push_str("Answer with the four selector lists as JSON.");

    vec![
        Message {
            role: "system",
            content: system,
        },
        Message {
            role: "user",
            content: user,
        },
    ]
}

/// Builds one proposer per generator profile with a shared API key.
#[derive(Clone)]
pub struct OpenAiProposerFactory {
    api_key: String,
    llm_timeout: Option<Duration>,
}

impl OpenAiProposerFactory {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            llm_timeout: None,
        }
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = Some(timeout);
        self
    }
}

impl ConfigProposerFactory for OpenAiProposerFactory {
    type Proposer = OpenAiProposer;

    fn create(&self, profile: &GeneratorProfile) -> Result<OpenAiProposer, AppError> {
        let proposer = OpenAiProposer::from_profile(&self.api_key, profile)?;
        match self.llm_timeout {
            Some(t) => proposer.with_timeout(t),
            None => Ok(proposer),
        }
    }
}
