use thiserror::Error;

/// Application-wide error types for carve.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed before a status was received.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// The prompt did not fit into the model's context window.
    #[error("Prompt exceeds the model context window: {0}")]
    ContextWindowExceeded(String),

    /// The proposal service returned output that is not a usable selector set.
    #[error("Invalid proposal: {0}")]
    ProposalError(String),

    /// A selector string could not be parsed.
    #[error("Invalid selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },

    /// The raw content is not a document we can extract from.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The URL cannot be parsed or uses an unsupported scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// No production parser config covers the URL.
    #[error("No production parser config for {0}")]
    ConfigNotFound(String),

    /// Lookup by id failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An immutable record with this id was already stored.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Sample files could not be read or written.
    #[error("Sample error: {0}")]
    SampleError(String),

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpStatus { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            AppError::DatabaseError(_) => true,
            _ => false,
        }
    }

    /// Returns true if retrying cannot help and the work item should go
    /// straight to the dead set.
    ///
    /// Client errors (4xx other than 408/429) mean the URL itself is bad.
    /// A missing production config is *not* permanent: it is retried until
    /// the budget runs out, giving synthesis a chance to land one.
    pub fn is_permanent(&self) -> bool {
        match self {
            AppError::HttpStatus { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            AppError::ParseError(_) | AppError::InvalidSelector { .. } | AppError::InvalidUrl(_) => {
                true
            }
            _ => false,
        }
    }

    /// Short machine-readable label, used in dead-letter reasons and API errors.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::HttpError(_)
            | AppError::HttpStatus { .. }
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded => "fetch_error",
            AppError::LlmError { .. } | AppError::ContextWindowExceeded(_) => "llm_error",
            AppError::ProposalError(_) => "proposal_error",
            AppError::InvalidSelector { .. } => "invalid_selector",
            AppError::ParseError(_) => "parse_error",
            AppError::InvalidUrl(_) => "invalid_url",
            AppError::ConfigNotFound(_) => "config_not_found",
            AppError::NotFound(_) => "not_found",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::SerializationError(_) => "serialization_error",
            AppError::DatabaseError(_) => "database_error",
            AppError::ConfigError(_) => "config_error",
            AppError::SampleError(_) => "sample_error",
            AppError::Cancelled => "cancelled",
            AppError::Generic(_) => "internal_error",
        }
    }
}
