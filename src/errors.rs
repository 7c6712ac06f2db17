// Error taxonomy for the content engine.
// Per-piece failures are folded into the batch result as drops; the variants
// here are the ones that cross component boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-supplied precondition violation. Terminal at the entry point,
    /// never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("avatar not found: {0}")]
    AvatarNotFound(String),

    /// The avatar has no trained weights. Surfaced so the training system
    /// can be re-run.
    #[error("avatar {0} has no trained weights")]
    MissingWeights(String),

    #[error("no provider available")]
    NoProviderAvailable,

    /// Every provider in the chain was exhausted for a single request. Holds
    /// the last error seen on each provider, in chain order.
    #[error("all providers failed: {}", format_provider_errors(.0))]
    AllProvidersFailed(Vec<(String, String)>),

    /// The prompt was rejected outright. Terminal across all providers.
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    /// Blob storage credentials are missing or unusable. Retrying without a
    /// configuration change will not help.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("object not found in storage: {0}")]
    StorageNotFound(String),

    #[error("transient storage error: {0}")]
    StorageTransient(String),

    #[error("storage error: {0}")]
    StorageFatal(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("batch deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("caption backend error: {0}")]
    CaptionBackend(String),

    #[error("safety backend error: {0}")]
    SafetyBackend(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The worker budget is spent. Retryable by the caller after a delay.
    #[error("submission refused: worker budget exhausted")]
    SubmissionRefused,

    #[error("template not found: {0}")]
    TemplateNotFound(String),
}

fn format_provider_errors(errors: &[(String, String)]) -> String {
    errors
        .iter()
        .map(|(provider, err)| format!("{}: {}", provider, err))
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Stable machine-readable code. Provider identity never leaks into
    /// these; it is observable through attempt logs only.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::AvatarNotFound(_) => "AVATAR_NOT_FOUND",
            EngineError::MissingWeights(_) => "MISSING_WEIGHTS",
            EngineError::NoProviderAvailable => "NO_PROVIDER_AVAILABLE",
            EngineError::AllProvidersFailed(_) => "ALL_PROVIDERS_FAILED",
            EngineError::InvalidPrompt(_) => "INVALID_PROMPT",
            EngineError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            EngineError::StorageNotFound(_) => "STORAGE_NOT_FOUND",
            EngineError::StorageTransient(_) => "STORAGE_TRANSIENT",
            EngineError::StorageFatal(_) => "STORAGE_FATAL",
            EngineError::Persistence(_) => "PERSISTENCE_FAILURE",
            EngineError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            EngineError::Cancelled => "CANCELLED",
            EngineError::CaptionBackend(_) => "CAPTION_BACKEND",
            EngineError::SafetyBackend(_) => "SAFETY_BACKEND",
            EngineError::Configuration(_) => "CONFIGURATION",
            EngineError::JobNotFound(_) => "JOB_NOT_FOUND",
            EngineError::SubmissionRefused => "SUBMISSION_REFUSED",
            EngineError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
        }
    }

    /// HTTP status class guidance for the thin adapter in front of this
    /// engine.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::AvatarNotFound(_) | EngineError::JobNotFound(_)
            | EngineError::TemplateNotFound(_) => 404,
            EngineError::MissingWeights(_) | EngineError::InvalidPrompt(_) => 400,
            EngineError::Validation(_) => 422,
            EngineError::AllProvidersFailed(_)
            | EngineError::NoProviderAvailable
            | EngineError::StorageUnavailable(_)
            | EngineError::StorageTransient(_)
            | EngineError::StorageFatal(_)
            | EngineError::StorageNotFound(_) => 502,
            EngineError::SubmissionRefused => 429,
            _ => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StorageTransient(_) | EngineError::SubmissionRefused
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => EngineError::Persistence("row not found".to_string()),
            other => EngineError::Persistence(other.to_string()),
        }
    }
}
