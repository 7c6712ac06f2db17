use std::time::Duration;
use async_trait::async_trait;
use serde_json::Value;
use crate::data_structures::{AttemptOutcome, GenerationRequest};

/// What a backend can honor. The router consults this before handing a
/// request over.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCaps {
    pub supports_weights: bool,
    pub supports_seed: bool,
}

/// Unit pricing a backend declares. An attempt costs the per-image fee plus
/// the per-second fee times observed duration, whether or not it succeeded.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderPricing {
    pub per_image_usd: f64,
    pub per_second_usd: f64,
}

impl ProviderPricing {
    pub fn cost(&self, duration: Duration) -> f64 {
        self.per_image_usd + self.per_second_usd * duration.as_secs_f64()
    }
}

/// Classified provider failure. The wire `error_code` maps onto one of
/// these; anything unrecognized from a 5xx is `Transient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The worker could not fetch the weights file. Often a stale signed
    /// URL; the router re-mints before retrying when enough TTL has burned.
    LoraDownloadFailed,
    LoraLoadFailed,
    ModelLoadFailed,
    GenerationFailed,
    Timeout,
    CudaOom,
    /// Terminal across every provider; retrying elsewhere cannot help.
    InvalidPrompt,
    Transient,
}

impl ProviderErrorKind {
    pub fn from_code(code: &str) -> ProviderErrorKind {
        match code {
            "LORA_DOWNLOAD_FAILED" => ProviderErrorKind::LoraDownloadFailed,
            "LORA_LOAD_FAILED" => ProviderErrorKind::LoraLoadFailed,
            "MODEL_LOAD_FAILED" => ProviderErrorKind::ModelLoadFailed,
            "GENERATION_FAILED" => ProviderErrorKind::GenerationFailed,
            "TIMEOUT" => ProviderErrorKind::Timeout,
            "CUDA_OOM" => ProviderErrorKind::CudaOom,
            "INVALID_PROMPT" => ProviderErrorKind::InvalidPrompt,
            _ => ProviderErrorKind::Transient,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProviderErrorKind::LoraDownloadFailed => "LORA_DOWNLOAD_FAILED",
            ProviderErrorKind::LoraLoadFailed => "LORA_LOAD_FAILED",
            ProviderErrorKind::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ProviderErrorKind::GenerationFailed => "GENERATION_FAILED",
            ProviderErrorKind::Timeout => "TIMEOUT",
            ProviderErrorKind::CudaOom => "CUDA_OOM",
            ProviderErrorKind::InvalidPrompt => "INVALID_PROMPT",
            ProviderErrorKind::Transient => "TRANSIENT",
        }
    }

    /// Terminal for the whole request, across all providers.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderErrorKind::InvalidPrompt)
    }

    /// Give up on this provider immediately and move down the chain.
    pub fn is_fatal_for_provider(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::LoraLoadFailed | ProviderErrorKind::ModelLoadFailed
        )
    }

    /// Cap on attempts for this error kind, within the provider's own
    /// budget. `GENERATION_FAILED` earns a single retry before the router
    /// moves on.
    pub fn attempt_cap(&self, provider_max: u32) -> u32 {
        match self {
            ProviderErrorKind::GenerationFailed => provider_max.min(2),
            _ => provider_max,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        ProviderError {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Telemetry outcome for an attempt that ended in this error, given
    /// whether the router is about to try this provider again.
    pub fn outcome(&self, will_retry: bool) -> AttemptOutcome {
        match self.kind {
            ProviderErrorKind::Timeout => AttemptOutcome::Timeout,
            _ if will_retry => AttemptOutcome::RetryableError,
            _ => AttemptOutcome::FatalError,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

/// Successful provider output before the router wraps it.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub bytes_png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub generation_seconds: f64,
    pub model_info: Option<Value>,
}

/// A remote image-generation backend. Implementations own their wire
/// format; the router only sees this trait.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn caps(&self) -> ProviderCaps;

    fn pricing(&self) -> ProviderPricing;

    /// Run one attempt. `timeout` is the per-attempt deadline; the
    /// implementation must not outlive it.
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError>;
}
