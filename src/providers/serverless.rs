//! Weights-aware serverless generation backend. This is the primary
//! provider: it accepts a signed weights URL per request and loads the
//! avatar's fine-tune on top of its base model.

use std::time::Duration;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use crate::data_structures::GenerationRequest;
use crate::providers::provider::{
    ImageProvider, ProviderCaps, ProviderError, ProviderErrorKind, ProviderPricing,
    ProviderResponse,
};

/// Upper bound on inline base64 payloads, checked before decoding.
pub(crate) const MAX_BASE64_BYTES: usize = 100 * 1024 * 1024;

#[derive(Serialize)]
struct WireRequest<'a> {
    prompt: &'a str,
    negative_prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    lora_url: Option<&'a str>,
    lora_scale: f64,
    width: u32,
    height: u32,
    steps: u32,
    cfg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    timeout_seconds: u64,
}

#[derive(Deserialize)]
struct WireSuccess {
    image_base64: Option<String>,
    image_url: Option<String>,
    image_size: Option<[u32; 2]>,
    generation_time_seconds: Option<f64>,
    model_info: Option<Value>,
}

#[derive(Deserialize)]
struct WireFailure {
    error: String,
    error_code: Option<String>,
    #[allow(dead_code)]
    details: Option<String>,
    retry_after: Option<u64>,
}

pub struct ServerlessProvider {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    caps: ProviderCaps,
    pricing: ProviderPricing,
}

impl ServerlessProvider {
    pub fn new(
        name: &str,
        client: reqwest::Client,
        endpoint: &str,
        api_key: Option<String>,
        caps: ProviderCaps,
        pricing: ProviderPricing,
    ) -> Self {
        ServerlessProvider {
            name: name.to_string(),
            client,
            endpoint: endpoint.to_string(),
            api_key,
            caps,
            pricing,
        }
    }

    async fn resolve_image(&self, success: WireSuccess) -> Result<ProviderResponse, ProviderError> {
        let bytes = if let Some(encoded) = success.image_base64 {
            if encoded.len() > MAX_BASE64_BYTES {
                return Err(ProviderError::new(
                    ProviderErrorKind::GenerationFailed,
                    format!("inline image of {} bytes exceeds the 100 MB cap", encoded.len()),
                ));
            }
            BASE64.decode(encoded.as_bytes()).map_err(|e| {
                ProviderError::new(
                    ProviderErrorKind::GenerationFailed,
                    format!("invalid base64 image: {}", e),
                )
            })?
        } else if let Some(url) = success.image_url {
            let response = self.client.get(&url).send().await.map_err(|e| {
                ProviderError::new(
                    ProviderErrorKind::Transient,
                    format!("image fetch failed: {}", e),
                )
            })?;
            if !response.status().is_success() {
                return Err(ProviderError::new(
                    ProviderErrorKind::Transient,
                    format!("image fetch returned {}", response.status()),
                ));
            }
            response
                .bytes()
                .await
                .map_err(|e| {
                    ProviderError::new(
                        ProviderErrorKind::Transient,
                        format!("image body read failed: {}", e),
                    )
                })?
                .to_vec()
        } else {
            // A "success" with no image at all is a generation failure.
            return Err(ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                "provider returned success with neither image_base64 nor image_url",
            ));
        };

        if bytes.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                "provider returned an empty image",
            ));
        }

        let [width, height] = success.image_size.unwrap_or([0, 0]);
        Ok(ProviderResponse {
            bytes_png: bytes,
            width,
            height,
            generation_seconds: success.generation_time_seconds.unwrap_or(0.0),
            model_info: success.model_info,
        })
    }
}

#[async_trait]
impl ImageProvider for ServerlessProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> ProviderCaps {
        self.caps
    }

    fn pricing(&self) -> ProviderPricing {
        self.pricing
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = WireRequest {
            prompt: &request.prompt,
            negative_prompt: &request.negative_prompt,
            lora_url: request.weights_url.as_ref().map(|w| w.url.as_str()),
            lora_scale: request.weights_scale,
            width: request.width,
            height: request.height,
            steps: request.steps,
            cfg: request.cfg,
            seed: if self.caps.supports_seed { request.seed } else { None },
            timeout_seconds: timeout.as_secs().max(1),
        };

        let mut http = self.client.post(&self.endpoint).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        debug!("{}: dispatching {}x{} generation", self.name, request.width, request.height);
        let response = http.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::new(ProviderErrorKind::Timeout, e.to_string())
            } else {
                ProviderError::new(ProviderErrorKind::Transient, e.to_string())
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ProviderError::new(ProviderErrorKind::Transient, format!("body read failed: {}", e))
        })?;

        if status.is_success() {
            let success: WireSuccess = serde_json::from_str(&text).map_err(|e| {
                ProviderError::new(
                    ProviderErrorKind::GenerationFailed,
                    format!("unparseable success body: {}", e),
                )
            })?;
            return self.resolve_image(success).await;
        }

        // Structured failure bodies carry the classification; fall back on
        // the status class when the body is opaque.
        if let Ok(failure) = serde_json::from_str::<WireFailure>(&text) {
            let kind = failure
                .error_code
                .as_deref()
                .map(ProviderErrorKind::from_code)
                .unwrap_or(ProviderErrorKind::Transient);
            warn!("{}: {} ({})", self.name, failure.error, kind.code());
            return Err(ProviderError::new(kind, failure.error)
                .with_retry_after(failure.retry_after.map(Duration::from_secs)));
        }

        if status.is_server_error() {
            Err(ProviderError::new(
                ProviderErrorKind::Transient,
                format!("provider returned {}", status),
            ))
        } else {
            Err(ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                format!("provider returned {}", status),
            ))
        }
    }
}
