//! Generic remote image API without weight support. Last resort in the
//! chain: output loses the avatar's identity, so the router only reaches
//! here when degraded fallback is allowed.

use std::time::Duration;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use serde_derive::{Deserialize, Serialize};
use crate::data_structures::GenerationRequest;
use crate::providers::provider::{
    ImageProvider, ProviderCaps, ProviderError, ProviderErrorKind, ProviderPricing,
    ProviderResponse,
};
use crate::providers::serverless::MAX_BASE64_BYTES;

#[derive(Serialize)]
struct ImagesRequest<'a> {
    prompt: &'a str,
    n: u32,
    size: String,
    response_format: &'static str,
}

#[derive(Deserialize)]
struct ImagesResponse {
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

pub struct StockImageProvider {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    pricing: ProviderPricing,
}

impl StockImageProvider {
    pub fn new(
        name: &str,
        client: reqwest::Client,
        endpoint: &str,
        api_key: Option<String>,
        pricing: ProviderPricing,
    ) -> Self {
        StockImageProvider {
            name: name.to_string(),
            client,
            endpoint: endpoint.to_string(),
            api_key,
            pricing,
        }
    }
}

#[async_trait]
impl ImageProvider for StockImageProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn caps(&self) -> ProviderCaps {
        ProviderCaps { supports_weights: false, supports_seed: false }
    }

    fn pricing(&self) -> ProviderPricing {
        self.pricing
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let body = ImagesRequest {
            prompt: &request.prompt,
            n: 1,
            size: format!("{}x{}", request.width, request.height),
            response_format: "b64_json",
        };

        let mut http = self.client.post(&self.endpoint).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        debug!("{}: generic image request", self.name);
        let started = std::time::Instant::now();
        let response = http.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::new(ProviderErrorKind::Timeout, e.to_string())
            } else {
                ProviderError::new(ProviderErrorKind::Transient, e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::new(
                ProviderErrorKind::Transient,
                "rate limited",
            )
            .with_retry_after(retry_after));
        }
        if status.as_u16() == 400 {
            // Content-policy rejections are terminal: no other provider will
            // accept the same prompt text either.
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(ProviderErrorKind::InvalidPrompt, text));
        }
        if !status.is_success() {
            let kind = if status.is_server_error() {
                ProviderErrorKind::Transient
            } else {
                ProviderErrorKind::GenerationFailed
            };
            return Err(ProviderError::new(kind, format!("provider returned {}", status)));
        }

        let parsed: ImagesResponse = response.json().await.map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                format!("unparseable images body: {}", e),
            )
        })?;
        let encoded = parsed
            .data
            .into_iter()
            .next()
            .and_then(|d| d.b64_json)
            .ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::GenerationFailed,
                    "images response contained no data",
                )
            })?;
        if encoded.len() > MAX_BASE64_BYTES {
            return Err(ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                format!("inline image of {} bytes exceeds the 100 MB cap", encoded.len()),
            ));
        }
        let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                format!("invalid base64 image: {}", e),
            )
        })?;

        Ok(ProviderResponse {
            bytes_png: bytes,
            width: request.width,
            height: request.height,
            generation_seconds: started.elapsed().as_secs_f64(),
            model_info: None,
        })
    }
}
