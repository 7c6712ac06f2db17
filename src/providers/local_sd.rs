//! Local inference server fallback. Speaks the txt2img API of a
//! self-hosted Stable Diffusion web UI; weights are applied through an
//! inline prompt tag rather than a signed URL, so the server must already
//! have the avatar's weights file on disk.

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
struct Txt2ImgRequest {
    prompt: String,
    negative_prompt: String,
    steps: u32,
    cfg_scale: f64,
    width: u32,
    height: u32,
    seed: i64,
}

#[derive(Deserialize)]
struct Txt2ImgResponse {
    images: Vec<String>,
}

pub struct LocalSdProvider {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    caps: ProviderCaps,
    pricing: ProviderPricing,
}

impl LocalSdProvider {
    pub fn new(
        name: &str,
        client: reqwest::Client,
        endpoint: &str,
        caps: ProviderCaps,
        pricing: ProviderPricing,
    ) -> Self {
        LocalSdProvider {
            name: name.to_string(),
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            caps,
            pricing,
        }
    }

    /// The web UI loads LoRA weights named in the prompt itself. The weight
    /// file name is recovered from the signed URL path.
    fn prompt_with_lora(&self, request: &GenerationRequest) -> String {
        match &request.weights_url {
            Some(weights) => {
                let name = lora_name_from_url(&weights.url);
                format!("{} <lora:{}:{}>", request.prompt, name, request.weights_scale)
            }
            None => request.prompt.clone(),
        }
    }
}

fn lora_name_from_url(url: &str) -> String {
    url.split('?')
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".safetensors")
        .to_string()
}

#[async_trait]
impl ImageProvider for LocalSdProvider {
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
        let body = Txt2ImgRequest {
            prompt: self.prompt_with_lora(request),
            negative_prompt: request.negative_prompt.clone(),
            steps: request.steps,
            cfg_scale: request.cfg,
            width: request.width,
            height: request.height,
            seed: request.seed.map(|s| s as i64).unwrap_or(-1),
        };

        debug!("{}: txt2img {}x{}", self.name, request.width, request.height);
        let started = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}/sdapi/v1/txt2img", self.endpoint))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
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

        if !status.is_success() {
            // The web UI reports OOM as plain text inside a 500.
            let kind = if text.contains("CUDA out of memory") || text.contains("OutOfMemoryError") {
                ProviderErrorKind::CudaOom
            } else if status.is_server_error() {
                ProviderErrorKind::Transient
            } else {
                ProviderErrorKind::GenerationFailed
            };
            return Err(ProviderError::new(kind, format!("{}: {}", status, text)));
        }

        let parsed: Txt2ImgResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                format!("unparseable txt2img body: {}", e),
            )
        })?;

        let first = parsed.images.into_iter().next().ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                "txt2img returned no images",
            )
        })?;
        if first.len() > MAX_BASE64_BYTES {
            return Err(ProviderError::new(
                ProviderErrorKind::GenerationFailed,
                format!("inline image of {} bytes exceeds the 100 MB cap", first.len()),
            ));
        }
        let bytes = BASE64.decode(first.as_bytes()).map_err(|e| {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use crate::data_structures::WeightsUrl;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> LocalSdProvider {
        LocalSdProvider::new(
            "local",
            reqwest::Client::new(),
            &server.uri(),
            ProviderCaps { supports_weights: true, supports_seed: true },
            ProviderPricing::default(),
        )
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "zxqavatar, portrait".to_string(),
            negative_prompt: String::new(),
            weights_url: Some(WeightsUrl {
                url: "https://blob/content/loras/avatar-1.safetensors?expires=1&signature=s"
                    .to_string(),
                issued_at: Instant::now(),
                ttl: Duration::from_secs(900),
            }),
            weights_scale: 0.8,
            width: 1024,
            height: 1024,
            steps: 30,
            cfg: 7.0,
            seed: None,
            deadline: Instant::now() + Duration::from_secs(60),
        }
    }

    #[test]
    fn test_lora_name_extraction() {
        assert_eq!(
            lora_name_from_url("https://blob/loras/avatar-1.safetensors?expires=1"),
            "avatar-1"
        );
        assert_eq!(lora_name_from_url("avatar-2.safetensors"), "avatar-2");
    }

    #[tokio::test]
    async fn test_lora_tag_injected_into_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sdapi/v1/txt2img"))
            .and(body_partial_json(serde_json::json!({
                "prompt": "zxqavatar, portrait <lora:avatar-1:0.8>",
                "seed": -1
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "images": [BASE64.encode([1u8, 2])]
            })))
            .mount(&server)
            .await;

        let result = provider(&server)
            .generate(&request(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(result.bytes_png, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_oom_text_maps_to_cuda_oom() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("torch.cuda.OutOfMemoryError: CUDA out of memory"),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .generate(&request(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::CudaOom);
    }

    #[tokio::test]
    async fn test_empty_images_is_generation_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "images": []
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .generate(&request(), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::GenerationFailed);
    }
}
