//! Shared helpers for unit tests: a scriptable in-process provider and a
//! fully wired orchestrator against an in-memory database.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use crate::blob_store::BlobStoreClient;
use crate::captions::CaptionService;
use crate::cost::CostAccountant;
use crate::data_structures::{
    Avatar, BatchConfig, ContentKind, GenerationDefaults, GenerationRequest, Platform, TierMix,
};
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::providers::provider::{
    ImageProvider, ProviderCaps, ProviderError, ProviderErrorKind, ProviderPricing,
    ProviderResponse,
};
use crate::providers::router::ProviderRouter;
use crate::retry::BackoffPolicy;
use crate::safety::SafetyClassifier;
use crate::templates::TemplateLibrary;
use crate::url_broker::UrlBroker;

/// Provider that succeeds unless the prompt contains a failure marker.
/// Optionally cancels a token after a number of calls, to exercise
/// mid-stage cancellation.
pub struct MarkedProvider {
    pub calls: AtomicUsize,
    fail_marker: Option<String>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl MarkedProvider {
    pub fn plain() -> Arc<Self> {
        Arc::new(MarkedProvider {
            calls: AtomicUsize::new(0),
            fail_marker: None,
            cancel_after: None,
        })
    }

    pub fn failing_on(marker: &str) -> Arc<Self> {
        Arc::new(MarkedProvider {
            calls: AtomicUsize::new(0),
            fail_marker: Some(marker.to_string()),
            cancel_after: None,
        })
    }

    pub fn cancelling_after(n: usize, token: CancellationToken) -> Arc<Self> {
        Arc::new(MarkedProvider {
            calls: AtomicUsize::new(0),
            fail_marker: None,
            cancel_after: Some((n, token)),
        })
    }
}

#[async_trait]
impl ImageProvider for MarkedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn caps(&self) -> ProviderCaps {
        ProviderCaps { supports_weights: true, supports_seed: true }
    }

    fn pricing(&self) -> ProviderPricing {
        ProviderPricing { per_image_usd: 0.01, per_second_usd: 0.0 }
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if n >= *after {
                token.cancel();
            }
        }
        if let Some(marker) = &self.fail_marker {
            if request.prompt.contains(marker) {
                return Err(ProviderError::new(
                    ProviderErrorKind::GenerationFailed,
                    "scripted failure",
                ));
            }
        }
        Ok(ProviderResponse {
            bytes_png: vec![0x89, b'P', b'N', b'G'],
            width: request.width,
            height: request.height,
            generation_seconds: 0.01,
            model_info: None,
        })
    }
}

pub fn test_avatar(id: &str, with_weights: bool) -> Avatar {
    Avatar {
        id: id.to_string(),
        niche: "fitness".to_string(),
        base_prompt: "photorealistic portrait".to_string(),
        negative_prompt: "blurry".to_string(),
        trigger_token: "zxqavatar".to_string(),
        weights_uri: if with_weights {
            Some(format!("loras/{}.safetensors", id))
        } else {
            None
        },
        default_scale: 0.8,
        default_generation_config: GenerationDefaults::default(),
    }
}

/// Orchestrator wired against an in-memory database, with avatars
/// `avatar-1` (with weights) and `avatar-nw` (without) seeded.
pub async fn orchestrator_harness(
    provider: Arc<dyn ImageProvider>,
    caption_endpoint: Option<String>,
    store_endpoint: Option<String>,
) -> Orchestrator {
    let db = Persistence::in_memory().await.unwrap();
    db.upsert_avatar(&test_avatar("avatar-1", true)).await.unwrap();
    db.upsert_avatar(&test_avatar("avatar-nw", false)).await.unwrap();

    let mut policies = HashMap::new();
    policies.insert("scripted".to_string(), BackoffPolicy::new(2, 1));
    let router = Arc::new(ProviderRouter::new(
        vec![provider],
        policies,
        true,
        Duration::from_secs(10),
    ));
    let client = reqwest::Client::new();
    let captions =
        caption_endpoint.map(|e| Arc::new(CaptionService::new(client.clone(), &e, None, None)));
    let store_endpoint = store_endpoint.unwrap_or_else(|| "http://127.0.0.1:9".to_string());

    Orchestrator::new(
        Arc::new(TemplateLibrary::builtin()),
        router,
        Arc::new(UrlBroker::new("https://blob.test", "content", "key").unwrap()),
        Arc::new(BlobStoreClient::new(
            client.clone(),
            &store_endpoint,
            "content",
            "https://cdn.test",
        )),
        captions,
        Arc::new(SafetyClassifier::new(client, None)),
        Arc::new(CostAccountant::new()),
        db,
        3,
        Duration::from_secs(60),
        0.5,
        Duration::from_secs(900),
        true,
        true,
    )
}

pub fn test_batch(num_pieces: usize) -> BatchConfig {
    BatchConfig {
        num_pieces,
        tier_mix: TierMix::default(),
        platform: Platform::Instagram,
        do_captions: false,
        do_safety: false,
        do_upload: false,
        custom_prompts: None,
        custom_tiers: None,
        provider_hint: None,
        seed: Some(42),
        kind: ContentKind::Image,
    }
}
