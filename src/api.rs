//! Control surface consumed by the thin HTTP layer. Everything here is a
//! plain async method returning typed results; JSON shapes and status codes
//! are the adapter's concern.

use std::sync::Arc;
use std::time::Duration;
use log::info;
use tokio_util::sync::CancellationToken;
use crate::blob_store::BlobStoreClient;
use crate::captions::CaptionService;
use crate::config::Config;
use crate::cost::CostAccountant;
use crate::data_structures::{
    BatchConfig, BatchResult, ContentKind, ContentPiece, DropReason, Platform, SafetyRating, Tier,
    TierMix,
};
use crate::errors::EngineError;
use crate::jobs::{JobManager, JobStatus};
use crate::orchestrator::Orchestrator;
use crate::persistence::{Persistence, PieceFilters, PieceStats};
use crate::providers::build_router;
use crate::safety::SafetyClassifier;
use crate::templates::{Template, TemplateFilters, TemplateLibrary};
use crate::url_broker::UrlBroker;

/// What to generate a single piece from.
#[derive(Debug, Clone)]
pub enum PromptOrTemplate {
    Prompt(String),
    TemplateId(String),
}

pub struct ContentEngine {
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<JobManager>,
    captions: Option<Arc<CaptionService>>,
    safety: Arc<SafetyClassifier>,
}

impl ContentEngine {
    /// Wire the whole engine from configuration. Fails fast on anything
    /// that would make every later request fail too.
    pub async fn from_config(config: &Config) -> Result<Self, EngineError> {
        let client = reqwest::Client::new();

        let signing_key = config
            .storage
            .get_signing_key()
            .map_err(EngineError::Configuration)?;
        let broker = Arc::new(UrlBroker::new(
            &config.storage.endpoint,
            &config.storage.bucket,
            &signing_key,
        )?);
        let store = Arc::new(BlobStoreClient::new(
            client.clone(),
            &config.storage.endpoint,
            &config.storage.bucket,
            &config.storage.cdn_prefix,
        ));

        let router = Arc::new(build_router(config, &client)?);

        let captions = match &config.captions {
            Some(captions_config) if captions_config.is_enabled() => {
                Some(Arc::new(CaptionService::new(
                    client.clone(),
                    &captions_config.endpoint,
                    captions_config.api_key.clone(),
                    captions_config.model.clone(),
                )))
            }
            _ => None,
        };
        let safety_enabled = config.safety.as_ref().map(|s| s.is_enabled()).unwrap_or(true);
        let safety = Arc::new(SafetyClassifier::new(
            client.clone(),
            config.safety.as_ref().and_then(|s| s.endpoint.clone()),
        ));

        let db = Persistence::connect(
            &config.database.url,
            config.database.max_connections(),
        )
        .await?;

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(TemplateLibrary::builtin()),
            router,
            broker,
            store,
            captions.clone(),
            safety.clone(),
            Arc::new(CostAccountant::new()),
            db,
            config.generation.per_batch_workers(),
            Duration::from_secs(config.generation.batch_deadline_seconds()),
            config.generation.max_failed_fraction(),
            Duration::from_secs(config.storage.weights_url_ttl_seconds()),
            config.storage.upload_enabled(),
            safety_enabled,
        ));

        let jobs = Arc::new(JobManager::new(
            orchestrator.clone(),
            Duration::from_secs(config.jobs.lease_seconds()),
            config.jobs.total_worker_budget(),
            config.generation.per_batch_workers(),
            Duration::from_millis(config.jobs.poll_interval_ms()),
            Duration::from_secs(config.generation.sync_cap_seconds()),
        ));

        info!("Content engine initialized");
        Ok(ContentEngine { orchestrator, jobs, captions, safety })
    }

    pub fn from_parts(
        orchestrator: Arc<Orchestrator>,
        jobs: Arc<JobManager>,
        captions: Option<Arc<CaptionService>>,
        safety: Arc<SafetyClassifier>,
    ) -> Self {
        ContentEngine { orchestrator, jobs, captions, safety }
    }

    pub fn jobs(&self) -> Arc<JobManager> {
        self.jobs.clone()
    }

    /// One piece, synchronously. Captions are skipped; safety and upload
    /// follow the global configuration.
    pub async fn generate_one(
        &self,
        avatar_id: &str,
        source: PromptOrTemplate,
        tier_hint: Option<Tier>,
    ) -> Result<ContentPiece, EngineError> {
        let (prompt, tier) = match source {
            PromptOrTemplate::Prompt(prompt) => (prompt, tier_hint.unwrap_or(Tier::T1)),
            PromptOrTemplate::TemplateId(id) => {
                let avatar = self
                    .orchestrator
                    .db()
                    .get_avatar(avatar_id)
                    .await?
                    .ok_or_else(|| EngineError::AvatarNotFound(avatar_id.to_string()))?;
                let template = self
                    .orchestrator
                    .templates()
                    .get(&id)
                    .ok_or_else(|| EngineError::TemplateNotFound(id.clone()))?;
                (template.render(&avatar), tier_hint.unwrap_or(template.tier))
            }
        };

        let config = BatchConfig {
            num_pieces: 1,
            tier_mix: TierMix::default(),
            platform: Platform::Instagram,
            do_captions: false,
            do_safety: true,
            do_upload: true,
            custom_prompts: Some(vec![prompt]),
            custom_tiers: Some(vec![tier]),
            provider_hint: None,
            seed: None,
            kind: ContentKind::Image,
        };

        let mut result = self
            .orchestrator
            .run_batch(avatar_id, config, CancellationToken::new(), None)
            .await?;
        if let Some(piece) = result.pieces.pop() {
            return Ok(piece);
        }
        match result.dropped.pop() {
            Some(drop) => Err(drop_to_error(drop.reason, drop.detail)),
            None => Err(EngineError::Persistence(
                "batch finished without a piece or a drop record".to_string(),
            )),
        }
    }

    /// Synchronous batch, bounded by the configured cap.
    pub async fn generate_batch(
        &self,
        avatar_id: &str,
        config: BatchConfig,
    ) -> Result<BatchResult, EngineError> {
        self.jobs.submit_sync(avatar_id, config).await
    }

    pub async fn generate_batch_async(
        &self,
        avatar_id: &str,
        config: BatchConfig,
    ) -> Result<String, EngineError> {
        self.jobs.submit(avatar_id, config).await
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus, EngineError> {
        self.jobs.status(job_id).await
    }

    pub async fn job_result(&self, job_id: &str) -> Result<BatchResult, EngineError> {
        self.jobs.result(job_id).await
    }

    pub async fn list_pieces(
        &self,
        avatar_id: &str,
        filters: &PieceFilters,
    ) -> Result<Vec<ContentPiece>, EngineError> {
        self.orchestrator.db().list_pieces_by_avatar(avatar_id, filters).await
    }

    pub async fn piece_stats(&self, avatar_id: &str) -> Result<PieceStats, EngineError> {
        self.orchestrator.db().piece_stats(avatar_id).await
    }

    pub fn list_templates(&self, filters: &TemplateFilters) -> Vec<Template> {
        self.orchestrator.templates().list(filters)
    }

    /// Caption variations for a prompt, outside any batch.
    pub async fn generate_captions(
        &self,
        avatar_id: &str,
        prompt: &str,
        platform: Platform,
        n_variations: usize,
    ) -> Result<Vec<String>, EngineError> {
        let service = self.captions.as_ref().ok_or_else(|| {
            EngineError::Configuration("no caption backend configured".to_string())
        })?;
        let avatar = self
            .orchestrator
            .db()
            .get_avatar(avatar_id)
            .await?
            .ok_or_else(|| EngineError::AvatarNotFound(avatar_id.to_string()))?;
        service.variations(&avatar, prompt, platform, n_variations).await
    }

    pub async fn check_safety(
        &self,
        prompt: &str,
        image: Option<&[u8]>,
    ) -> Result<SafetyRating, EngineError> {
        self.safety.classify(prompt, image).await
    }
}

fn drop_to_error(reason: DropReason, detail: Option<String>) -> EngineError {
    let detail = detail.unwrap_or_default();
    match reason {
        DropReason::AllProvidersFailed => {
            EngineError::AllProvidersFailed(vec![("chain".to_string(), detail)])
        }
        DropReason::RejectedBySafety => {
            EngineError::Validation("prompt rejected by the safety classifier".to_string())
        }
        DropReason::SafetyCheckFailed => EngineError::SafetyBackend(detail),
        DropReason::UploadFailed => EngineError::StorageTransient(detail),
    }
}
