//! # Batch Orchestrator
//! Drives one batch through the seven-stage pipeline:
//! template selection, generation, captions, safety, upload, persistence,
//! statistics. Stages run strictly in order; inside a stage, pieces are
//! processed by a bounded worker pool behind a shared semaphore. Per-piece
//! failures become drops on the result; only precondition and persistence
//! failures abort the whole batch.

use std::sync::Arc;
use std::time::{Duration, Instant};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use futures::future::join_all;
use log::{info, warn};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::blob_store::{content_path, BlobStoreClient};
use crate::captions::CaptionService;
use crate::cost::CostAccountant;
use crate::data_structures::{
    Avatar, BatchConfig, BatchResult, BatchState, ContentKind, ContentPiece, DropReason,
    GenerationRequest, PieceDrop, ProgressUpdate, ProviderAttempt, SafetyRating, Stage, Tier,
    MAX_PIECES_PER_BATCH,
};
use crate::errors::EngineError;
use crate::persistence::Persistence;
use crate::providers::router::{ProviderRouter, RemintFn};
use crate::retry::FixedRetry;
use crate::safety::SafetyClassifier;
use crate::templates::{largest_remainder_counts, TemplateLibrary};
use crate::url_broker::UrlBroker;

/// One planned piece after stage 1.
#[derive(Debug, Clone)]
struct PiecePlan {
    index: usize,
    tier: Tier,
    prompt_text: String,
    full_prompt: String,
    steps: u32,
    cfg: f64,
    width: u32,
    height: u32,
    seed: Option<u64>,
}

/// A piece held in memory between stages 2 and 6.
#[derive(Debug, Clone)]
struct Draft {
    id: String,
    index: usize,
    tier: Tier,
    full_prompt: String,
    prompt_text: String,
    bytes: Vec<u8>,
    url: String,
    caption: Option<String>,
    rating: Option<SafetyRating>,
    provider_used: String,
    cost_usd: f64,
    generation_ms: u64,
}

enum GenResult {
    Draft(Box<Draft>),
    Drop(DropReason, Option<String>),
    Abort(EngineError),
}

struct GenOutcome {
    index: usize,
    attempts: Vec<ProviderAttempt>,
    result: GenResult,
}

pub struct Orchestrator {
    templates: Arc<TemplateLibrary>,
    router: Arc<ProviderRouter>,
    broker: Arc<UrlBroker>,
    store: Arc<BlobStoreClient>,
    captions: Option<Arc<CaptionService>>,
    safety: Arc<SafetyClassifier>,
    accountant: Arc<CostAccountant>,
    db: Persistence,
    workers: usize,
    batch_deadline: Duration,
    max_failed_fraction: f64,
    weights_ttl: Duration,
    upload_enabled: bool,
    safety_enabled: bool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        templates: Arc<TemplateLibrary>,
        router: Arc<ProviderRouter>,
        broker: Arc<UrlBroker>,
        store: Arc<BlobStoreClient>,
        captions: Option<Arc<CaptionService>>,
        safety: Arc<SafetyClassifier>,
        accountant: Arc<CostAccountant>,
        db: Persistence,
        workers: usize,
        batch_deadline: Duration,
        max_failed_fraction: f64,
        weights_ttl: Duration,
        upload_enabled: bool,
        safety_enabled: bool,
    ) -> Self {
        Orchestrator {
            templates,
            router,
            broker,
            store,
            captions,
            safety,
            accountant,
            db,
            workers: workers.max(1),
            batch_deadline,
            max_failed_fraction,
            weights_ttl,
            upload_enabled,
            safety_enabled,
        }
    }

    pub fn db(&self) -> &Persistence {
        &self.db
    }

    pub fn templates(&self) -> &TemplateLibrary {
        &self.templates
    }

    pub fn accountant(&self) -> &CostAccountant {
        &self.accountant
    }

    /// Run one batch to a terminal state. Precondition violations come back
    /// as `Err`; every pipeline outcome after that (including failed and
    /// cancelled batches) is an `Ok(BatchResult)` whose state says what
    /// happened.
    pub async fn run_batch(
        &self,
        avatar_id: &str,
        batch: BatchConfig,
        cancel: CancellationToken,
        progress: Option<UnboundedSender<ProgressUpdate>>,
    ) -> Result<BatchResult, EngineError> {
        let avatar = self
            .db
            .get_avatar(avatar_id)
            .await?
            .ok_or_else(|| EngineError::AvatarNotFound(avatar_id.to_string()))?;
        validate_batch(&avatar, &batch)?;
        let avatar = Arc::new(avatar);

        let batch_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let deadline = Instant::now() + self.batch_deadline;
        info!(
            "Batch {} started for avatar {}: {} piece(s)",
            batch_id, avatar.id, batch.num_pieces
        );

        // Stage 1: template selection. Serial and pure.
        let seed = batch.seed.unwrap_or_else(|| rand::random());
        let plans = self.plan_pieces(&avatar, &batch, seed);
        report(&progress, Stage::TemplateSelection, 1, 1);

        // The signed weights URL every generation worker starts from.
        let weights_path = avatar.weights_uri.clone().unwrap_or_default();
        let weights_url = self.broker.mint_read(&weights_path, self.weights_ttl)?;

        // Stage 2: generation.
        let (mut drafts, mut dropped, attempts, abort) = self
            .generation_stage(&avatar, &batch, &batch_id, plans, weights_url, &cancel, &progress, deadline)
            .await;

        for attempt in &attempts {
            self.accountant
                .record(&batch_id, "generation", &attempt.provider, attempt.cost_usd);
        }

        if cancel.is_cancelled() {
            return Ok(self.finish(
                &batch_id, &avatar.id, BatchState::Cancelled, vec![], dropped, attempts,
                started_at, Some("cancelled".to_string()),
            ));
        }
        if let Some(error) = abort {
            let (state, reason) = match error {
                EngineError::DeadlineExceeded => (BatchState::Failed, "deadline_exceeded"),
                _ => (BatchState::Failed, "generation_aborted"),
            };
            return Ok(self.finish(
                &batch_id, &avatar.id, state, vec![], dropped, attempts, started_at,
                Some(reason.to_string()),
            ));
        }

        let failed_fraction = dropped.len() as f64 / batch.num_pieces as f64;
        if failed_fraction > self.max_failed_fraction {
            warn!(
                "Batch {}: {}/{} pieces failed, above the {} threshold",
                batch_id,
                dropped.len(),
                batch.num_pieces,
                self.max_failed_fraction
            );
            return Ok(self.finish(
                &batch_id, &avatar.id, BatchState::Failed, vec![], dropped, attempts,
                started_at, Some("failed_fraction_exceeded".to_string()),
            ));
        }

        // Stage 3: captions. Failures are non-fatal.
        if batch.do_captions {
            if let Some(service) = &self.captions {
                if let Err(stop) = self
                    .caption_stage(&avatar, &batch, service.clone(), &mut drafts, &cancel, &progress, deadline)
                    .await
                {
                    return Ok(self.terminal_from_stop(
                        stop, &batch_id, &avatar.id, dropped, attempts, started_at,
                    ));
                }
            }
        } else {
            report(&progress, Stage::Captions, drafts.len(), drafts.len());
        }

        // Stage 4: safety classification.
        if batch.do_safety && self.safety_enabled {
            if let Err(stop) = self
                .safety_stage(&mut drafts, &mut dropped, &cancel, &progress, deadline)
                .await
            {
                return Ok(self.terminal_from_stop(
                    stop, &batch_id, &avatar.id, dropped, attempts, started_at,
                ));
            }
        } else {
            report(&progress, Stage::Safety, drafts.len(), drafts.len());
        }

        // Stage 5: storage upload.
        if batch.do_upload && self.upload_enabled {
            if let Err(stop) = self
                .upload_stage(&avatar.id, &mut drafts, &mut dropped, &cancel, &progress, deadline)
                .await
            {
                return Ok(self.terminal_from_stop(
                    stop, &batch_id, &avatar.id, dropped, attempts, started_at,
                ));
            }
        } else {
            report(&progress, Stage::Upload, drafts.len(), drafts.len());
        }

        // Last chance to observe cancellation: after this point the batch
        // is effectively committed and cancellation is ignored.
        if cancel.is_cancelled() {
            return Ok(self.finish(
                &batch_id, &avatar.id, BatchState::Cancelled, vec![], dropped, attempts,
                started_at, Some("cancelled".to_string()),
            ));
        }

        // Stage 6: persistence, one transaction, one retry.
        report(&progress, Stage::Persistence, 0, 1);
        drafts.sort_by_key(|d| d.index);
        let pieces: Vec<ContentPiece> = drafts
            .iter()
            .map(|d| self.piece_from_draft(&avatar, &batch, &batch_id, d))
            .collect();
        if !pieces.is_empty() {
            if let Err(first) = self.db.insert_pieces(&pieces).await {
                warn!("Batch {}: persistence failed, retrying once: {}", batch_id, first);
                self.db.insert_pieces(&pieces).await?;
            }
        }
        report(&progress, Stage::Persistence, 1, 1);

        // Stage 7: statistics and terminal state.
        let state = if dropped.is_empty() && pieces.len() == batch.num_pieces {
            BatchState::Succeeded
        } else if !pieces.is_empty() {
            BatchState::PartiallySucceeded
        } else {
            BatchState::Failed
        };
        let error = match state {
            BatchState::Failed => Some("all_pieces_dropped".to_string()),
            _ => None,
        };
        report(&progress, Stage::Statistics, 1, 1);
        Ok(self.finish(&batch_id, &avatar.id, state, pieces, dropped, attempts, started_at, error))
    }

    /// Resolve the per-piece (prompt, tier, knobs) plan. Deterministic for
    /// a given seed.
    fn plan_pieces(&self, avatar: &Avatar, batch: &BatchConfig, seed: u64) -> Vec<PiecePlan> {
        let defaults = &avatar.default_generation_config;

        if let Some(custom) = &batch.custom_prompts {
            let tiers: Vec<Tier> = match &batch.custom_tiers {
                Some(tiers) => tiers.clone(),
                None => expand_tier_counts(&batch.tier_mix, batch.num_pieces),
            };
            return custom
                .iter()
                .enumerate()
                .map(|(index, prompt_text)| PiecePlan {
                    index,
                    tier: tiers[index],
                    prompt_text: prompt_text.clone(),
                    full_prompt: compose_prompt(avatar, prompt_text),
                    steps: defaults.steps,
                    cfg: defaults.cfg,
                    width: defaults.width,
                    height: defaults.height,
                    seed: batch.seed.map(|s| s.wrapping_add(index as u64)),
                })
                .collect();
        }

        let selected = self
            .templates
            .select(avatar, &batch.tier_mix, batch.num_pieces, seed);
        selected
            .into_iter()
            .enumerate()
            .map(|(index, template)| {
                let prompt_text = template.render(avatar);
                PiecePlan {
                    index,
                    tier: template.tier,
                    full_prompt: compose_prompt(avatar, &prompt_text),
                    prompt_text,
                    steps: template.knobs.steps.unwrap_or(defaults.steps),
                    cfg: template.knobs.cfg.unwrap_or(defaults.cfg),
                    width: template.knobs.width.unwrap_or(defaults.width),
                    height: template.knobs.height.unwrap_or(defaults.height),
                    seed: batch.seed.map(|s| s.wrapping_add(index as u64)),
                }
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn generation_stage(
        &self,
        avatar: &Arc<Avatar>,
        batch: &BatchConfig,
        batch_id: &str,
        plans: Vec<PiecePlan>,
        weights_url: crate::data_structures::WeightsUrl,
        cancel: &CancellationToken,
        progress: &Option<UnboundedSender<ProgressUpdate>>,
        deadline: Instant,
    ) -> (Vec<Draft>, Vec<PieceDrop>, Vec<ProviderAttempt>, Option<EngineError>) {
        let total = plans.len();
        let stage_progress = StageProgress::start(Stage::Generation, total, progress);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(total);

        for plan in plans {
            let semaphore = semaphore.clone();
            let stage_progress = stage_progress.clone();
            let cancel = cancel.clone();
            let router = self.router.clone();
            let broker = self.broker.clone();
            let avatar = avatar.clone();
            let weights_url = weights_url.clone();
            let weights_ttl = self.weights_ttl;
            let batch_id = batch_id.to_string();
            let provider_hint = batch.provider_hint.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return GenOutcome {
                            index: plan.index,
                            attempts: vec![],
                            result: GenResult::Abort(EngineError::Cancelled),
                        }
                    }
                };
                if cancel.is_cancelled() {
                    return GenOutcome {
                        index: plan.index,
                        attempts: vec![],
                        result: GenResult::Abort(EngineError::Cancelled),
                    };
                }

                let request = GenerationRequest {
                    prompt: plan.full_prompt.clone(),
                    negative_prompt: avatar.negative_prompt.clone(),
                    weights_url: Some(weights_url),
                    weights_scale: avatar.default_scale,
                    width: plan.width,
                    height: plan.height,
                    steps: plan.steps,
                    cfg: plan.cfg,
                    seed: plan.seed,
                    deadline,
                };

                let weights_path = avatar.weights_uri.clone().unwrap_or_default();
                let remint: Box<RemintFn> = Box::new(move || {
                    let broker = broker.clone();
                    let path = weights_path.clone();
                    Box::pin(async move { broker.mint_read(&path, weights_ttl) })
                });

                let outcome = router
                    .generate(
                        request,
                        &batch_id,
                        plan.index,
                        &cancel,
                        Some(remint.as_ref()),
                        provider_hint.as_deref(),
                    )
                    .await;

                stage_progress.tick();

                match outcome {
                    Ok(output) => {
                        let url = format!(
                            "data:image/png;base64,{}",
                            BASE64.encode(&output.bytes_png)
                        );
                        let cost_usd: f64 =
                            output.attempts.iter().map(|a| a.cost_usd).sum();
                        GenOutcome {
                            index: plan.index,
                            attempts: output.attempts.clone(),
                            result: GenResult::Draft(Box::new(Draft {
                                id: Uuid::new_v4().to_string(),
                                index: plan.index,
                                tier: plan.tier,
                                full_prompt: plan.full_prompt,
                                prompt_text: plan.prompt_text,
                                bytes: output.bytes_png,
                                url,
                                caption: None,
                                rating: None,
                                provider_used: output.provider_used,
                                cost_usd,
                                generation_ms: output.generation_ms,
                            })),
                        }
                    }
                    Err(failure) => {
                        let result = match failure.error {
                            EngineError::Cancelled => GenResult::Abort(EngineError::Cancelled),
                            EngineError::DeadlineExceeded => {
                                GenResult::Abort(EngineError::DeadlineExceeded)
                            }
                            other => GenResult::Drop(
                                DropReason::AllProvidersFailed,
                                Some(other.to_string()),
                            ),
                        };
                        GenOutcome { index: plan.index, attempts: failure.attempts, result }
                    }
                }
            }));
        }

        let mut drafts = Vec::new();
        let mut dropped = Vec::new();
        let mut attempts = Vec::new();
        let mut abort: Option<EngineError> = None;
        for handle in handles {
            match handle.await {
                Ok(outcome) => {
                    attempts.extend(outcome.attempts);
                    match outcome.result {
                        GenResult::Draft(draft) => drafts.push(*draft),
                        GenResult::Drop(reason, detail) => dropped.push(PieceDrop {
                            piece_index: outcome.index,
                            reason,
                            detail,
                        }),
                        GenResult::Abort(error) => {
                            // Cancellation wins over a missed deadline.
                            let replace = match (&abort, &error) {
                                (None, _) => true,
                                (Some(EngineError::DeadlineExceeded), EngineError::Cancelled) => true,
                                _ => false,
                            };
                            if replace {
                                abort = Some(error);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Generation worker panicked: {}", e);
                    abort = Some(EngineError::Persistence(format!("worker failed: {}", e)));
                }
            }
        }
        drafts.sort_by_key(|d| d.index);
        dropped.sort_by_key(|d| d.piece_index);
        (drafts, dropped, attempts, abort)
    }

    async fn caption_stage(
        &self,
        avatar: &Arc<Avatar>,
        batch: &BatchConfig,
        service: Arc<CaptionService>,
        drafts: &mut Vec<Draft>,
        cancel: &CancellationToken,
        progress: &Option<UnboundedSender<ProgressUpdate>>,
        deadline: Instant,
    ) -> Result<(), StageStop> {
        check_boundary(cancel, deadline)?;
        let total = drafts.len();
        let stage_progress = StageProgress::start(Stage::Captions, total, progress);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let platform = batch.platform;
        let mut handles = Vec::with_capacity(total);

        for draft in std::mem::take(drafts) {
            let semaphore = semaphore.clone();
            let stage_progress = stage_progress.clone();
            let cancel = cancel.clone();
            let service = service.clone();
            let avatar = avatar.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let mut draft = draft;
                if !cancel.is_cancelled() {
                    match service.caption(&avatar, &draft.prompt_text, platform).await {
                        Ok(caption) => draft.caption = Some(caption),
                        Err(e) => {
                            warn!("Caption failed for piece {}: {}", draft.index, e);
                        }
                    }
                }
                stage_progress.tick();
                draft
            }));
        }

        for joined in join_all(handles).await {
            if let Ok(draft) = joined {
                drafts.push(draft);
            }
        }
        drafts.sort_by_key(|d| d.index);
        Ok(())
    }

    async fn safety_stage(
        &self,
        drafts: &mut Vec<Draft>,
        dropped: &mut Vec<PieceDrop>,
        cancel: &CancellationToken,
        progress: &Option<UnboundedSender<ProgressUpdate>>,
        deadline: Instant,
    ) -> Result<(), StageStop> {
        check_boundary(cancel, deadline)?;
        let total = drafts.len();
        let stage_progress = StageProgress::start(Stage::Safety, total, progress);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(total);

        for draft in std::mem::take(drafts) {
            let semaphore = semaphore.clone();
            let stage_progress = stage_progress.clone();
            let classifier = self.safety.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let verdict = classifier
                    .classify(&draft.full_prompt, Some(&draft.bytes))
                    .await;
                stage_progress.tick();
                (draft, verdict)
            }));
        }

        for joined in join_all(handles).await {
            let (mut draft, verdict) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Safety worker panicked: {}", e);
                    continue;
                }
            };
            match verdict {
                Ok(SafetyRating::Rejected) => dropped.push(PieceDrop {
                    piece_index: draft.index,
                    reason: DropReason::RejectedBySafety,
                    detail: None,
                }),
                Ok(rating) => {
                    draft.rating = Some(rating);
                    // Effective tier follows the rating, not the template.
                    if let Some(tier) = rating.tier() {
                        draft.tier = tier;
                    }
                    drafts.push(draft);
                }
                Err(e) => dropped.push(PieceDrop {
                    piece_index: draft.index,
                    reason: DropReason::SafetyCheckFailed,
                    detail: Some(e.to_string()),
                }),
            }
        }
        drafts.sort_by_key(|d| d.index);
        dropped.sort_by_key(|d| d.piece_index);
        Ok(())
    }

    async fn upload_stage(
        &self,
        avatar_id: &str,
        drafts: &mut Vec<Draft>,
        dropped: &mut Vec<PieceDrop>,
        cancel: &CancellationToken,
        progress: &Option<UnboundedSender<ProgressUpdate>>,
        deadline: Instant,
    ) -> Result<(), StageStop> {
        check_boundary(cancel, deadline)?;
        let total = drafts.len();
        let stage_progress = StageProgress::start(Stage::Upload, total, progress);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let retry = FixedRetry::uploads();
        let mut handles = Vec::with_capacity(total);

        for draft in std::mem::take(drafts) {
            let semaphore = semaphore.clone();
            let stage_progress = stage_progress.clone();
            let store = self.store.clone();
            let avatar_id = avatar_id.to_string();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let mut draft = draft;
                let path = content_path(&avatar_id, &draft.id, "png");
                let mut last_err: Option<EngineError> = None;
                for attempt in 1..=retry.max_attempts {
                    match store.put(&path, draft.bytes.clone(), "image/png").await {
                        Ok(public_url) => {
                            draft.url = public_url;
                            last_err = None;
                            break;
                        }
                        Err(e) => {
                            warn!(
                                "Upload attempt {} failed for piece {}: {}",
                                attempt, draft.index, e
                            );
                            last_err = Some(e);
                            if attempt < retry.max_attempts {
                                tokio::time::sleep(retry.delay).await;
                            }
                        }
                    }
                }
                stage_progress.tick();
                (draft, last_err)
            }));
        }

        for joined in join_all(handles).await {
            let (draft, err) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Upload worker panicked: {}", e);
                    continue;
                }
            };
            match err {
                None => drafts.push(draft),
                Some(e) => dropped.push(PieceDrop {
                    piece_index: draft.index,
                    reason: DropReason::UploadFailed,
                    detail: Some(e.to_string()),
                }),
            }
        }
        drafts.sort_by_key(|d| d.index);
        dropped.sort_by_key(|d| d.piece_index);
        Ok(())
    }

    fn piece_from_draft(
        &self,
        avatar: &Avatar,
        batch: &BatchConfig,
        batch_id: &str,
        draft: &Draft,
    ) -> ContentPiece {
        ContentPiece {
            id: draft.id.clone(),
            avatar_id: avatar.id.clone(),
            kind: ContentKind::Image,
            tier: draft.tier,
            url: draft.url.clone(),
            caption: draft.caption.clone(),
            safety_rating: draft.rating,
            batch_id: batch_id.to_string(),
            piece_index: draft.index,
            generation_params: json!({
                "prompt": draft.full_prompt,
                "negative_prompt": avatar.negative_prompt,
                "weights_scale": avatar.default_scale,
                "provider": draft.provider_used,
                "platform": batch.platform.as_str(),
                "seed": batch.seed.map(|s| s.wrapping_add(draft.index as u64)),
            }),
            generation_cost_usd: draft.cost_usd,
            generation_time_ms: draft.generation_ms,
            created_at: Utc::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        batch_id: &str,
        avatar_id: &str,
        state: BatchState,
        pieces: Vec<ContentPiece>,
        dropped: Vec<PieceDrop>,
        attempts: Vec<ProviderAttempt>,
        started_at: chrono::DateTime<Utc>,
        error: Option<String>,
    ) -> BatchResult {
        let mut tier_counts = std::collections::HashMap::new();
        let mut rating_counts = std::collections::HashMap::new();
        for piece in &pieces {
            *tier_counts.entry(piece.tier.as_str().to_string()).or_insert(0) += 1;
            if let Some(rating) = piece.safety_rating {
                *rating_counts.entry(rating.as_str().to_string()).or_insert(0) += 1;
            }
        }
        let cost = self.accountant.summary(batch_id);
        self.accountant.forget(batch_id);
        info!(
            "Batch {} finished: {} ({} piece(s), {} dropped, ${:.4})",
            batch_id,
            state.as_str(),
            pieces.len(),
            dropped.len(),
            cost.total_usd
        );
        BatchResult {
            batch_id: batch_id.to_string(),
            avatar_id: avatar_id.to_string(),
            state,
            pieces,
            dropped,
            attempts,
            cost,
            tier_counts,
            rating_counts,
            started_at,
            finished_at: Utc::now(),
            error,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn terminal_from_stop(
        &self,
        stop: StageStop,
        batch_id: &str,
        avatar_id: &str,
        dropped: Vec<PieceDrop>,
        attempts: Vec<ProviderAttempt>,
        started_at: chrono::DateTime<Utc>,
    ) -> BatchResult {
        match stop {
            StageStop::Cancelled => self.finish(
                batch_id, avatar_id, BatchState::Cancelled, vec![], dropped, attempts,
                started_at, Some("cancelled".to_string()),
            ),
            StageStop::DeadlineExceeded => self.finish(
                batch_id, avatar_id, BatchState::Failed, vec![], dropped, attempts,
                started_at, Some("deadline_exceeded".to_string()),
            ),
        }
    }
}

enum StageStop {
    Cancelled,
    DeadlineExceeded,
}

fn check_boundary(cancel: &CancellationToken, deadline: Instant) -> Result<(), StageStop> {
    if cancel.is_cancelled() {
        return Err(StageStop::Cancelled);
    }
    if Instant::now() >= deadline {
        return Err(StageStop::DeadlineExceeded);
    }
    Ok(())
}

fn report(
    progress: &Option<UnboundedSender<ProgressUpdate>>,
    stage: Stage,
    completed: usize,
    total: usize,
) {
    if let Some(tx) = progress {
        let _ = tx.send(ProgressUpdate { stage, completed, total });
    }
}


/// Per-stage progress counter. Increment and publish happen under one lock
/// so reports on the channel are monotonically non-decreasing.
struct StageProgress {
    stage: Stage,
    total: usize,
    counter: std::sync::Mutex<usize>,
    tx: Option<UnboundedSender<ProgressUpdate>>,
}

impl StageProgress {
    fn start(
        stage: Stage,
        total: usize,
        tx: &Option<UnboundedSender<ProgressUpdate>>,
    ) -> Arc<Self> {
        report(tx, stage, 0, total);
        Arc::new(StageProgress {
            stage,
            total,
            counter: std::sync::Mutex::new(0),
            tx: tx.clone(),
        })
    }

    fn tick(&self) {
        let mut completed = self.counter.lock().unwrap();
        *completed += 1;
        report(&self.tx, self.stage, *completed, self.total);
    }
}

fn compose_prompt(avatar: &Avatar, prompt_text: &str) -> String {
    format!("{}, {} {}", avatar.trigger_token, avatar.base_prompt, prompt_text)
}

/// Expand mix ratios into a per-index tier sequence for custom prompts.
fn expand_tier_counts(mix: &crate::data_structures::TierMix, n: usize) -> Vec<Tier> {
    let mut out = Vec::with_capacity(n);
    for (tier, count) in largest_remainder_counts(mix, n) {
        out.extend(std::iter::repeat(tier).take(count));
    }
    out
}

fn validate_batch(avatar: &Avatar, batch: &BatchConfig) -> Result<(), EngineError> {
    match &avatar.weights_uri {
        Some(uri) if !uri.is_empty() => {}
        _ => return Err(EngineError::MissingWeights(avatar.id.clone())),
    }
    validate_config(batch)
}

/// Structural checks on a batch config, independent of the avatar. The job
/// manager runs these at submission time so bad requests never enqueue.
pub(crate) fn validate_config(batch: &BatchConfig) -> Result<(), EngineError> {
    if batch.num_pieces == 0 || batch.num_pieces > MAX_PIECES_PER_BATCH {
        return Err(EngineError::Validation(format!(
            "num_pieces {} outside [1, {}]",
            batch.num_pieces, MAX_PIECES_PER_BATCH
        )));
    }
    if !batch.tier_mix.is_valid() {
        return Err(EngineError::Validation(
            "tier_mix ratios must be in [0, 1] and sum to 1".to_string(),
        ));
    }
    if let Some(custom) = &batch.custom_prompts {
        if custom.len() != batch.num_pieces {
            return Err(EngineError::Validation(format!(
                "custom_prompts has {} entries for {} pieces",
                custom.len(),
                batch.num_pieces
            )));
        }
    }
    if let Some(tiers) = &batch.custom_tiers {
        if tiers.len() != batch.num_pieces {
            return Err(EngineError::Validation(format!(
                "custom_tiers has {} entries for {} pieces",
                tiers.len(),
                batch.num_pieces
            )));
        }
    }
    if batch.kind == ContentKind::Video {
        return Err(EngineError::Validation(
            "video batches are not supported by this pipeline yet".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use tokio::sync::mpsc::unbounded_channel;
    use crate::data_structures::TierMix;
    use crate::test_utils::{orchestrator_harness as harness, test_batch as batch, MarkedProvider};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_happy_batch_succeeds_with_expected_tier_counts() {
        let orchestrator = harness(MarkedProvider::plain(), None, None).await;
        let (tx, mut rx) = unbounded_channel();
        let result = orchestrator
            .run_batch("avatar-1", batch(10), CancellationToken::new(), Some(tx))
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Succeeded);
        assert_eq!(result.pieces.len(), 10);
        assert_eq!(result.tier_counts["T1"], 6);
        assert_eq!(result.tier_counts["T2"], 3);
        assert_eq!(result.tier_counts["T3"], 1);
        assert!(result.dropped.is_empty());
        assert_eq!(result.cost.count, 10);
        assert!((result.cost.total_usd - 0.10).abs() < 1e-9);
        // No upload stage: URLs are inline data URLs.
        assert!(result.pieces.iter().all(|p| p.url.starts_with("data:image/png;base64,")));
        // Persisted order preserves the selection index.
        let indexes: Vec<usize> = result.pieces.iter().map(|p| p.piece_index).collect();
        assert_eq!(indexes, (0..10).collect::<Vec<_>>());

        // Rows actually landed.
        let stored = orchestrator
            .db()
            .list_pieces_by_avatar("avatar-1", &Default::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 10);

        // Progress reports are monotonically non-decreasing per stage.
        let mut per_stage: HashMap<usize, usize> = HashMap::new();
        while let Ok(update) = rx.try_recv() {
            let last = per_stage.entry(update.stage.index()).or_insert(0);
            assert!(update.completed >= *last, "stage {} went backwards", update.stage.index());
            *last = update.completed;
        }
        assert_eq!(per_stage.get(&2), Some(&10));
    }

    #[tokio::test]
    async fn test_captions_and_upload_produce_cdn_urls() {
        let caption_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "Chasing the sunrise"}}]
            })))
            .mount(&caption_server)
            .await;
        let store_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&store_server)
            .await;

        let orchestrator = harness(
            MarkedProvider::plain(),
            Some(caption_server.uri()),
            Some(store_server.uri()),
        )
        .await;
        let mut config = batch(4);
        config.do_captions = true;
        config.do_upload = true;

        let result = orchestrator
            .run_batch("avatar-1", config, CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Succeeded);
        assert!(result.pieces.iter().all(|p| p.url.starts_with("https://cdn.test/content/avatar-1/")));
        assert!(result.pieces.iter().all(|p| p.caption.as_deref() == Some("Chasing the sunrise")));
    }

    #[tokio::test]
    async fn test_partial_failure_below_threshold() {
        let orchestrator = harness(MarkedProvider::failing_on("FAILME"), None, None).await;
        let mut config = batch(10);
        config.custom_prompts = Some(
            (0..10)
                .map(|i| {
                    if i == 3 || i == 7 {
                        format!("FAILME piece {}", i)
                    } else {
                        format!("studio portrait {}", i)
                    }
                })
                .collect(),
        );

        let result = orchestrator
            .run_batch("avatar-1", config, CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::PartiallySucceeded);
        assert_eq!(result.pieces.len(), 8);
        assert_eq!(result.dropped.len(), 2);
        let dropped_indexes: Vec<usize> =
            result.dropped.iter().map(|d| d.piece_index).collect();
        assert_eq!(dropped_indexes, vec![3, 7]);
        assert!(result
            .dropped
            .iter()
            .all(|d| d.reason == DropReason::AllProvidersFailed));
        // Failed attempts still show up in the cost summary.
        assert!(result.cost.count > 8);
    }

    #[tokio::test]
    async fn test_failure_above_threshold_persists_nothing() {
        let orchestrator = harness(MarkedProvider::failing_on("FAILME"), None, None).await;
        let mut config = batch(10);
        config.custom_prompts = Some(
            (0..10)
                .map(|i| {
                    if i < 6 {
                        format!("FAILME piece {}", i)
                    } else {
                        format!("studio portrait {}", i)
                    }
                })
                .collect(),
        );

        let result = orchestrator
            .run_batch("avatar-1", config, CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Failed);
        assert_eq!(result.error.as_deref(), Some("failed_fraction_exceeded"));
        assert!(result.pieces.is_empty());
        let stored = orchestrator
            .db()
            .list_pieces_by_avatar("avatar-1", &Default::default())
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_mid_generation_persists_nothing() {
        let cancel = CancellationToken::new();
        let orchestrator = harness(
            MarkedProvider::cancelling_after(3, cancel.clone()),
            None,
            None,
        )
        .await;

        let result = orchestrator
            .run_batch("avatar-1", batch(20), cancel, None)
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Cancelled);
        assert!(result.pieces.is_empty());
        let stored = orchestrator
            .db()
            .list_pieces_by_avatar("avatar-1", &Default::default())
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_missing_weights_fails_before_any_provider_call() {
        let provider = MarkedProvider::plain();
        let orchestrator = harness(provider.clone(), None, None).await;

        let err = orchestrator
            .run_batch("avatar-nw", batch(5), CancellationToken::new(), None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "MISSING_WEIGHTS");
        assert_eq!(provider.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_avatar() {
        let orchestrator = harness(MarkedProvider::plain(), None, None).await;
        let err = orchestrator
            .run_batch("ghost", batch(5), CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AVATAR_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let orchestrator = harness(MarkedProvider::plain(), None, None).await;
        let cancel = CancellationToken::new;

        let mut config = batch(0);
        config.num_pieces = 0;
        let err = orchestrator
            .run_batch("avatar-1", config, cancel(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let mut config = batch(201);
        config.num_pieces = 201;
        assert_eq!(
            orchestrator
                .run_batch("avatar-1", config, cancel(), None)
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );

        let mut config = batch(5);
        config.tier_mix = TierMix { t1: 0.5, t2: 0.2, t3: 0.2 };
        assert_eq!(
            orchestrator
                .run_batch("avatar-1", config, cancel(), None)
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );

        let mut config = batch(5);
        config.custom_prompts = Some(vec!["only one".to_string()]);
        assert_eq!(
            orchestrator
                .run_batch("avatar-1", config, cancel(), None)
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );

        let mut config = batch(5);
        config.kind = ContentKind::Video;
        assert_eq!(
            orchestrator
                .run_batch("avatar-1", config, cancel(), None)
                .await
                .unwrap_err()
                .code(),
            "VALIDATION"
        );
    }

    #[tokio::test]
    async fn test_seeded_batches_are_reproducible() {
        let orchestrator = harness(MarkedProvider::plain(), None, None).await;

        let first = orchestrator
            .run_batch("avatar-1", batch(8), CancellationToken::new(), None)
            .await
            .unwrap();
        let second = orchestrator
            .run_batch("avatar-1", batch(8), CancellationToken::new(), None)
            .await
            .unwrap();

        let prompts = |r: &BatchResult| -> Vec<String> {
            r.pieces
                .iter()
                .map(|p| p.generation_params["prompt"].as_str().unwrap().to_string())
                .collect()
        };
        assert_eq!(prompts(&first), prompts(&second));
        let tiers = |r: &BatchResult| -> Vec<Tier> { r.pieces.iter().map(|p| p.tier).collect() };
        assert_eq!(tiers(&first), tiers(&second));
    }

    #[tokio::test]
    async fn test_safety_rejects_are_dropped_and_tiers_follow_ratings() {
        let orchestrator = harness(MarkedProvider::plain(), None, None).await;
        let mut config = batch(4);
        config.do_safety = true;
        config.custom_prompts = Some(vec![
            "morning run in the park".to_string(),
            "glamour portrait at dusk".to_string(),
            "boudoir editorial, sheer fabrics".to_string(),
            "explicit nude photoshoot".to_string(),
        ]);

        let result = orchestrator
            .run_batch("avatar-1", config, CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::PartiallySucceeded);
        assert_eq!(result.pieces.len(), 3);
        assert_eq!(result.dropped.len(), 1);
        assert_eq!(result.dropped[0].piece_index, 3);
        assert_eq!(result.dropped[0].reason, DropReason::RejectedBySafety);
        // No rejected piece is ever persisted, and tier follows rating.
        for piece in &result.pieces {
            let rating = piece.safety_rating.expect("safety ran");
            assert_ne!(rating, SafetyRating::Rejected);
            assert_eq!(Some(piece.tier), rating.tier());
        }
    }

    #[tokio::test]
    async fn test_upload_failure_drops_piece() {
        let store_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&store_server)
            .await;

        let orchestrator =
            harness(MarkedProvider::plain(), None, Some(store_server.uri())).await;
        let mut config = batch(2);
        config.do_upload = true;

        let result = orchestrator
            .run_batch("avatar-1", config, CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(result.state, BatchState::Failed);
        assert_eq!(result.error.as_deref(), Some("all_pieces_dropped"));
        assert!(result
            .dropped
            .iter()
            .all(|d| d.reason == DropReason::UploadFailed));
    }
}
