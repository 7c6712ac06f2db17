use std::collections::HashMap;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Parser, Debug, Clone)]
#[command(name = "content-engine")]
pub struct CliArgs {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,
    /// Drain the job queue once and exit instead of running as a daemon
    #[arg(long)]
    pub once: bool,
    /// Override the storage signing key (otherwise taken from config/env)
    #[arg(long)]
    pub signing_key: Option<String>,
}

/// Distribution tier of a piece. T1 is broadcast-safe, T3 is paywalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    T1,
    T2,
    T3,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::T1 => "T1",
            Tier::T2 => "T2",
            Tier::T3 => "T3",
        }
    }

    pub fn from_str(s: &str) -> Option<Tier> {
        match s {
            "T1" => Some(Tier::T1),
            "T2" => Some(Tier::T2),
            "T3" => Some(Tier::T3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyRating {
    Safe,
    Suggestive,
    Borderline,
    Rejected,
}

impl SafetyRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyRating::Safe => "safe",
            SafetyRating::Suggestive => "suggestive",
            SafetyRating::Borderline => "borderline",
            SafetyRating::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<SafetyRating> {
        match s {
            "safe" => Some(SafetyRating::Safe),
            "suggestive" => Some(SafetyRating::Suggestive),
            "borderline" => Some(SafetyRating::Borderline),
            "rejected" => Some(SafetyRating::Rejected),
            _ => None,
        }
    }

    /// Distribution tier implied by a rating. `Rejected` has none: the piece
    /// is dropped before it ever reaches persistence.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            SafetyRating::Safe => Some(Tier::T1),
            SafetyRating::Suggestive => Some(Tier::T2),
            SafetyRating::Borderline => Some(Tier::T3),
            SafetyRating::Rejected => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    Image,
    Video,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Image => "image",
            ContentKind::Video => "video",
        }
    }

    pub fn from_str(s: &str) -> Option<ContentKind> {
        match s {
            "image" => Some(ContentKind::Image),
            "video" => Some(ContentKind::Video),
            _ => None,
        }
    }
}

/// Target platform for captions. Each platform carries its own hook-text
/// length budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Instagram,
    Tiktok,
    X,
    Onlyfans,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
            Platform::X => "x",
            Platform::Onlyfans => "onlyfans",
        }
    }

    pub fn caption_budget(&self) -> usize {
        match self {
            Platform::Instagram => 150,
            Platform::Tiktok => 100,
            Platform::X => 280,
            Platform::Onlyfans => 200,
        }
    }
}

/// Generation knobs an avatar carries as defaults. Templates may override
/// individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationDefaults {
    pub steps: u32,
    pub cfg: f64,
    pub width: u32,
    pub height: u32,
    pub scheduler: Option<String>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        GenerationDefaults {
            steps: 30,
            cfg: 7.0,
            width: 1024,
            height: 1024,
            scheduler: None,
        }
    }
}

/// A trained identity produced upstream. Read-only to this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Avatar {
    pub id: String,
    pub niche: String,
    pub base_prompt: String,
    pub negative_prompt: String,
    pub trigger_token: String,
    pub weights_uri: Option<String>,
    pub default_scale: f64,
    pub default_generation_config: GenerationDefaults,
}

/// One generated artifact, persisted as one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPiece {
    pub id: String,
    pub avatar_id: String,
    pub kind: ContentKind,
    pub tier: Tier,
    pub url: String,
    pub caption: Option<String>,
    pub safety_rating: Option<SafetyRating>,
    pub batch_id: String,
    pub piece_index: usize,
    pub generation_params: Value,
    pub generation_cost_usd: f64,
    pub generation_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Tier distribution ratios. Must sum to 1.0 within 1e-6.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierMix {
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
}

impl TierMix {
    pub fn ratios(&self) -> [(Tier, f64); 3] {
        [(Tier::T1, self.t1), (Tier::T2, self.t2), (Tier::T3, self.t3)]
    }

    pub fn is_valid(&self) -> bool {
        let parts = [self.t1, self.t2, self.t3];
        if parts.iter().any(|r| *r < 0.0 || *r > 1.0) {
            return false;
        }
        (parts.iter().sum::<f64>() - 1.0).abs() <= 1e-6
    }
}

impl Default for TierMix {
    fn default() -> Self {
        TierMix { t1: 0.6, t2: 0.3, t3: 0.1 }
    }
}

/// Everything a caller can ask of a batch. Unknown options do not exist:
/// this record is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub num_pieces: usize,
    #[serde(default)]
    pub tier_mix: TierMix,
    pub platform: Platform,
    #[serde(default = "default_true")]
    pub do_captions: bool,
    #[serde(default = "default_true")]
    pub do_safety: bool,
    #[serde(default = "default_true")]
    pub do_upload: bool,
    #[serde(default)]
    pub custom_prompts: Option<Vec<String>>,
    #[serde(default)]
    pub custom_tiers: Option<Vec<Tier>>,
    #[serde(default)]
    pub provider_hint: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_kind")]
    pub kind: ContentKind,
}

fn default_true() -> bool {
    true
}

fn default_kind() -> ContentKind {
    ContentKind::Image
}

pub const MAX_PIECES_PER_BATCH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Queued,
    Running,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Queued => "queued",
            BatchState::Running => "running",
            BatchState::Succeeded => "succeeded",
            BatchState::PartiallySucceeded => "partially_succeeded",
            BatchState::Failed => "failed",
            BatchState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<BatchState> {
        match s {
            "queued" => Some(BatchState::Queued),
            "running" => Some(BatchState::Running),
            "succeeded" => Some(BatchState::Succeeded),
            "partially_succeeded" => Some(BatchState::PartiallySucceeded),
            "failed" => Some(BatchState::Failed),
            "cancelled" => Some(BatchState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Succeeded
                | BatchState::PartiallySucceeded
                | BatchState::Failed
                | BatchState::Cancelled
        )
    }
}

/// The seven pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    TemplateSelection,
    Generation,
    Captions,
    Safety,
    Upload,
    Persistence,
    Statistics,
}

impl Stage {
    pub fn index(&self) -> usize {
        match self {
            Stage::TemplateSelection => 1,
            Stage::Generation => 2,
            Stage::Captions => 3,
            Stage::Safety => 4,
            Stage::Upload => 5,
            Stage::Persistence => 6,
            Stage::Statistics => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::TemplateSelection => "template_selection",
            Stage::Generation => "generation",
            Stage::Captions => "captions",
            Stage::Safety => "safety",
            Stage::Upload => "upload",
            Stage::Persistence => "persistence",
            Stage::Statistics => "statistics",
        }
    }
}

/// Progress record published to the batch's progress channel. A single
/// consumer turns these into observable job state; workers never touch
/// shared progress directly.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
}

impl ProgressUpdate {
    /// Overall percentage, weighting each of the seven stages equally.
    pub fn percent(&self) -> u8 {
        let stage_base = (self.stage.index() - 1) as f64 / 7.0;
        let within = if self.total == 0 {
            1.0
        } else {
            self.completed.min(self.total) as f64 / self.total as f64
        };
        ((stage_base + within / 7.0) * 100.0).round().min(100.0) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Ok,
    RetryableError,
    FatalError,
    Timeout,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Ok => "ok",
            AttemptOutcome::RetryableError => "retryable_error",
            AttemptOutcome::FatalError => "fatal_error",
            AttemptOutcome::Timeout => "timeout",
        }
    }
}

/// Telemetry record for one provider attempt. Failure is not free: failed
/// attempts still carry their cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub batch_id: String,
    pub piece_index: usize,
    pub provider: String,
    pub attempt_no: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    pub error_code: Option<String>,
    pub cost_usd: f64,
}

/// Why a piece was dropped from a batch without failing the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    AllProvidersFailed,
    RejectedBySafety,
    SafetyCheckFailed,
    UploadFailed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::AllProvidersFailed => "all_providers_failed",
            DropReason::RejectedBySafety => "rejected_by_safety",
            DropReason::SafetyCheckFailed => "safety_check_failed",
            DropReason::UploadFailed => "upload_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceDrop {
    pub piece_index: usize,
    pub reason: DropReason,
    pub detail: Option<String>,
}

/// Cost report for one batch, broken down the way the accountant keys its
/// entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub by_operation: HashMap<String, f64>,
    pub by_provider: HashMap<String, f64>,
    pub count: usize,
}

/// Terminal outcome of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub avatar_id: String,
    pub state: BatchState,
    pub pieces: Vec<ContentPiece>,
    pub dropped: Vec<PieceDrop>,
    pub attempts: Vec<ProviderAttempt>,
    pub cost: CostSummary,
    pub tier_counts: HashMap<String, usize>,
    pub rating_counts: HashMap<String, usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// A short-TTL signed read URL plus the bookkeeping the router needs to
/// decide when it has gone stale.
#[derive(Debug, Clone)]
pub struct WeightsUrl {
    pub url: String,
    pub issued_at: Instant,
    pub ttl: Duration,
}

impl WeightsUrl {
    /// True once the configured fraction of the TTL has elapsed. The router
    /// re-mints rather than retrying a download that will fail again.
    pub fn is_stale(&self, fraction: f64) -> bool {
        self.issued_at.elapsed().as_secs_f64() >= self.ttl.as_secs_f64() * fraction
    }
}

/// Single generation request as handed to the provider router.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub weights_url: Option<WeightsUrl>,
    pub weights_scale: f64,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f64,
    pub seed: Option<u64>,
    /// Absolute point after which the router must not issue new attempts.
    pub deadline: Instant,
}

pub const MAX_PROMPT_CHARS: usize = 2000;
pub const ALLOWED_DIMENSIONS: [u32; 5] = [512, 768, 1024, 1344, 1536];

impl GenerationRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.prompt.is_empty() {
            return Err("prompt is empty".to_string());
        }
        if self.prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(format!("prompt exceeds {} characters", MAX_PROMPT_CHARS));
        }
        if !ALLOWED_DIMENSIONS.contains(&self.width) || !ALLOWED_DIMENSIONS.contains(&self.height) {
            return Err(format!("unsupported resolution {}x{}", self.width, self.height));
        }
        if !(20..=50).contains(&self.steps) {
            return Err(format!("steps {} outside [20, 50]", self.steps));
        }
        if !(1.0..=20.0).contains(&self.cfg) {
            return Err(format!("cfg {} outside [1.0, 20.0]", self.cfg));
        }
        if !(0.0..=1.0).contains(&self.weights_scale) {
            return Err(format!("weights_scale {} outside [0, 1]", self.weights_scale));
        }
        Ok(())
    }
}

/// Successful outcome of routing one generation request.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub bytes_png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub generation_ms: u64,
    pub provider_used: String,
    pub attempts: Vec<ProviderAttempt>,
    pub cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "a portrait".to_string(),
            negative_prompt: String::new(),
            weights_url: None,
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
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let mut r = request();
        r.prompt = String::new();
        assert!(r.validate().is_err());

        let mut r = request();
        r.width = 640;
        assert!(r.validate().is_err());

        let mut r = request();
        r.steps = 51;
        assert!(r.validate().is_err());

        let mut r = request();
        r.cfg = 0.5;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_tier_mix_validation() {
        assert!(TierMix::default().is_valid());
        assert!(TierMix { t1: 1.0, t2: 0.0, t3: 0.0 }.is_valid());
        assert!(!TierMix { t1: 0.5, t2: 0.2, t3: 0.2 }.is_valid());
        assert!(!TierMix { t1: 1.2, t2: -0.2, t3: 0.0 }.is_valid());
    }

    #[test]
    fn test_rating_to_tier() {
        assert_eq!(SafetyRating::Safe.tier(), Some(Tier::T1));
        assert_eq!(SafetyRating::Suggestive.tier(), Some(Tier::T2));
        assert_eq!(SafetyRating::Borderline.tier(), Some(Tier::T3));
        assert_eq!(SafetyRating::Rejected.tier(), None);
    }

    #[test]
    fn test_weights_url_staleness() {
        let fresh = WeightsUrl {
            url: "https://cdn.example/loras/a.safetensors?sig=x".to_string(),
            issued_at: Instant::now(),
            ttl: Duration::from_secs(900),
        };
        assert!(!fresh.is_stale(0.8));

        let old = WeightsUrl {
            url: fresh.url.clone(),
            issued_at: Instant::now() - Duration::from_secs(800),
            ttl: Duration::from_secs(900),
        };
        assert!(old.is_stale(0.8));
    }

    #[test]
    fn test_progress_percent_monotonic_over_stages() {
        let early = ProgressUpdate { stage: Stage::Generation, completed: 10, total: 10 };
        let late = ProgressUpdate { stage: Stage::Persistence, completed: 0, total: 1 };
        assert!(late.percent() >= early.percent());
        let done = ProgressUpdate { stage: Stage::Statistics, completed: 1, total: 1 };
        assert_eq!(done.percent(), 100);
    }
}
