//! Safety classification. The contract is defined on the decision, not the
//! inputs: when no moderation backend is configured the classifier scores
//! the prompt alone with a keyword heuristic. Results are cached per prompt,
//! which also makes a non-deterministic backend idempotent from the
//! pipeline's point of view.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, warn};
use lru::LruCache;
use serde_derive::{Deserialize, Serialize};
use crate::data_structures::SafetyRating;
use crate::errors::EngineError;

const CACHE_CAPACITY: usize = 2048;

/// Fixed score taxonomy, every axis in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScoreVector {
    pub sexual: f64,
    pub violence: f64,
    pub hate: f64,
    pub self_harm: f64,
    pub harassment: f64,
}

/// Map a score vector onto a rating. Rows are checked strictest-first; the
/// later rows deliberately constrain only the sexual and violence axes.
pub fn rate(scores: &ScoreVector) -> SafetyRating {
    let others_low = scores.hate < 0.50 && scores.self_harm < 0.50 && scores.harassment < 0.50;
    if scores.sexual < 0.20 && scores.violence < 0.10 && others_low {
        SafetyRating::Safe
    } else if scores.sexual < 0.60 && scores.violence < 0.30 {
        SafetyRating::Suggestive
    } else if scores.sexual < 0.90 && scores.violence < 0.50 {
        SafetyRating::Borderline
    } else {
        SafetyRating::Rejected
    }
}

/// Prompt-only heuristic used when no moderation endpoint is configured.
/// Pure: same prompt, same scores.
pub fn score_prompt(prompt: &str) -> ScoreVector {
    let lower = prompt.to_lowercase();
    let mut scores = ScoreVector::default();

    let sexual_strong = ["nude", "explicit", "nsfw", "topless"];
    let sexual_medium = ["boudoir", "lingerie", "sheer", "intimate"];
    let sexual_mild = ["swimwear", "bikini", "glamour", "silhouette", "poolside"];
    if sexual_strong.iter().any(|w| lower.contains(w)) {
        scores.sexual = 0.95;
    } else if sexual_medium.iter().any(|w| lower.contains(w)) {
        scores.sexual = 0.70;
    } else if sexual_mild.iter().any(|w| lower.contains(w)) {
        scores.sexual = 0.40;
    }

    let violence_strong = ["gore", "blood", "weapon", "gun"];
    let violence_mild = ["fight", "battle", "combat"];
    if violence_strong.iter().any(|w| lower.contains(w)) {
        scores.violence = 0.60;
    } else if violence_mild.iter().any(|w| lower.contains(w)) {
        scores.violence = 0.25;
    }

    if ["slur", "racist"].iter().any(|w| lower.contains(w)) {
        scores.hate = 0.80;
    }
    if ["self-harm", "self harm"].iter().any(|w| lower.contains(w)) {
        scores.self_harm = 0.80;
    }
    scores
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<String>,
}

#[derive(Deserialize)]
struct ModerationResponse {
    scores: ScoreVector,
}

pub struct SafetyClassifier {
    client: reqwest::Client,
    endpoint: Option<String>,
    cache: Mutex<LruCache<String, SafetyRating>>,
}

impl SafetyClassifier {
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        SafetyClassifier {
            client,
            endpoint,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    /// Classify one piece. The prompt is the cache key; image bytes are
    /// forwarded to the backend when both are available.
    pub async fn classify(
        &self,
        prompt: &str,
        image: Option<&[u8]>,
    ) -> Result<SafetyRating, EngineError> {
        if let Some(cached) = self.cache.lock().unwrap().get(prompt) {
            return Ok(*cached);
        }

        let rating = match &self.endpoint {
            Some(endpoint) => self.classify_remote(endpoint, prompt, image).await?,
            None => rate(&score_prompt(prompt)),
        };

        self.cache.lock().unwrap().put(prompt.to_string(), rating);
        debug!("Classified prompt as {}", rating.as_str());
        Ok(rating)
    }

    async fn classify_remote(
        &self,
        endpoint: &str,
        prompt: &str,
        image: Option<&[u8]>,
    ) -> Result<SafetyRating, EngineError> {
        let body = ModerationRequest {
            prompt,
            image_base64: image.map(|bytes| BASE64.encode(bytes)),
        };
        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::SafetyBackend(e.to_string()))?;

        if !response.status().is_success() {
            warn!("Moderation backend returned {}", response.status());
            return Err(EngineError::SafetyBackend(format!(
                "moderation backend returned {}",
                response.status()
            )));
        }

        let parsed: ModerationResponse = response
            .json()
            .await
            .map_err(|e| EngineError::SafetyBackend(e.to_string()))?;
        Ok(rate(&parsed.scores))
    }
}
