// Platform-tuned hook texts from an external language-model backend.
// Caption failure never kills a piece; the orchestrator records a warning
// and moves on without one.

use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use crate::data_structures::{Avatar, Platform};
use crate::errors::EngineError;
use crate::retry::FixedRetry;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

pub struct CaptionService {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    retry: FixedRetry,
}

impl CaptionService {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Self {
        CaptionService {
            client,
            endpoint: endpoint.to_string(),
            api_key,
            model: model.unwrap_or_else(|| "small-writer".to_string()),
            retry: FixedRetry::captions(),
        }
    }

    /// One caption for one piece, within the platform's length budget.
    pub async fn caption(
        &self,
        avatar: &Avatar,
        piece_prompt: &str,
        platform: Platform,
    ) -> Result<String, EngineError> {
        let mut variations = self.variations(avatar, piece_prompt, platform, 1).await?;
        variations
            .pop()
            .ok_or_else(|| EngineError::CaptionBackend("backend returned no caption".to_string()))
    }

    /// Up to `n` distinct hook texts for the same prompt. Used by the
    /// caption preview surface; the batch pipeline asks for one.
    pub async fn variations(
        &self,
        avatar: &Avatar,
        piece_prompt: &str,
        platform: Platform,
        n: usize,
    ) -> Result<Vec<String>, EngineError> {
        let n = n.clamp(1, 10);
        let budget = platform.caption_budget();
        let prompt = build_instruction(avatar, piece_prompt, platform, n, budget);

        let mut last_err = None;
        for attempt in 1..=self.retry.max_attempts {
            match self.call_backend(&prompt).await {
                Ok(raw) => {
                    let captions = parse_captions(&raw, n, budget);
                    if captions.is_empty() {
                        last_err = Some(EngineError::CaptionBackend(
                            "backend returned empty output".to_string(),
                        ));
                    } else {
                        return Ok(captions);
                    }
                }
                Err(e) => {
                    warn!("Caption attempt {} failed: {}", attempt, e);
                    last_err = Some(e);
                }
            }
            if attempt < self.retry.max_attempts {
                sleep(self.retry.delay).await;
            }
        }
        Err(last_err.unwrap_or_else(|| {
            EngineError::CaptionBackend("caption backend unavailable".to_string())
        }))
    }

    async fn call_backend(&self, instruction: &str) -> Result<String, EngineError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                json!({"role": "system",
                       "content": "You write short social media hook captions. \
                                   Output one caption per line, nothing else."}),
                json!({"role": "user", "content": instruction}),
            ],
            max_tokens: 300,
            temperature: 0.9,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::CaptionBackend(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::CaptionBackend(format!(
                "caption backend returned {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::CaptionBackend(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        debug!("Caption backend returned {} characters", content.len());
        Ok(content)
    }
}

fn build_instruction(
    avatar: &Avatar,
    piece_prompt: &str,
    platform: Platform,
    n: usize,
    budget: usize,
) -> String {
    let style = match platform {
        Platform::Instagram => "aesthetic, emoji-friendly, ends with a light question",
        Platform::Tiktok => "punchy, trend-aware, very short",
        Platform::X => "witty one-liner, no hashtags",
        Platform::Onlyfans => "teasing but tasteful, drives to the link",
    };
    format!(
        "Write {} caption(s) for a {} creator's post. Image described as: {}. \
         Style: {}. Hard limit {} characters per caption.",
        n, avatar.niche, piece_prompt, style, budget
    )
}

/// Split backend output into lines, strip list markers, enforce the budget.
fn parse_captions(raw: &str, n: usize, budget: usize) -> Vec<String> {
    raw.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == ')')
                .trim()
                .trim_matches('"')
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .map(|line| truncate_to_budget(&line, budget))
        .take(n)
        .collect()
}

fn truncate_to_budget(s: &str, budget: usize) -> String {
    if s.chars().count() <= budget {
        s.to_string()
    } else {
        s.chars().take(budget).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::GenerationDefaults;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn avatar() -> Avatar {
        Avatar {
            id: "avatar-1".to_string(),
            niche: "fitness".to_string(),
            base_prompt: "photorealistic".to_string(),
            negative_prompt: String::new(),
            trigger_token: "zxqavatar".to_string(),
            weights_uri: Some("loras/avatar-1.safetensors".to_string()),
            default_scale: 0.8,
            default_generation_config: GenerationDefaults::default(),
        }
    }

    fn chat_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "content": content } }]
        })
    }

    #[tokio::test]
    async fn test_caption_within_platform_budget() {
        let server = MockServer::start().await;
        let long_line = "a".repeat(400);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(&long_line)))
            .mount(&server)
            .await;

        let service = CaptionService::new(reqwest::Client::new(), &server.uri(), None, None);
        let caption = service
            .caption(&avatar(), "sunrise run", Platform::Tiktok)
            .await
            .unwrap();
        assert_eq!(caption.chars().count(), Platform::Tiktok.caption_budget());
    }

    #[tokio::test]
    async fn test_variations_parse_lines_and_markers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(
                "1. Rise and grind\n2. \"Morning miles\"\n- Chasing sunlight\n",
            )))
            .mount(&server)
            .await;

        let service = CaptionService::new(reqwest::Client::new(), &server.uri(), None, None);
        let variations = service
            .variations(&avatar(), "sunrise run", Platform::Instagram, 3)
            .await
            .unwrap();
        assert_eq!(
            variations,
            vec!["Rise and grind", "Morning miles", "Chasing sunlight"]
        );
    }

    #[tokio::test]
    async fn test_retries_once_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("Second try wins")))
            .mount(&server)
            .await;

        let service = CaptionService::new(reqwest::Client::new(), &server.uri(), None, None);
        let caption = service
            .caption(&avatar(), "gym selfie", Platform::X)
            .await
            .unwrap();
        assert_eq!(caption, "Second try wins");
    }

    #[tokio::test]
    async fn test_gives_up_after_two_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let service = CaptionService::new(reqwest::Client::new(), &server.uri(), None, None);
        let err = service
            .caption(&avatar(), "gym selfie", Platform::X)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CAPTION_BACKEND");
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let s = "éééééé";
        assert_eq!(truncate_to_budget(s, 3), "ééé");
    }
}
