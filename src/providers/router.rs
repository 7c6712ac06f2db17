//! Ordered-fallback dispatch of a single generation request. The router
//! owns retry/backoff per provider, weights-URL freshness, cancellation,
//! and the attempt telemetry that cost accounting is built from.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use log::{debug, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use crate::data_structures::{
    GenerationOutput, GenerationRequest, ProviderAttempt, AttemptOutcome, WeightsUrl,
};
use crate::errors::EngineError;
use crate::providers::provider::{ImageProvider, ProviderError, ProviderErrorKind};
use crate::retry::BackoffPolicy;

/// Fraction of the weights-URL TTL after which a LORA_DOWNLOAD_FAILED is
/// assumed to be signature expiry and a fresh URL is requested.
const STALE_URL_FRACTION: f64 = 0.8;

pub type RemintFuture = Pin<Box<dyn Future<Output = Result<WeightsUrl, EngineError>> + Send>>;
pub type RemintFn = dyn Fn() -> RemintFuture + Send + Sync;

/// A routed request that exhausted its options. Attempts are returned even
/// on failure so the accountant still sees them.
#[derive(Debug)]
pub struct RouteFailure {
    pub error: EngineError,
    pub attempts: Vec<ProviderAttempt>,
}

impl RouteFailure {
    fn new(error: EngineError, attempts: Vec<ProviderAttempt>) -> Self {
        RouteFailure { error, attempts }
    }
}

pub struct ProviderRouter {
    chain: Vec<Arc<dyn ImageProvider>>,
    policies: HashMap<String, BackoffPolicy>,
    allow_degraded_fallback: bool,
    request_timeout: Duration,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("chain_len", &self.chain.len())
            .field("policies", &self.policies)
            .field("allow_degraded_fallback", &self.allow_degraded_fallback)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ProviderRouter {
    pub fn new(
        chain: Vec<Arc<dyn ImageProvider>>,
        policies: HashMap<String, BackoffPolicy>,
        allow_degraded_fallback: bool,
        request_timeout: Duration,
    ) -> Self {
        ProviderRouter {
            chain,
            policies,
            allow_degraded_fallback,
            request_timeout,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.chain.iter().map(|p| p.name().to_string()).collect()
    }

    /// The chain in dispatch order, with the hinted provider (if any)
    /// promoted to the front.
    fn ordered_chain(&self, hint: Option<&str>) -> Vec<Arc<dyn ImageProvider>> {
        let mut chain = self.chain.clone();
        if let Some(hint) = hint {
            if let Some(pos) = chain.iter().position(|p| p.name() == hint) {
                let preferred = chain.remove(pos);
                chain.insert(0, preferred);
            }
        }
        chain
    }

    /// Route one request through the chain. `remint` is invoked when a
    /// weights download fails after most of the URL's TTL has elapsed.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        batch_id: &str,
        piece_index: usize,
        cancel: &CancellationToken,
        remint: Option<&RemintFn>,
        provider_hint: Option<&str>,
    ) -> Result<GenerationOutput, RouteFailure> {
        if self.chain.is_empty() {
            return Err(RouteFailure::new(EngineError::NoProviderAvailable, vec![]));
        }
        if let Err(reason) = request.validate() {
            let error = if reason.starts_with("prompt") {
                EngineError::InvalidPrompt(reason)
            } else {
                EngineError::Validation(reason)
            };
            return Err(RouteFailure::new(error, vec![]));
        }

        let needs_weights = request.weights_url.is_some();
        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut last_errors: Vec<(String, String)> = Vec::new();
        let mut live_request = request;

        for provider in self.ordered_chain(provider_hint) {
            let name = provider.name().to_string();
            if needs_weights && !provider.caps().supports_weights {
                if self.allow_degraded_fallback {
                    debug!("{}: no weight support, degrading request", name);
                } else {
                    debug!("{}: no weight support, skipping", name);
                    last_errors.push((name, "skipped: no weight support".to_string()));
                    continue;
                }
            }

            let policy = self
                .policies
                .get(&name)
                .copied()
                .unwrap_or_else(|| BackoffPolicy::new(3, 1000));

            match self
                .run_provider(
                    provider.as_ref(),
                    &policy,
                    &mut live_request,
                    batch_id,
                    piece_index,
                    cancel,
                    remint,
                    &mut attempts,
                )
                .await
            {
                ProviderVerdict::Success(output) => {
                    let mut output = output;
                    output.attempts = attempts;
                    return Ok(output);
                }
                ProviderVerdict::Exhausted(err) => {
                    last_errors.push((provider.name().to_string(), err.to_string()));
                }
                ProviderVerdict::Abort(error) => {
                    return Err(RouteFailure::new(error, attempts));
                }
            }
        }

        warn!(
            "All providers exhausted for batch {} piece {}",
            batch_id, piece_index
        );
        Err(RouteFailure::new(
            EngineError::AllProvidersFailed(last_errors),
            attempts,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_provider(
        &self,
        provider: &dyn ImageProvider,
        policy: &BackoffPolicy,
        request: &mut GenerationRequest,
        batch_id: &str,
        piece_index: usize,
        cancel: &CancellationToken,
        remint: Option<&RemintFn>,
        attempts: &mut Vec<ProviderAttempt>,
    ) -> ProviderVerdict {
        let name = provider.name();
        let degraded = request.weights_url.is_some() && !provider.caps().supports_weights;
        let mut attempt_no: u32 = 0;

        loop {
            attempt_no += 1;

            if cancel.is_cancelled() {
                return ProviderVerdict::Abort(EngineError::Cancelled);
            }
            let now = Instant::now();
            if now >= request.deadline {
                return ProviderVerdict::Abort(EngineError::DeadlineExceeded);
            }
            let attempt_timeout = self.request_timeout.min(request.deadline - now);

            let effective = if degraded {
                let mut r = request.clone();
                r.weights_url = None;
                r
            } else {
                request.clone()
            };

            let started_at = Utc::now();
            let t0 = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return ProviderVerdict::Abort(EngineError::Cancelled);
                }
                r = provider.generate(&effective, attempt_timeout) => r,
            };
            let duration = t0.elapsed();
            let cost_usd = provider.pricing().cost(duration);

            match result {
                Ok(response) => {
                    attempts.push(ProviderAttempt {
                        batch_id: batch_id.to_string(),
                        piece_index,
                        provider: name.to_string(),
                        attempt_no,
                        started_at,
                        duration_ms: duration.as_millis() as u64,
                        outcome: AttemptOutcome::Ok,
                        error_code: None,
                        cost_usd,
                    });
                    info!(
                        "{}: generated piece {} of batch {} in {} ms (attempt {})",
                        name,
                        piece_index,
                        batch_id,
                        duration.as_millis(),
                        attempt_no
                    );
                    let generation_ms = if response.generation_seconds > 0.0 {
                        (response.generation_seconds * 1000.0) as u64
                    } else {
                        duration.as_millis() as u64
                    };
                    return ProviderVerdict::Success(GenerationOutput {
                        bytes_png: response.bytes_png,
                        width: if response.width > 0 { response.width } else { effective.width },
                        height: if response.height > 0 { response.height } else { effective.height },
                        generation_ms,
                        provider_used: name.to_string(),
                        attempts: vec![],  // filled by the caller
                        cost_usd,
                    });
                }
                Err(err) => {
                    let error_kind = err.kind;
                    let verdict = self
                        .handle_error(err, policy, attempt_no, request, remint, cancel)
                        .await;
                    let will_retry = matches!(verdict, ErrorVerdict::Retry);
                    record_failed_attempt(
                        attempts, batch_id, piece_index, name, attempt_no, started_at, duration,
                        cost_usd, will_retry, error_kind, &verdict,
                    );
                    match verdict {
                        ErrorVerdict::Retry => continue,
                        ErrorVerdict::NextProvider(err) => {
                            return ProviderVerdict::Exhausted(err);
                        }
                        ErrorVerdict::Abort(error) => return ProviderVerdict::Abort(error),
                    }
                }
            }
        }
    }

    async fn handle_error(
        &self,
        err: ProviderError,
        policy: &BackoffPolicy,
        attempt_no: u32,
        request: &mut GenerationRequest,
        remint: Option<&RemintFn>,
        cancel: &CancellationToken,
    ) -> ErrorVerdict {
        if err.kind.is_terminal() {
            return ErrorVerdict::Abort(EngineError::InvalidPrompt(err.message));
        }
        if err.kind.is_fatal_for_provider() {
            return ErrorVerdict::NextProvider(err);
        }

        let cap = err.kind.attempt_cap(policy.max_attempts);
        if attempt_no >= cap {
            return ErrorVerdict::NextProvider(err);
        }

        // Stale signed URL is the usual cause of download failures late in
        // a batch; get a fresh one before burning another attempt.
        if err.kind == ProviderErrorKind::LoraDownloadFailed {
            let stale = request
                .weights_url
                .as_ref()
                .map(|w| w.is_stale(STALE_URL_FRACTION))
                .unwrap_or(false);
            if stale {
                if let Some(remint) = remint {
                    match remint().await {
                        Ok(fresh) => {
                            debug!("Re-minted weights URL before retry");
                            request.weights_url = Some(fresh);
                        }
                        Err(e) => {
                            warn!("Weights URL re-mint failed: {}", e);
                        }
                    }
                }
            }
        }

        let wait = policy.sample_wait(attempt_no + 1, err.retry_after);
        if Instant::now() + wait >= request.deadline {
            // No attempt may start after the deadline; hand the last error
            // to the chain instead of sleeping past it.
            return ErrorVerdict::Abort(EngineError::DeadlineExceeded);
        }
        tokio::select! {
            _ = cancel.cancelled() => ErrorVerdict::Abort(EngineError::Cancelled),
            _ = sleep(wait) => ErrorVerdict::Retry,
        }
    }
}

enum ProviderVerdict {
    Success(GenerationOutput),
    Exhausted(ProviderError),
    Abort(EngineError),
}

enum ErrorVerdict {
    Retry,
    NextProvider(ProviderError),
    Abort(EngineError),
}

#[allow(clippy::too_many_arguments)]
fn record_failed_attempt(
    attempts: &mut Vec<ProviderAttempt>,
    batch_id: &str,
    piece_index: usize,
    provider: &str,
    attempt_no: u32,
    started_at: chrono::DateTime<Utc>,
    duration: Duration,
    cost_usd: f64,
    will_retry: bool,
    error_kind: ProviderErrorKind,
    verdict: &ErrorVerdict,
) {
    let outcome = match verdict {
        ErrorVerdict::Retry => {
            if error_kind == ProviderErrorKind::Timeout {
                AttemptOutcome::Timeout
            } else {
                AttemptOutcome::RetryableError
            }
        }
        ErrorVerdict::NextProvider(err) => err.outcome(will_retry),
        ErrorVerdict::Abort(EngineError::DeadlineExceeded) => AttemptOutcome::Timeout,
        ErrorVerdict::Abort(_) => AttemptOutcome::FatalError,
    };
    let error_code = Some(error_kind.code().to_string());
    attempts.push(ProviderAttempt {
        batch_id: batch_id.to_string(),
        piece_index,
        provider: provider.to_string(),
        attempt_no,
        started_at,
        duration_ms: duration.as_millis() as u64,
        outcome,
        error_code,
        cost_usd,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use crate::providers::provider::{ProviderCaps, ProviderPricing, ProviderResponse};

    struct ScriptedProvider {
        name: String,
        caps: ProviderCaps,
        script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
        seen_weight_urls: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedProvider {
        fn new(
            name: &str,
            caps: ProviderCaps,
            script: Vec<Result<ProviderResponse, ProviderError>>,
        ) -> Arc<Self> {
            Arc::new(ScriptedProvider {
                name: name.to_string(),
                caps,
                script: Mutex::new(script.into()),
                seen_weight_urls: Mutex::new(vec![]),
            })
        }

        fn calls(&self) -> usize {
            self.seen_weight_urls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ImageProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn caps(&self) -> ProviderCaps {
            self.caps
        }

        fn pricing(&self) -> ProviderPricing {
            ProviderPricing { per_image_usd: 0.01, per_second_usd: 0.0 }
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
            _timeout: Duration,
        ) -> Result<ProviderResponse, ProviderError> {
            self.seen_weight_urls
                .lock()
                .unwrap()
                .push(request.weights_url.as_ref().map(|w| w.url.clone()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(ProviderError::new(
                        ProviderErrorKind::GenerationFailed,
                        "script exhausted",
                    ))
                })
        }
    }

    fn ok_response() -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            bytes_png: vec![1, 2, 3],
            width: 1024,
            height: 1024,
            generation_seconds: 1.0,
            model_info: None,
        })
    }

    fn oom() -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::new(ProviderErrorKind::CudaOom, "out of memory"))
    }

    fn weighted_caps() -> ProviderCaps {
        ProviderCaps { supports_weights: true, supports_seed: true }
    }

    fn fast_policies(names: &[&str]) -> HashMap<String, BackoffPolicy> {
        names
            .iter()
            .map(|n| (n.to_string(), BackoffPolicy::new(3, 1)))
            .collect()
    }

    fn request_with_weights() -> GenerationRequest {
        GenerationRequest {
            prompt: "zxqavatar, portrait".to_string(),
            negative_prompt: String::new(),
            weights_url: Some(WeightsUrl {
                url: "https://blob/signed-1".to_string(),
                issued_at: Instant::now(),
                ttl: Duration::from_secs(900),
            }),
            weights_scale: 0.8,
            width: 1024,
            height: 1024,
            steps: 30,
            cfg: 7.0,
            seed: Some(42),
            deadline: Instant::now() + Duration::from_secs(60),
        }
    }

    fn router(
        chain: Vec<Arc<dyn ImageProvider>>,
        policies: HashMap<String, BackoffPolicy>,
    ) -> ProviderRouter {
        ProviderRouter::new(chain, policies, true, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_empty_chain_fails_immediately() {
        let r = router(vec![], HashMap::new());
        let err = r
            .generate(
                request_with_weights(),
                "b1",
                0,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error.code(), "NO_PROVIDER_AVAILABLE");
        assert!(err.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_primary_oom_falls_back_after_full_budget() {
        let primary = ScriptedProvider::new("primary", weighted_caps(), vec![oom(), oom(), oom()]);
        let fallback = ScriptedProvider::new("fallback", weighted_caps(), vec![ok_response()]);
        let r = router(
            vec![primary.clone(), fallback.clone()],
            fast_policies(&["primary", "fallback"]),
        );

        let output = r
            .generate(
                request_with_weights(),
                "b1",
                3,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(output.provider_used, "fallback");
        let on_primary = output
            .attempts
            .iter()
            .filter(|a| a.provider == "primary")
            .count();
        assert_eq!(on_primary, 3);
        assert!(output
            .attempts
            .iter()
            .all(|a| a.attempt_no <= 3));
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_load_failure_skips_to_next_immediately() {
        let primary = ScriptedProvider::new(
            "primary",
            weighted_caps(),
            vec![Err(ProviderError::new(
                ProviderErrorKind::ModelLoadFailed,
                "bad checkpoint",
            ))],
        );
        let fallback = ScriptedProvider::new("fallback", weighted_caps(), vec![ok_response()]);
        let r = router(
            vec![primary.clone(), fallback],
            fast_policies(&["primary", "fallback"]),
        );

        let output = r
            .generate(
                request_with_weights(),
                "b1",
                0,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(primary.calls(), 1);
        assert_eq!(output.provider_used, "fallback");
    }

    #[tokio::test]
    async fn test_generation_failed_earns_exactly_one_retry() {
        let failing = Err(ProviderError::new(
            ProviderErrorKind::GenerationFailed,
            "nan in latents",
        ));
        let primary = ScriptedProvider::new(
            "primary",
            weighted_caps(),
            vec![failing.clone(), failing.clone(), failing],
        );
        let fallback = ScriptedProvider::new("fallback", weighted_caps(), vec![ok_response()]);
        let r = router(
            vec![primary.clone(), fallback],
            fast_policies(&["primary", "fallback"]),
        );

        r.generate(
            request_with_weights(),
            "b1",
            0,
            &CancellationToken::new(),
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_prompt_is_terminal_across_providers() {
        let primary = ScriptedProvider::new(
            "primary",
            weighted_caps(),
            vec![Err(ProviderError::new(
                ProviderErrorKind::InvalidPrompt,
                "policy",
            ))],
        );
        let fallback = ScriptedProvider::new("fallback", weighted_caps(), vec![ok_response()]);
        let r = router(
            vec![primary, fallback.clone()],
            fast_policies(&["primary", "fallback"]),
        );

        let err = r
            .generate(
                request_with_weights(),
                "b1",
                0,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error.code(), "INVALID_PROMPT");
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_providers_exhausted_carries_last_errors() {
        let primary = ScriptedProvider::new("primary", weighted_caps(), vec![oom(), oom(), oom()]);
        let fallback = ScriptedProvider::new("fallback", weighted_caps(), vec![oom(), oom(), oom()]);
        let r = router(
            vec![primary, fallback],
            fast_policies(&["primary", "fallback"]),
        );

        let err = r
            .generate(
                request_with_weights(),
                "b1",
                0,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap_err();
        match err.error {
            EngineError::AllProvidersFailed(ref last) => {
                assert_eq!(last.len(), 2);
                assert!(last.iter().all(|(_, msg)| msg.contains("CUDA_OOM")));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Failed attempts still carry cost.
        assert!(err.attempts.iter().all(|a| a.cost_usd > 0.0));
        assert_eq!(err.attempts.len(), 6);
    }

    #[tokio::test]
    async fn test_cancellation_before_dispatch() {
        let primary = ScriptedProvider::new("primary", weighted_caps(), vec![ok_response()]);
        let r = router(vec![primary.clone()], fast_policies(&["primary"]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = r
            .generate(request_with_weights(), "b1", 0, &cancel, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error.code(), "CANCELLED");
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_attempts_after_deadline() {
        let primary = ScriptedProvider::new("primary", weighted_caps(), vec![ok_response()]);
        let r = router(vec![primary.clone()], fast_policies(&["primary"]));
        let mut request = request_with_weights();
        request.deadline = Instant::now() - Duration::from_secs(1);

        let err = r
            .generate(request, "b1", 0, &CancellationToken::new(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.error.code(), "DEADLINE_EXCEEDED");
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_lora_download_triggers_remint() {
        let primary = ScriptedProvider::new(
            "primary",
            weighted_caps(),
            vec![
                Err(ProviderError::new(
                    ProviderErrorKind::LoraDownloadFailed,
                    "403 from blob store",
                )),
                ok_response(),
            ],
        );
        let r = router(vec![primary.clone()], fast_policies(&["primary"]));

        let mut request = request_with_weights();
        // 90% of the TTL has elapsed: past the re-mint threshold.
        request.weights_url = Some(WeightsUrl {
            url: "https://blob/signed-old".to_string(),
            issued_at: Instant::now() - Duration::from_secs(810),
            ttl: Duration::from_secs(900),
        });

        let remint: Box<RemintFn> = Box::new(|| {
            Box::pin(async {
                Ok(WeightsUrl {
                    url: "https://blob/signed-fresh".to_string(),
                    issued_at: Instant::now(),
                    ttl: Duration::from_secs(900),
                })
            })
        });

        let output = r
            .generate(
                request,
                "b1",
                0,
                &CancellationToken::new(),
                Some(remint.as_ref()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.provider_used, "primary");

        let seen = primary.seen_weight_urls.lock().unwrap().clone();
        assert_eq!(seen[0].as_deref(), Some("https://blob/signed-old"));
        assert_eq!(seen[1].as_deref(), Some("https://blob/signed-fresh"));
    }

    #[tokio::test]
    async fn test_fresh_url_download_failure_does_not_remint() {
        let primary = ScriptedProvider::new(
            "primary",
            weighted_caps(),
            vec![
                Err(ProviderError::new(
                    ProviderErrorKind::LoraDownloadFailed,
                    "blip",
                )),
                ok_response(),
            ],
        );
        let r = router(vec![primary.clone()], fast_policies(&["primary"]));

        let remint_called = Arc::new(Mutex::new(false));
        let flag = remint_called.clone();
        let remint: Box<RemintFn> = Box::new(move || {
            *flag.lock().unwrap() = true;
            Box::pin(async {
                Ok(WeightsUrl {
                    url: "https://blob/unexpected".to_string(),
                    issued_at: Instant::now(),
                    ttl: Duration::from_secs(900),
                })
            })
        });

        r.generate(
            request_with_weights(),
            "b1",
            0,
            &CancellationToken::new(),
            Some(remint.as_ref()),
            None,
        )
        .await
        .unwrap();
        assert!(!*remint_called.lock().unwrap());
    }

    #[tokio::test]
    async fn test_degraded_fallback_strips_weights() {
        let no_weights = ProviderCaps { supports_weights: false, supports_seed: false };
        let stock = ScriptedProvider::new("stock", no_weights, vec![ok_response()]);
        let r = router(vec![stock.clone()], fast_policies(&["stock"]));

        let output = r
            .generate(
                request_with_weights(),
                "b1",
                0,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.provider_used, "stock");
        assert_eq!(stock.seen_weight_urls.lock().unwrap()[0], None);
    }

    #[tokio::test]
    async fn test_strict_mode_skips_weightless_providers() {
        let no_weights = ProviderCaps { supports_weights: false, supports_seed: false };
        let stock = ScriptedProvider::new("stock", no_weights, vec![ok_response()]);
        let r = ProviderRouter::new(
            vec![stock.clone()],
            fast_policies(&["stock"]),
            false,
            Duration::from_secs(30),
        );

        let err = r
            .generate(
                request_with_weights(),
                "b1",
                0,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error.code(), "ALL_PROVIDERS_FAILED");
        assert_eq!(stock.calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_hint_reorders_chain() {
        let primary = ScriptedProvider::new("primary", weighted_caps(), vec![ok_response()]);
        let secondary = ScriptedProvider::new("secondary", weighted_caps(), vec![ok_response()]);
        let r = router(
            vec![primary.clone(), secondary.clone()],
            fast_policies(&["primary", "secondary"]),
        );

        let output = r
            .generate(
                request_with_weights(),
                "b1",
                0,
                &CancellationToken::new(),
                None,
                Some("secondary"),
            )
            .await
            .unwrap();
        assert_eq!(output.provider_used, "secondary");
        assert_eq!(primary.calls(), 0);
    }
}
