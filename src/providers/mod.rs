pub mod provider;
pub mod router;
pub mod serverless;
pub mod local_sd;
pub mod stock_image;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use log::info;
use crate::config::{Config, ProviderBackendConfig};
use crate::errors::EngineError;
use crate::providers::provider::{ImageProvider, ProviderCaps, ProviderPricing};
use crate::providers::router::ProviderRouter;
use crate::retry::BackoffPolicy;

fn build_backend(
    name: &str,
    backend: &ProviderBackendConfig,
    client: &reqwest::Client,
) -> Result<Arc<dyn ImageProvider>, EngineError> {
    let caps = ProviderCaps {
        supports_weights: backend.supports_weights.unwrap_or(false),
        supports_seed: backend.supports_seed.unwrap_or(false),
    };
    let pricing = ProviderPricing {
        per_image_usd: backend.cost_per_image_usd.unwrap_or(0.0),
        per_second_usd: backend.cost_per_second_usd.unwrap_or(0.0),
    };
    let api_key = backend
        .get_api_key()
        .map_err(EngineError::Configuration)?;

    let provider: Arc<dyn ImageProvider> = match backend.kind.as_str() {
        "serverless" => Arc::new(serverless::ServerlessProvider::new(
            name,
            client.clone(),
            &backend.endpoint,
            api_key,
            caps,
            pricing,
        )),
        "local" => Arc::new(local_sd::LocalSdProvider::new(
            name,
            client.clone(),
            &backend.endpoint,
            caps,
            pricing,
        )),
        "stock" => Arc::new(stock_image::StockImageProvider::new(
            name,
            client.clone(),
            &backend.endpoint,
            api_key,
            pricing,
        )),
        other => {
            return Err(EngineError::Configuration(format!(
                "unknown provider kind '{}' for backend '{}'",
                other, name
            )))
        }
    };
    Ok(provider)
}

/// Build the router from configuration: every name in the chain must have a
/// backend entry, and the chain must not be empty.
pub fn build_router(config: &Config, client: &reqwest::Client) -> Result<ProviderRouter, EngineError> {
    let chain_names = config.provider_chain();
    if chain_names.is_empty() {
        return Err(EngineError::Configuration(
            "no providers configured".to_string(),
        ));
    }

    let mut chain: Vec<Arc<dyn ImageProvider>> = Vec::with_capacity(chain_names.len());
    let mut policies: HashMap<String, BackoffPolicy> = HashMap::new();
    for name in &chain_names {
        let backend = config.providers.backends.get(name).ok_or_else(|| {
            EngineError::Configuration(format!("provider '{}' has no backend entry", name))
        })?;
        chain.push(build_backend(name, backend, client)?);
        policies.insert(
            name.clone(),
            BackoffPolicy::new(
                config.providers.max_attempts_for(backend),
                config.providers.backoff_base_ms_for(backend),
            ),
        );
    }

    info!("Provider chain: {}", chain_names.join(" -> "));
    Ok(ProviderRouter::new(
        chain,
        policies,
        config.providers.allow_degraded_fallback(),
        Duration::from_secs(config.providers.request_timeout_seconds()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const YAML: &str = r#"
providers:
  primaryProvider: serverless
  fallbackProviders: [local, stock]
  backends:
    serverless:
      endpoint: "https://gen.example.com/run"
      kind: serverless
      supportsWeights: true
    local:
      endpoint: "http://127.0.0.1:8188"
      kind: local
      supportsWeights: true
    stock:
      endpoint: "https://api.stock.example.com/v1/images"
      kind: stock
storage:
  endpoint: "https://blob.example.com"
  bucket: "content"
  cdnPrefix: "https://cdn.example.com"
  signingKey: "secret"
database:
  url: "sqlite::memory:"
"#;

    #[test]
    fn test_router_built_in_chain_order() {
        let config = Config::from_yaml_str(YAML).unwrap();
        let router = build_router(&config, &reqwest::Client::new()).unwrap();
        assert_eq!(router.provider_names(), vec!["serverless", "local", "stock"]);
    }

    #[test]
    fn test_unknown_backend_is_configuration_error() {
        let mut config = Config::from_yaml_str(YAML).unwrap();
        config.providers.fallbacks.push("missing".to_string());
        let err = build_router(&config, &reqwest::Client::new()).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }

    #[test]
    fn test_unknown_kind_is_configuration_error() {
        let mut config = Config::from_yaml_str(YAML).unwrap();
        config
            .providers
            .backends
            .get_mut("stock")
            .unwrap()
            .kind = "mainframe".to_string();
        let err = build_router(&config, &reqwest::Client::new()).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }
}
