use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use serde_derive::Deserialize;

/// Engine configuration, loaded from a YAML file. The recognized options are
/// enumerated here; callers may not add unknown knobs through side channels.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub enabled: Option<bool>,
    pub interval: Option<String>,  // e.g., "5m", "1h", "30s"
    pub log: Option<LogSubConfig>,
    pub providers: ProvidersSubConfig,
    #[serde(default)]
    pub generation: GenerationSubConfig,
    pub storage: StorageSubConfig,
    pub captions: Option<CaptionsSubConfig>,
    pub safety: Option<SafetySubConfig>,
    pub database: DatabaseSubConfig,
    #[serde(default)]
    pub jobs: JobsSubConfig,
}

impl Config {

    pub fn new(path: String) -> Self {

        let open_file = File::open(path)
            .unwrap_or_else(|e| panic!("Config path could not be opened: {}", e.to_string()));
        let reader = BufReader::new(open_file);
        let config: Config = serde_yaml::from_reader(reader)
            .unwrap_or_else(|e| panic!("Config could not be parsed: {}", e.to_string()));
        config
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, String> {
        serde_yaml::from_str(s).map_err(|e| e.to_string())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn get_interval_seconds(&self) -> u64 {
        if let Some(interval_str) = &self.interval {
            Self::parse_interval(interval_str)
        } else {
            300  // Default 5 minutes
        }
    }

    fn parse_interval(s: &str) -> u64 {
        let s = s.trim();
        if s.ends_with('s') {
            s[..s.len()-1].parse().unwrap_or(300)
        } else if s.ends_with('m') {
            s[..s.len()-1].parse::<u64>().unwrap_or(5) * 60
        } else if s.ends_with('h') {
            s[..s.len()-1].parse::<u64>().unwrap_or(1) * 3600
        } else if s.ends_with('d') {
            s[..s.len()-1].parse::<u64>().unwrap_or(1) * 86400
        } else {
            s.parse().unwrap_or(300)  // Assume seconds if no unit
        }
    }

    /// Ordered provider chain: primary first, then fallbacks as listed.
    pub fn provider_chain(&self) -> Vec<String> {
        let mut chain = vec![self.providers.primary.clone()];
        chain.extend(self.providers.fallbacks.iter().cloned());
        chain
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct LogSubConfig {
    pub path: String,
    pub debug: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProvidersSubConfig {
    #[serde(rename = "primaryProvider")]
    pub primary: String,
    #[serde(rename = "fallbackProviders", default)]
    pub fallbacks: Vec<String>,
    #[serde(rename = "allowDegradedFallback")]
    pub allow_degraded_fallback: Option<bool>,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: Option<u32>,
    #[serde(rename = "backoffBaseMs")]
    pub backoff_base_ms: Option<u64>,
    #[serde(rename = "requestTimeoutSeconds")]
    pub request_timeout_s: Option<u64>,
    pub backends: HashMap<String, ProviderBackendConfig>,
}

impl ProvidersSubConfig {
    pub fn allow_degraded_fallback(&self) -> bool {
        self.allow_degraded_fallback.unwrap_or(true)
    }

    pub fn max_attempts_for(&self, backend: &ProviderBackendConfig) -> u32 {
        backend.max_attempts
            .or(self.max_attempts)
            .unwrap_or(3)
    }

    pub fn backoff_base_ms_for(&self, backend: &ProviderBackendConfig) -> u64 {
        backend.backoff_base_ms
            .or(self.backoff_base_ms)
            .unwrap_or(1000)
    }

    pub fn request_timeout_seconds(&self) -> u64 {
        self.request_timeout_s.unwrap_or(120)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProviderBackendConfig {
    pub endpoint: String,
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(rename = "apiKeyPath")]
    pub api_key_path: Option<String>,
    #[serde(rename = "supportsWeights")]
    pub supports_weights: Option<bool>,
    #[serde(rename = "supportsSeed")]
    pub supports_seed: Option<bool>,
    #[serde(rename = "costPerImageUsd")]
    pub cost_per_image_usd: Option<f64>,
    #[serde(rename = "costPerSecondUsd")]
    pub cost_per_second_usd: Option<f64>,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: Option<u32>,
    #[serde(rename = "backoffBaseMs")]
    pub backoff_base_ms: Option<u64>,
    /// Which client implementation speaks to this backend.
    pub kind: String,  // serverless, local, stock
}

impl ProviderBackendConfig {
    pub fn get_api_key(&self) -> Result<Option<String>, String> {
        if let Some(key) = &self.api_key {
            return Ok(Some(key.clone()));
        }
        if let Some(key_path) = &self.api_key_path {
            match std::fs::read_to_string(key_path) {
                Ok(content) => Ok(Some(content.trim().to_string())),
                Err(e) => Err(format!("Failed to read API key from {}: {}", key_path, e))
            }
        } else {
            Ok(None)
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct GenerationSubConfig {
    #[serde(rename = "perBatchWorkers")]
    pub per_batch_workers: Option<usize>,
    #[serde(rename = "batchDeadlineSeconds")]
    pub batch_deadline_s: Option<u64>,
    #[serde(rename = "maxFailedFraction")]
    pub max_failed_fraction: Option<f64>,
    #[serde(rename = "syncCapSeconds")]
    pub sync_cap_s: Option<u64>,
}

impl GenerationSubConfig {
    pub fn per_batch_workers(&self) -> usize {
        self.per_batch_workers.unwrap_or(5).max(1)
    }

    pub fn batch_deadline_seconds(&self) -> u64 {
        self.batch_deadline_s.unwrap_or(900)
    }

    pub fn max_failed_fraction(&self) -> f64 {
        self.max_failed_fraction.unwrap_or(0.5).clamp(0.0, 1.0)
    }

    pub fn sync_cap_seconds(&self) -> u64 {
        self.sync_cap_s.unwrap_or(30)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct StorageSubConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(rename = "cdnPrefix")]
    pub cdn_prefix: String,
    #[serde(rename = "signingKey")]
    pub signing_key: Option<String>,
    #[serde(rename = "signingKeyPath")]
    pub signing_key_path: Option<String>,
    #[serde(rename = "weightsUrlTtlSeconds")]
    pub weights_url_ttl_s: Option<u64>,
    #[serde(rename = "uploadEnabled")]
    pub upload_enabled: Option<bool>,
}

impl StorageSubConfig {
    pub fn get_signing_key(&self) -> Result<String, String> {
        if let Some(key) = &self.signing_key {
            return Ok(key.clone());
        }
        if let Some(key_path) = &self.signing_key_path {
            match std::fs::read_to_string(key_path) {
                Ok(content) => Ok(content.trim().to_string()),
                Err(e) => Err(format!("Failed to read signing key from {}: {}", key_path, e))
            }
        } else {
            Err("Either signingKey or signingKeyPath must be provided".to_string())
        }
    }

    pub fn weights_url_ttl_seconds(&self) -> u64 {
        self.weights_url_ttl_s.unwrap_or(900)
    }

    pub fn upload_enabled(&self) -> bool {
        self.upload_enabled.unwrap_or(true)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct CaptionsSubConfig {
    pub endpoint: String,
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub enabled: Option<bool>,
}

impl CaptionsSubConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct SafetySubConfig {
    pub endpoint: Option<String>,
    pub enabled: Option<bool>,
}

impl SafetySubConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseSubConfig {
    pub url: String,
    #[serde(rename = "maxConnections")]
    pub max_connections: Option<u32>,
}

impl DatabaseSubConfig {
    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(5)
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct JobsSubConfig {
    #[serde(rename = "leaseSeconds")]
    pub lease_s: Option<u64>,
    #[serde(rename = "totalWorkerBudget")]
    pub total_worker_budget: Option<usize>,
    #[serde(rename = "pollIntervalMs")]
    pub poll_interval_ms: Option<u64>,
}

impl JobsSubConfig {
    pub fn lease_seconds(&self) -> u64 {
        self.lease_s.unwrap_or(1800)
    }

    pub fn total_worker_budget(&self) -> usize {
        self.total_worker_budget.unwrap_or(20)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.unwrap_or(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
enabled: true
interval: "5m"
log:
  path: ""
  debug: false
providers:
  primaryProvider: serverless
  fallbackProviders: [local, stock]
  allowDegradedFallback: true
  maxAttempts: 3
  backoffBaseMs: 1000
  requestTimeoutSeconds: 120
  backends:
    serverless:
      endpoint: "https://gen.example.com/run"
      kind: serverless
      supportsWeights: true
      supportsSeed: true
      costPerSecondUsd: 0.0005
    local:
      endpoint: "http://127.0.0.1:8188"
      kind: local
      supportsWeights: true
      costPerSecondUsd: 0.0
    stock:
      endpoint: "https://api.stock.example.com/v1/images"
      kind: stock
      supportsWeights: false
      costPerImageUsd: 0.01
generation:
  perBatchWorkers: 5
  batchDeadlineSeconds: 900
  maxFailedFraction: 0.5
storage:
  endpoint: "https://blob.example.com"
  bucket: "content"
  cdnPrefix: "https://cdn.example.com"
  signingKey: "secret"
  weightsUrlTtlSeconds: 900
captions:
  endpoint: "https://llm.example.com/v1/chat/completions"
  model: "small-writer"
safety:
  enabled: true
database:
  url: "sqlite::memory:"
jobs:
  leaseSeconds: 1800
  totalWorkerBudget: 20
"#;

    #[test]
    fn test_full_config_parses() {
        let config = Config::from_yaml_str(FULL).unwrap();
        assert!(config.is_enabled());
        assert_eq!(config.get_interval_seconds(), 300);
        assert_eq!(config.provider_chain(), vec!["serverless", "local", "stock"]);
        assert!(config.providers.allow_degraded_fallback());
        assert_eq!(config.generation.per_batch_workers(), 5);
        assert_eq!(config.storage.weights_url_ttl_seconds(), 900);
        assert_eq!(config.storage.get_signing_key().unwrap(), "secret");
        assert_eq!(config.jobs.total_worker_budget(), 20);
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(Config::parse_interval("30s"), 30);
        assert_eq!(Config::parse_interval("5m"), 300);
        assert_eq!(Config::parse_interval("1h"), 3600);
        assert_eq!(Config::parse_interval("120"), 120);
    }

    #[test]
    fn test_per_backend_retry_overrides() {
        let mut config = Config::from_yaml_str(FULL).unwrap();
        let mut backend = config.providers.backends.get("stock").unwrap().clone();
        assert_eq!(config.providers.max_attempts_for(&backend), 3);
        backend.max_attempts = Some(1);
        assert_eq!(config.providers.max_attempts_for(&backend), 1);
        config.providers.max_attempts = None;
        backend.max_attempts = None;
        assert_eq!(config.providers.max_attempts_for(&backend), 3);
    }

    #[test]
    fn test_missing_signing_key_is_an_error() {
        let mut config = Config::from_yaml_str(FULL).unwrap();
        config.storage.signing_key = None;
        config.storage.signing_key_path = None;
        assert!(config.storage.get_signing_key().is_err());
    }
}
