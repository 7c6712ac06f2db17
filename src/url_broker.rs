// Short-lived signed read URLs for objects in blob storage. Remote
// generation workers never see storage credentials; they get a URL that
// grants GET on exactly one path until it expires.

use std::time::{Duration, Instant};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::debug;
use sha2::Sha256;
use crate::data_structures::WeightsUrl;
use crate::errors::EngineError;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_WEIGHTS_TTL: Duration = Duration::from_secs(900);

#[derive(Debug)]
pub struct UrlBroker {
    endpoint: String,
    bucket: String,
    key: Vec<u8>,
}

impl UrlBroker {
    pub fn new(endpoint: &str, bucket: &str, signing_key: &str) -> Result<Self, EngineError> {
        if signing_key.is_empty() {
            return Err(EngineError::StorageUnavailable(
                "signing key is not configured".to_string(),
            ));
        }
        Ok(UrlBroker {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            key: signing_key.as_bytes().to_vec(),
        })
    }

    /// Mint a read-only URL for `path`, valid for `ttl` from now. The
    /// signature covers the method, the exact path, and the expiry instant,
    /// so the URL grants nothing else.
    pub fn mint_read(&self, path: &str, ttl: Duration) -> Result<WeightsUrl, EngineError> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.sign("GET", path, expires);
        let url = format!(
            "{}/{}/{}?expires={}&signature={}",
            self.endpoint, self.bucket, path, expires, signature
        );
        debug!("Minted read URL for {} expiring at {}", path, expires);
        Ok(WeightsUrl {
            url,
            issued_at: Instant::now(),
            ttl,
        })
    }

    fn sign(&self, method: &str, path: &str, expires: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{}\n{}\n{}", method, path, expires).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check a signature produced by `mint_read`. Used by the storage stub
    /// in tests; production verification lives in the storage service.
    pub fn verify_read(&self, path: &str, expires: i64, signature: &str) -> bool {
        if Utc::now().timestamp() >= expires {
            return false;
        }
        let expected = self.sign("GET", path, expires);
        // Same-length hex strings; compare without early exit.
        if expected.len() != signature.len() {
            return false;
        }
        expected
            .bytes()
            .zip(signature.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
