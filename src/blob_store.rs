// Object storage client. Paths are chosen by callers so that a retried PUT
// overwrites with identical bytes, which makes uploads idempotent by path.

use log::{debug, warn};
use reqwest::StatusCode;
use crate::errors::EngineError;

/// Canonical path for a stored content piece.
pub fn content_path(avatar_id: &str, piece_id: &str, ext: &str) -> String {
    format!("content/{}/{}.{}", avatar_id, piece_id, ext)
}

/// Canonical path for an avatar's fine-tuned weights. Written by the
/// training system, only read here.
pub fn weights_path(avatar_id: &str) -> String {
    format!("loras/{}.safetensors", avatar_id)
}

#[derive(Clone)]
pub struct BlobStoreClient {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    cdn_prefix: String,
}

impl BlobStoreClient {
    pub fn new(client: reqwest::Client, endpoint: &str, bucket: &str, cdn_prefix: &str) -> Self {
        BlobStoreClient {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            cdn_prefix: cdn_prefix.trim_end_matches('/').to_string(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, path)
    }

    /// CDN-fronted URL for a stored object. This is what ends up on content
    /// rows, never the signed URL.
    pub fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.cdn_prefix, path)
    }

    /// Idempotent by path: retrying with the same path and bytes yields
    /// identical observable state.
    pub async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, EngineError> {
        let url = self.object_url(path);
        debug!("PUT {} ({} bytes)", url, bytes.len());
        let response = self
            .client
            .put(&url)
            .header("content-type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(self.public_url(path))
        } else {
            Err(map_status(status, path))
        }
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>, EngineError> {
        let url = self.object_url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await.map_err(map_request_error)?;
            Ok(bytes.to_vec())
        } else {
            Err(map_status(status, path))
        }
    }

    pub async fn copy(&self, src: &str, dst: &str) -> Result<(), EngineError> {
        let bytes = self.get(src).await?;
        self.put(dst, bytes, "application/octet-stream").await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), EngineError> {
        let url = self.object_url(path);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        // Deleting a missing object converges to the same state.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            warn!("DELETE {} returned {}", path, status);
            Err(map_status(status, path))
        }
    }
}

fn map_request_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() || e.is_connect() {
        EngineError::StorageTransient(e.to_string())
    } else {
        EngineError::StorageFatal(e.to_string())
    }
}

fn map_status(status: StatusCode, path: &str) -> EngineError {
    match status {
        StatusCode::NOT_FOUND => EngineError::StorageNotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EngineError::StorageUnavailable(format!("{} on {}", status, path))
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            EngineError::StorageTransient(format!("{} on {}", s, path))
        }
        s => EngineError::StorageFatal(format!("{} on {}", s, path)),
    }
}
