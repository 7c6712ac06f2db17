//! Content production core: a batch-oriented, multi-provider image
//! generation pipeline for trained avatars. Generation requests fan out
//! through an ordered provider chain with retries and fallback; surviving
//! pieces are captioned, safety-classified, uploaded to blob storage, and
//! persisted with full cost accounting. An asynchronous job surface wraps
//! the same pipeline for background execution.

pub mod api;
pub mod blob_store;
pub mod captions;
pub mod config;
pub mod cost;
pub mod data_structures;
pub mod errors;
pub mod jobs;
pub mod orchestrator;
pub mod persistence;
pub mod providers;
pub mod retry;
pub mod safety;
pub mod templates;
pub mod url_broker;

#[cfg(test)]
pub mod test_utils;

pub use api::{ContentEngine, PromptOrTemplate};
pub use config::Config;
pub use data_structures::{
    Avatar, BatchConfig, BatchResult, BatchState, ContentKind, ContentPiece, Platform,
    SafetyRating, Tier, TierMix,
};
pub use errors::EngineError;
pub use jobs::{JobManager, JobStatus};
pub use orchestrator::Orchestrator;
