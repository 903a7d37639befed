use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

mod analyzer;
mod detection;
mod dryrun;
mod google;
mod transport;

pub use analyzer::{Analyzer, AnalyzerSettings};
pub use detection::{coerce_score, detect, normalize_labels, normalize_objects, normalize_text};
pub use dryrun::{DryrunGenerator, DryrunVision, InMemoryBlobStore};
pub use google::{CloudStorage, CloudVision, GeminiGenerator};
pub use transport::{error_chain_text, TransportPolicy};

/// Blob store capability: persists image bytes and returns an opaque locator.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn name(&self) -> &str;
    async fn put(&self, bytes: Vec<u8>, path: &str) -> Result<String>;
}

/// Vision capability. Each call returns the raw annotation rows for one
/// feature; normalization happens in [`detect`].
#[async_trait]
pub trait VisionDetector: Send + Sync {
    fn name(&self) -> &str;
    async fn label_detection(&self, locator: &str) -> Result<Vec<Value>>;
    async fn text_detection(&self, locator: &str) -> Result<Vec<Value>>;
    async fn object_localization(&self, locator: &str) -> Result<Vec<Value>>;
}

/// Generative-text capability: prompt in, narrative out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String>;
}
