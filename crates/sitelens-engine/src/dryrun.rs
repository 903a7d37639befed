use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use crate::{BlobStore, TextGenerator, VisionDetector};

pub const DEFAULT_MAX_OBJECTS: usize = 256;

/// Keeps uploads in process memory under `memory://` locators.
///
/// Holds at most `max_objects` images; the oldest upload is evicted first,
/// so a long-running dryrun server stays bounded.
#[derive(Debug)]
pub struct InMemoryBlobStore {
    objects: Mutex<IndexMap<String, Vec<u8>>>,
    max_objects: usize,
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::with_max_objects(DEFAULT_MAX_OBJECTS)
    }
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_objects(max_objects: usize) -> Self {
        Self {
            objects: Mutex::new(IndexMap::new()),
            max_objects: max_objects.max(1),
        }
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(path).cloned())
    }

    /// Stored paths, oldest first.
    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, bytes: Vec<u8>, path: &str) -> Result<String> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("in-memory blob store lock poisoned"))?;
        objects.shift_remove(path);
        objects.insert(path.to_string(), bytes);
        while objects.len() > self.max_objects {
            objects.shift_remove_index(0);
        }
        Ok(format!("memory://{path}"))
    }
}

/// Vision stand-in that detects nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunVision;

#[async_trait]
impl VisionDetector for DryrunVision {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn label_detection(&self, _locator: &str) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn text_detection(&self, _locator: &str) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }

    async fn object_localization(&self, _locator: &str) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

/// Generator stand-in that summarizes the prompt it was given.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunGenerator;

#[async_trait]
impl TextGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let headline = prompt.lines().next().unwrap_or_default().trim();
        Ok(format!(
            "[dryrun] {} prompt lines, {} chars. {headline}",
            prompt.lines().count(),
            prompt.chars().count()
        ))
    }
}
