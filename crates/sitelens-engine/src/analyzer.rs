use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use sitelens_contracts::error::AnalysisResult;
use sitelens_contracts::events::EventLog;
use sitelens_contracts::{
    build_request, AnalysisError, AnalysisOutcome, BatchItemFailure, BatchOutcome, ImageUpload,
    ScenarioRegistry,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detection::detect;
use crate::dryrun::{DryrunGenerator, DryrunVision, InMemoryBlobStore};
use crate::transport::error_chain_text;
use crate::{BlobStore, TextGenerator, VisionDetector};

const MAX_ERROR_CHARS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerSettings {
    /// Leading path segment for stored objects.
    pub object_prefix: String,
    pub batch_concurrency: usize,
    /// Upper bound for each collaborator step (storage, detection, generation).
    pub call_timeout: Duration,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            object_prefix: "civil-eng".to_string(),
            batch_concurrency: 4,
            call_timeout: Duration::from_secs(90),
        }
    }
}

/// Drives storage, detection, prompt assembly and generation for single
/// images and batches. Collaborators are injected at construction.
#[derive(Clone)]
pub struct Analyzer {
    storage: Arc<dyn BlobStore>,
    vision: Arc<dyn VisionDetector>,
    generator: Arc<dyn TextGenerator>,
    registry: Arc<ScenarioRegistry>,
    settings: AnalyzerSettings,
    events: Option<EventLog>,
}

impl Analyzer {
    pub fn new(
        storage: Arc<dyn BlobStore>,
        vision: Arc<dyn VisionDetector>,
        generator: Arc<dyn TextGenerator>,
        registry: Arc<ScenarioRegistry>,
    ) -> Self {
        Self {
            storage,
            vision,
            generator,
            registry,
            settings: AnalyzerSettings::default(),
            events: None,
        }
    }

    /// In-memory storage, empty detections and a prompt-echoing generator.
    pub fn dryrun(registry: Arc<ScenarioRegistry>) -> Self {
        Self::new(
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(DryrunVision),
            Arc::new(DryrunGenerator),
            registry,
        )
    }

    pub fn with_settings(mut self, settings: AnalyzerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &ScenarioRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    pub fn events(&self) -> Option<&EventLog> {
        self.events.as_ref()
    }

    /// Collaborator names, for start-up logging.
    pub fn backends(&self) -> (&str, &str, &str) {
        (
            self.storage.name(),
            self.vision.name(),
            self.generator.name(),
        )
    }

    /// Analyzes one image. Fails atomically: no partial outcome is returned.
    pub async fn analyze_one(
        &self,
        upload: ImageUpload,
        scenario_id: &str,
    ) -> AnalysisResult<AnalysisOutcome> {
        validate_upload(&upload)?;
        self.note_scenario(scenario_id);
        let object_path = format!(
            "{}/{}/{}-{}",
            self.prefix(),
            scenario_id.replace(' ', "_"),
            unique_segment(),
            upload.basename()
        );
        self.run_item(upload, object_path, scenario_id).await
    }

    /// Analyzes every upload, isolating per-item failures.
    ///
    /// Outcomes and failures keep caller input order. The batch itself fails
    /// only on an empty upload list or when no item succeeded. Each item is
    /// stored under its own `{batch}/{index}-{basename}` path, so uploads
    /// sharing a basename never overwrite each other.
    pub async fn analyze_batch(
        &self,
        uploads: Vec<ImageUpload>,
        scenario_id: &str,
    ) -> AnalysisResult<BatchOutcome> {
        if uploads.is_empty() {
            return Err(AnalysisError::validation("No images provided"));
        }
        self.note_scenario(scenario_id);
        let started = Instant::now();
        let attempted = uploads.len();
        let concurrency = self.settings.batch_concurrency.max(1);
        let batch_id = unique_segment();
        let batch_id = batch_id.as_str();

        let results = stream::iter(uploads.into_iter().enumerate())
            .map(|(index, upload)| async move {
                let filename = upload.filename.clone();
                let result = match validate_upload(&upload) {
                    Ok(()) => {
                        let object_path = format!(
                            "{}/batch/{batch_id}/{index}-{}",
                            self.prefix(),
                            upload.basename()
                        );
                        self.run_item(upload, object_path, scenario_id).await
                    }
                    Err(err) => Err(err),
                };
                (index, filename, result)
            })
            .buffered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut outcomes = Vec::new();
        let mut failures = Vec::new();
        for (index, filename, result) in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(index, filename = %filename, kind = err.kind(), "batch item failed: {err}");
                    failures.push(BatchItemFailure {
                        index,
                        filename,
                        error: err.to_string(),
                    });
                }
            }
        }

        self.record(
            "batch_finished",
            json!({
                "scenario": scenario_id,
                "attempted": attempted,
                "analyzed_images": outcomes.len(),
                "failed": failures.len(),
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
        info!(
            scenario = scenario_id,
            attempted,
            analyzed = outcomes.len(),
            failed = failures.len(),
            "batch finished"
        );

        if outcomes.is_empty() {
            let first_error = failures
                .first()
                .map(|failure| failure.error.clone())
                .unwrap_or_default();
            return Err(AnalysisError::BatchFailed {
                attempted,
                first_error,
            });
        }

        Ok(BatchOutcome {
            scenario_id: scenario_id.to_string(),
            outcomes,
            failures,
        })
    }

    async fn run_item(
        &self,
        upload: ImageUpload,
        object_path: String,
        scenario_id: &str,
    ) -> AnalysisResult<AnalysisOutcome> {
        let started = Instant::now();
        let filename = upload.filename.clone();
        self.record(
            "analysis_started",
            json!({
                "scenario": scenario_id,
                "filename": filename,
                "object_path": object_path,
                "bytes": upload.bytes.len(),
            }),
        );

        let result = self.pipeline(upload, &object_path, scenario_id).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => {
                info!(
                    scenario = scenario_id,
                    filename = %filename,
                    locator = %outcome.source_locator,
                    labels = outcome.detection.labels.len(),
                    objects = outcome.detection.objects.len(),
                    elapsed_ms,
                    "analysis completed"
                );
                self.record(
                    "analysis_completed",
                    json!({
                        "scenario": scenario_id,
                        "filename": filename,
                        "image_uri": outcome.source_locator,
                        "labels": outcome.detection.labels.len(),
                        "objects": outcome.detection.objects.len(),
                        "text_snippets": outcome.detection.raw_text.len(),
                        "elapsed_ms": elapsed_ms,
                    }),
                );
            }
            Err(err) => {
                warn!(
                    scenario = scenario_id,
                    filename = %filename,
                    kind = err.kind(),
                    elapsed_ms,
                    "analysis failed: {err}"
                );
                self.record(
                    "analysis_failed",
                    json!({
                        "scenario": scenario_id,
                        "filename": filename,
                        "kind": err.kind(),
                        "error": err.to_string(),
                        "elapsed_ms": elapsed_ms,
                    }),
                );
            }
        }
        result
    }

    async fn pipeline(
        &self,
        upload: ImageUpload,
        object_path: &str,
        scenario_id: &str,
    ) -> AnalysisResult<AnalysisOutcome> {
        let limit = self.settings.call_timeout;

        let stored = self.storage.put(upload.bytes, object_path);
        let source_locator = bounded(limit, "storage upload", stored)
            .await
            .map_err(|err| AnalysisError::storage(error_chain_text(&err, MAX_ERROR_CHARS)))?;

        let detecting = detect(self.vision.as_ref(), &source_locator);
        let detection = match tokio::time::timeout(limit, detecting).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AnalysisError::detection(format!(
                    "detection timed out after {:.1}s",
                    limit.as_secs_f64()
                )))
            }
        };

        let request = build_request(&self.registry, scenario_id, &detection);
        debug!(
            scenario = scenario_id,
            template = %request.template_id,
            version = request.template_version,
            prompt_chars = request.rendered_prompt.len(),
            "analysis request built"
        );

        let generating = self.generator.generate(&request.rendered_prompt);
        let narrative_text = bounded(limit, "generation", generating)
            .await
            .map_err(|err| AnalysisError::generation(error_chain_text(&err, MAX_ERROR_CHARS)))?;

        Ok(AnalysisOutcome {
            scenario_id: scenario_id.to_string(),
            filename: upload.filename,
            detection,
            narrative_text,
            source_locator,
        })
    }

    fn prefix(&self) -> &str {
        self.settings.object_prefix.trim_end_matches('/')
    }

    fn note_scenario(&self, scenario_id: &str) {
        let selection = self.registry.select(scenario_id);
        if let Some(reason) = selection.fallback_reason {
            info!(scenario = scenario_id, "{reason}");
        }
    }

    fn record(&self, event_type: &str, payload: Value) {
        if let Some(events) = &self.events {
            events.record(event_type, map_object(payload));
        }
    }
}

fn unique_segment() -> String {
    Uuid::new_v4().simple().to_string()
}

fn validate_upload(upload: &ImageUpload) -> AnalysisResult<()> {
    if upload.basename().trim().is_empty() {
        return Err(AnalysisError::validation("No file selected"));
    }
    if upload.bytes.is_empty() {
        return Err(AnalysisError::validation(format!(
            "Uploaded file '{}' is empty",
            upload.filename
        )));
    }
    Ok(())
}

async fn bounded<T>(
    limit: Duration,
    step: &str,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => bail!("{step} timed out after {:.1}s", limit.as_secs_f64()),
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
