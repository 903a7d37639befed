use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use sitelens_contracts::events::EventLog;
use sitelens_contracts::ScenarioRegistry;
use sitelens_engine::{
    Analyzer, AnalyzerSettings, CloudStorage, CloudVision, GeminiGenerator, TransportPolicy,
};
use tracing::info;

pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";

/// Backend selection and analysis tuning shared by every subcommand that
/// runs the pipeline.
#[derive(Debug, Clone, Args)]
pub struct BackendArgs {
    /// Cloud Storage bucket that receives uploaded images.
    #[arg(long, env = "GCS_BUCKET_NAME")]
    pub bucket: Option<String>,
    #[arg(long, env = "SITELENS_TEXT_MODEL", default_value = DEFAULT_TEXT_MODEL)]
    pub text_model: String,
    /// JSON file merged over the built-in scenario templates.
    #[arg(long, env = "SITELENS_SCENARIOS")]
    pub scenarios: Option<PathBuf>,
    /// Append analysis events to this JSONL file.
    #[arg(long, env = "SITELENS_EVENTS")]
    pub events: Option<PathBuf>,
    /// Use in-memory storage and offline vision/text stand-ins.
    #[arg(long)]
    pub dryrun: bool,
    #[arg(long, default_value_t = 4)]
    pub batch_concurrency: usize,
    #[arg(long, default_value_t = 90)]
    pub call_timeout_secs: u64,
    #[arg(long, default_value = "civil-eng")]
    pub object_prefix: String,
}

impl BackendArgs {
    pub fn load_registry(&self) -> Result<Arc<ScenarioRegistry>> {
        Ok(Arc::new(ScenarioRegistry::load(self.scenarios.as_deref())?))
    }

    pub fn settings(&self) -> Result<AnalyzerSettings> {
        if self.batch_concurrency == 0 {
            bail!("--batch-concurrency must be at least 1");
        }
        if self.call_timeout_secs == 0 {
            bail!("--call-timeout-secs must be at least 1");
        }
        Ok(AnalyzerSettings {
            object_prefix: self.object_prefix.clone(),
            batch_concurrency: self.batch_concurrency,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        })
    }

    /// Builds the analyzer with every collaborator constructed once.
    pub fn build_analyzer(&self) -> Result<Analyzer> {
        let registry = self.load_registry()?;
        let analyzer = if self.dryrun {
            Analyzer::dryrun(registry)
        } else {
            let Some(bucket) = self.bucket.as_deref().map(str::trim).filter(|b| !b.is_empty())
            else {
                bail!("missing bucket: pass --bucket or set GCS_BUCKET_NAME (or use --dryrun)");
            };
            let policy = TransportPolicy::default();
            Analyzer::new(
                Arc::new(CloudStorage::new(bucket, policy)),
                Arc::new(CloudVision::new(policy)),
                Arc::new(GeminiGenerator::new(self.text_model.clone(), policy)),
                registry,
            )
        };
        let mut analyzer = analyzer.with_settings(self.settings()?);
        if let Some(path) = &self.events {
            analyzer = analyzer.with_events(EventLog::new(path));
        }

        let (storage, vision, generator) = analyzer.backends();
        info!(
            storage,
            vision,
            generator,
            scenarios = analyzer.registry().ids().len(),
            "analyzer ready"
        );
        Ok(analyzer)
    }
}
