use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use sitelens_contracts::events::EventLog;
use sitelens_contracts::scenarios::{DEFAULT_BATCH_SCENARIO, DEFAULT_SINGLE_SCENARIO};
use sitelens_contracts::{ImageUpload, ScenarioRegistry};
use tracing::{warn, Level};

mod config;
mod server;

use config::BackendArgs;

#[derive(Debug, Parser)]
#[command(
    name = "sitelens",
    version,
    about = "Civil-engineering image analysis service"
)]
struct Cli {
    /// trace, debug, info, warn or error.
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP service.
    Serve(ServeArgs),
    /// Analyze one image and print the response JSON.
    Analyze(AnalyzeArgs),
    /// Analyze several images as one batch and print the response JSON.
    Batch(BatchArgs),
    /// List registered scenario templates.
    Scenarios(ScenariosArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "SITELENS_BIND", default_value = "0.0.0.0:8080")]
    bind: String,
    #[arg(long, default_value_t = 32)]
    max_upload_mb: usize,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = DEFAULT_SINGLE_SCENARIO)]
    scenario: String,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long = "image", required = true, num_args = 1..)]
    images: Vec<PathBuf>,
    #[arg(long, default_value = DEFAULT_BATCH_SCENARIO)]
    scenario: String,
    #[command(flatten)]
    backend: BackendArgs,
}

#[derive(Debug, Parser)]
struct ScenariosArgs {
    #[arg(long, env = "SITELENS_SCENARIOS")]
    scenarios: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sitelens error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Analyze(args) => run_analyze(args),
        Command::Batch(args) => run_batch(args),
        Command::Scenarios(args) => run_scenarios(args),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    if args.max_upload_mb == 0 {
        bail!("--max-upload-mb must be at least 1");
    }
    let analyzer = args.backend.build_analyzer()?;
    let max_upload_bytes = args.max_upload_mb.saturating_mul(1024 * 1024);
    let events = analyzer.events().cloned();
    let served = runtime()?.block_on(server::serve(analyzer, &args.bind, max_upload_bytes));
    flush_events(events.as_ref());
    served?;
    Ok(0)
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let upload = read_upload(&args.image)?;
    let analyzer = args.backend.build_analyzer()?;
    let outcome = runtime()?.block_on(analyzer.analyze_one(upload, &args.scenario));
    flush_events(analyzer.events());
    let outcome = outcome?;
    print_json(&outcome.to_response_json())?;
    Ok(0)
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let uploads = args
        .images
        .iter()
        .map(|path| read_upload(path))
        .collect::<Result<Vec<ImageUpload>>>()?;
    let analyzer = args.backend.build_analyzer()?;
    let batch = runtime()?.block_on(analyzer.analyze_batch(uploads, &args.scenario));
    flush_events(analyzer.events());
    let batch = batch?;
    print_json(&batch.to_response_json())?;
    Ok(if batch.failures.is_empty() { 0 } else { 2 })
}

fn run_scenarios(args: ScenariosArgs) -> Result<i32> {
    let registry = ScenarioRegistry::load(args.scenarios.as_deref())?;
    for template in registry.list() {
        println!("{}\tv{}", template.id, template.version);
    }
    let fallback = registry.fallback();
    println!("{}\tv{}\t(fallback)", fallback.id, fallback.version);
    Ok(0)
}

fn read_upload(path: &Path) -> Result<ImageUpload> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(ImageUpload::new(filename, bytes))
}

/// `main` exits through `std::process::exit`, which would drop queued events.
fn flush_events(events: Option<&EventLog>) {
    if let Some(events) = events {
        if let Err(err) = events.flush() {
            warn!("event log incomplete: {err:#}");
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
