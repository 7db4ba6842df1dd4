//! Fetch images through the memory/disk/origin pipeline and report where each one came from.
//!
//! Every source is fetched `--repeat` times; rounds run one after another, so later rounds show
//! the memory tier at work. Pointing `--cache-dir` at the same directory across runs shows the
//! disk tier.

mod common;

use clap::Parser;
use imagefetch::{
  Completion, CompletionQueue, DiskTierConfig, FetchEnv, FetchRequest, FetchResult, HttpSession,
  MemoryTierCoordinator, PipelineConfig, ResourceBundle, SampledDecoder, TargetBox, Tier,
  WorkQueueExecutor,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Parser)]
#[command(
  name = "fetch_images",
  about = "Fetch images through imagefetch's memory and disk caches"
)]
struct Cli {
  /// Image sources: URLs, `file:` paths or `resource:` names.
  #[arg(required = true, value_name = "SOURCE")]
  sources: Vec<String>,

  /// Disk cache directory (overrides IMAGEFETCH_DISK_CACHE_DIR).
  #[arg(long, value_name = "PATH")]
  cache_dir: Option<PathBuf>,

  /// Run without a disk tier even if one is configured in the environment.
  #[arg(long, conflicts_with = "cache_dir")]
  no_disk_cache: bool,

  /// Directory of bundled resources served for `resource:` sources.
  #[arg(long, value_name = "DIR")]
  resources: Option<PathBuf>,

  /// Decode to fit this width (0 keeps the natural size).
  #[arg(long, default_value_t = 0, value_name = "PX")]
  max_width: u32,

  /// Decode to fit this height (0 keeps the natural size).
  #[arg(long, default_value_t = 0, value_name = "PX")]
  max_height: u32,

  /// Worker threads (default: twice the CPU count).
  #[arg(long, value_name = "N")]
  threads: Option<usize>,

  /// Fetch every source this many times.
  #[arg(long, default_value_t = 1, value_name = "N")]
  repeat: usize,

  /// Give up on outstanding fetches after this many seconds.
  #[arg(long, default_value_t = 120, value_name = "SECS")]
  timeout: u64,

  /// Emit one JSON object per fetch.
  #[arg(long)]
  json: bool,

  /// Log pipeline decisions at debug level.
  #[arg(short, long)]
  verbose: bool,
}

#[derive(Debug, Serialize)]
struct FetchReport {
  round: usize,
  source: String,
  ok: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  tier: Option<Tier>,
  #[serde(skip_serializing_if = "Option::is_none")]
  width: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  height: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  natural_width: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  natural_height: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  sample_factor: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
  elapsed_ms: u128,
}

impl FetchReport {
  fn new(round: usize, source: &str, result: &FetchResult, elapsed: Duration) -> Self {
    let image = result.image.as_ref();
    Self {
      round,
      source: source.to_string(),
      ok: result.is_success(),
      tier: result.tier,
      width: image.map(|i| i.width()),
      height: image.map(|i| i.height()),
      natural_width: image.map(|i| i.natural_dimensions().0),
      natural_height: image.map(|i| i.natural_dimensions().1),
      sample_factor: image.map(|i| i.sample_factor()),
      error: result.error.as_ref().map(ToString::to_string),
      elapsed_ms: elapsed.as_millis(),
    }
  }

  fn print_text(&self) {
    match (&self.error, self.tier) {
      (Some(error), _) => println!("[{}] {}: error: {error}", self.round, self.source),
      (None, tier) => println!(
        "[{}] {}: {:?} {}x{} (natural {}x{}, factor {}) in {}ms",
        self.round,
        self.source,
        tier.unwrap_or(Tier::Origin),
        self.width.unwrap_or(0),
        self.height.unwrap_or(0),
        self.natural_width.unwrap_or(0),
        self.natural_height.unwrap_or(0),
        self.sample_factor.unwrap_or(1),
        self.elapsed_ms
      ),
    }
  }
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  common::init_logging(cli.verbose);

  let mut config = PipelineConfig::from_env();
  if let Some(threads) = cli.threads {
    config.executor.threads = Some(threads);
  }
  if let Some(dir) = &cli.cache_dir {
    let disk = match config.disk.take() {
      Some(existing) => DiskTierConfig {
        directory: dir.clone(),
        ..existing
      },
      None => DiskTierConfig::new(dir),
    };
    config.disk = Some(disk);
  }
  if cli.no_disk_cache {
    config.disk = None;
  }

  let resources = match &cli.resources {
    Some(dir) => match ResourceBundle::load(dir) {
      Ok(bundle) => bundle,
      Err(err) => {
        eprintln!("failed to load resources from {}: {err}", dir.display());
        return ExitCode::FAILURE;
      }
    },
    None => ResourceBundle::empty(),
  };

  let executor = match WorkQueueExecutor::new(config.executor.clone()) {
    Ok(executor) => Arc::new(executor),
    Err(err) => {
      eprintln!("failed to start worker pool: {err}");
      return ExitCode::FAILURE;
    }
  };
  let queue = CompletionQueue::new();
  let env = FetchEnv::new(
    HttpSession::new(config.http.clone()),
    Arc::new(SampledDecoder::new(config.decode)),
  )
  .with_resources(Arc::new(resources));
  let coordinator =
    MemoryTierCoordinator::with_env(Arc::clone(&executor), queue.clone(), config, env);

  let target = TargetBox::new(cli.max_width, cli.max_height);
  let deadline = Instant::now() + Duration::from_secs(cli.timeout);
  let mut failures = 0usize;

  for round in 1..=cli.repeat.max(1) {
    let (tx, rx) = mpsc::channel::<(Completion<FetchResult, usize>, Duration)>();
    for (index, source) in cli.sources.iter().enumerate() {
      let tx = tx.clone();
      let started = Instant::now();
      coordinator.fetch(
        FetchRequest::parse(source).with_target(target),
        index,
        move |completion| {
          let _ = tx.send((completion, started.elapsed()));
        },
      );
    }
    drop(tx);

    let remaining = deadline.saturating_duration_since(Instant::now());
    let delivered = queue.run_until(cli.sources.len(), remaining);
    if delivered < cli.sources.len() {
      eprintln!(
        "timed out with {} of {} fetches outstanding",
        cli.sources.len() - delivered,
        cli.sources.len()
      );
      failures += cli.sources.len() - delivered;
    }

    let mut completed: Vec<_> = rx.try_iter().collect();
    completed.sort_by_key(|(completion, _)| completion.token);
    for (completion, elapsed) in &completed {
      let source = &cli.sources[completion.token];
      let report = FetchReport::new(round, source, &completion.payload, *elapsed);
      if !report.ok {
        failures += 1;
      }
      if cli.json {
        println!(
          "{}",
          serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string())
        );
      } else {
        report.print_text();
      }
    }
  }

  if let Err(err) = coordinator.flush() {
    tracing::warn!(error = %err, "disk cache flush failed");
  }
  if let Err(err) = coordinator.close() {
    tracing::warn!(error = %err, "disk cache close failed");
  }
  executor.shutdown_timeout(Duration::from_secs(5));

  if failures > 0 {
    ExitCode::FAILURE
  } else {
    ExitCode::SUCCESS
  }
}
