//! Inspect (and optionally clean) an imagefetch disk cache directory.
//!
//! Opening a cache with a different app version wipes it, so the journal header is read first
//! and the stored version is used unless one is given explicitly. A mismatching explicit
//! version is refused unless `--force` is passed.

mod common;

use clap::Parser;
use imagefetch::error::ErrorKind;
use imagefetch::image_loader::sniff_image_format;
use imagefetch::resource::EntryInfo;
use imagefetch::{DiskCache, DiskCacheConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
  name = "disk_cache_audit",
  about = "Audit (and optionally clean) an imagefetch disk cache"
)]
struct Cli {
  /// Disk cache directory.
  #[arg(long, value_name = "PATH")]
  cache_dir: PathBuf,

  /// App version to open with (default: the version recorded in the journal).
  #[arg(long, value_name = "N")]
  app_version: Option<u32>,

  /// Values per entry (default: the count recorded in the journal).
  #[arg(long, value_name = "N")]
  value_count: Option<usize>,

  /// Open even when --app-version/--value-count disagree with the journal. This wipes the
  /// directory.
  #[arg(long)]
  force: bool,

  /// Remove entries whose first value does not look like an image.
  #[arg(long)]
  delete_non_images: bool,

  /// Remove every entry.
  #[arg(long, conflicts_with = "delete_non_images")]
  clear: bool,

  /// Evict down to this many bytes before reporting.
  #[arg(long, value_name = "BYTES")]
  max_bytes: Option<u64>,

  /// List the N most recently used entries (0 disables).
  #[arg(long, default_value_t = 10, value_name = "N")]
  top: usize,

  /// Emit a single JSON object for scripting.
  #[arg(long)]
  json: bool,

  #[arg(short, long)]
  verbose: bool,
}

#[derive(Debug, Default, Serialize)]
struct AuditReport {
  cache_dir: String,
  app_version: u32,
  value_count: usize,
  entries: usize,
  bytes: u64,
  non_image_entries: usize,
  unreadable_entries: usize,
  deleted_entries: usize,
  evicted_entries: usize,
  most_recent: Vec<EntryInfo>,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  common::init_logging(cli.verbose);
  match run(&cli) {
    Ok(report) => {
      print_report(&cli, &report);
      ExitCode::SUCCESS
    }
    Err(message) => {
      eprintln!("disk_cache_audit: {message}");
      ExitCode::FAILURE
    }
  }
}

fn run(cli: &Cli) -> Result<AuditReport, String> {
  let stored = DiskCache::stored_version(&cli.cache_dir).map_err(|e| e.to_string())?;
  let (stored_version, stored_count) = stored.unwrap_or((1, 1));
  let app_version = cli.app_version.unwrap_or(stored_version);
  let value_count = cli.value_count.unwrap_or(stored_count);
  if stored.is_some() && (app_version, value_count) != (stored_version, stored_count) && !cli.force
  {
    return Err(format!(
      "journal records app version {stored_version} with {stored_count} value(s); opening as \
       {app_version}/{value_count} would wipe the cache (pass --force to do so)"
    ));
  }

  let config = DiskCacheConfig::default()
    .with_app_version(app_version)
    .with_value_count(value_count)
    .with_max_bytes(u64::MAX);
  let cache = DiskCache::open_with_config(&cli.cache_dir, config).map_err(|e| e.to_string())?;

  let mut report = AuditReport {
    cache_dir: cli.cache_dir.display().to_string(),
    app_version,
    value_count,
    ..AuditReport::default()
  };

  for entry in cache.entries() {
    match cache.read_entry(&entry.key, 0) {
      Ok(Some(bytes)) if sniff_image_format(&bytes).is_some() => {}
      Ok(Some(_)) => {
        report.non_image_entries += 1;
        if cli.delete_non_images && cache.remove(&entry.key).map_err(|e| e.to_string())? {
          report.deleted_entries += 1;
        }
      }
      // `read_entry` already dropped the broken entry.
      Ok(None) => report.unreadable_entries += 1,
      Err(err) if err.kind() == ErrorKind::Closed => return Err(err.to_string()),
      Err(err) => {
        tracing::warn!(key = %entry.key, error = %err, "could not read entry");
        report.unreadable_entries += 1;
      }
    }
  }

  if cli.clear {
    report.deleted_entries += cache.clear().map_err(|e| e.to_string())?;
  }
  if let Some(max_bytes) = cli.max_bytes {
    let before = cache.len();
    cache.set_max_size(max_bytes).map_err(|e| e.to_string())?;
    report.evicted_entries = before.saturating_sub(cache.len());
  }

  report.entries = cache.len();
  report.bytes = cache.size();
  report.most_recent = cache.entries().into_iter().rev().take(cli.top).collect();
  cache.close().map_err(|e| e.to_string())?;
  Ok(report)
}

fn print_report(cli: &Cli, report: &AuditReport) {
  if cli.json {
    println!(
      "{}",
      serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
    );
    return;
  }

  println!("Disk cache audit: {}", report.cache_dir);
  println!(
    "Format: app_version={} value_count={}",
    report.app_version, report.value_count
  );
  println!("Entries: {} ({} bytes)", report.entries, report.bytes);
  println!(
    "Problems: non_image={} unreadable={}",
    report.non_image_entries, report.unreadable_entries
  );
  if report.deleted_entries > 0 || report.evicted_entries > 0 {
    println!(
      "Deleted: {} Evicted: {}",
      report.deleted_entries, report.evicted_entries
    );
  }
  if !report.most_recent.is_empty() {
    println!();
    println!("Most recently used:");
    for entry in &report.most_recent {
      let lengths: Vec<String> = entry.lengths.iter().map(u64::to_string).collect();
      println!("  {} [{}]", entry.key, lengths.join(", "));
    }
  }
}
