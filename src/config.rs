//! Pipeline configuration and `IMAGEFETCH_*` environment toggles.
//!
//! Every component has its own config struct with a [`Default`] and `with_*` builders.
//! [`PipelineConfig`] aggregates them; [`PipelineConfig::from_env`] layers environment overrides
//! on top of the defaults so binaries and embedders share one parsing path.

use crate::executor::ExecutorConfig;
use crate::image_loader::DecodeLimits;
use crate::resource::disk_cache::DiskCacheConfig;
use crate::resource::HttpConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for all toggles.
pub const ENV_PREFIX: &str = "IMAGEFETCH_";

/// Subdirectory used for downloaded bytes when the disk tier is rooted at an app cache dir.
pub const DISK_CACHE_SUBDIR: &str = "http";

/// Default in-memory budget for decoded images (bytes of RGBA pixels).
pub const DEFAULT_MEMORY_CACHE_BYTES: u64 = 32 * 1024 * 1024;

/// Parsed `IMAGEFETCH_*` environment variables.
///
/// Values are captured once and then read through typed getters. Callers can also construct
/// instances from a map to override environment-derived behavior when embedding the library.
#[derive(Debug, Clone, Default)]
pub struct RuntimeToggles {
  raw: HashMap<String, String>,
}

impl RuntimeToggles {
  /// Parse all `IMAGEFETCH_*` environment variables into a toggle map.
  pub fn from_env() -> Self {
    let raw = std::env::vars()
      .filter(|(k, _)| k.starts_with(ENV_PREFIX))
      .collect::<HashMap<_, _>>();
    Self { raw }
  }

  /// Construct a toggle set from a provided map of key/value pairs.
  pub fn from_map(raw: HashMap<String, String>) -> Self {
    Self { raw }
  }

  /// Returns the raw string value for a toggle, if set.
  pub fn get(&self, key: &str) -> Option<&str> {
    self
      .raw
      .get(key)
      .map(String::as_str)
      .filter(|v| !v.trim().is_empty())
  }

  /// Returns true when the toggle is present and truthy (`!= 0`/`false`/`off`/`no`).
  pub fn truthy(&self, key: &str) -> bool {
    self.truthy_with_default(key, false)
  }

  pub fn truthy_with_default(&self, key: &str, default: bool) -> bool {
    self
      .get(key)
      .map(|v| !matches_ignore_case(v, &["0", "false", "off", "no"]))
      .unwrap_or(default)
  }

  /// Parse a toggle as `usize`, returning `None` when unset or unparseable.
  pub fn usize(&self, key: &str) -> Option<usize> {
    self.get(key).and_then(|v| v.trim().parse::<usize>().ok())
  }

  /// Parse a toggle as `u64`, returning `None` when unset or unparseable.
  pub fn u64(&self, key: &str) -> Option<u64> {
    self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
  }

  /// Parse a millisecond toggle into a [`Duration`].
  pub fn duration_ms(&self, key: &str) -> Option<Duration> {
    self.u64(key).map(Duration::from_millis)
  }
}

fn matches_ignore_case(value: &str, candidates: &[&str]) -> bool {
  let lower = value.trim().to_ascii_lowercase();
  candidates.iter().any(|c| lower == *c)
}

/// Where and how the disk tier is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTierConfig {
  pub directory: PathBuf,
  pub cache: DiskCacheConfig,
}

impl DiskTierConfig {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      cache: DiskCacheConfig::default(),
    }
  }

  /// Disk tier rooted at `<app_cache_dir>/http`.
  pub fn under(app_cache_dir: &Path) -> Self {
    Self::new(app_cache_dir.join(DISK_CACHE_SUBDIR))
  }

  pub fn with_cache_config(mut self, cache: DiskCacheConfig) -> Self {
    self.cache = cache;
    self
  }
}

/// Complete configuration for a [`crate::MemoryTierCoordinator`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub executor: ExecutorConfig,
  /// Byte budget for decoded images held in memory. `0` disables the memory tier.
  pub memory_max_bytes: u64,
  /// `None` runs without a disk tier.
  pub disk: Option<DiskTierConfig>,
  pub http: HttpConfig,
  pub decode: DecodeLimits,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      executor: ExecutorConfig::default(),
      memory_max_bytes: DEFAULT_MEMORY_CACHE_BYTES,
      disk: None,
      http: HttpConfig::default(),
      decode: DecodeLimits::default(),
    }
  }
}

impl PipelineConfig {
  /// Defaults overridden by `IMAGEFETCH_*` environment variables.
  pub fn from_env() -> Self {
    Self::from_toggles(&RuntimeToggles::from_env())
  }

  pub fn from_toggles(toggles: &RuntimeToggles) -> Self {
    let mut config = Self::default();

    if let Some(threads) = toggles.usize("IMAGEFETCH_THREADS").filter(|n| *n > 0) {
      config.executor.threads = Some(threads);
    }
    config.executor.background_priority = toggles.truthy_with_default(
      "IMAGEFETCH_BACKGROUND_PRIORITY",
      config.executor.background_priority,
    );
    if let Some(bytes) = toggles.u64("IMAGEFETCH_MEMORY_CACHE_BYTES") {
      config.memory_max_bytes = bytes;
    }

    if let Some(dir) = toggles.get("IMAGEFETCH_DISK_CACHE_DIR") {
      let mut disk = DiskTierConfig::new(dir.trim());
      if let Some(bytes) = toggles.u64("IMAGEFETCH_DISK_CACHE_BYTES") {
        disk.cache.max_bytes = bytes;
      }
      if let Some(version) = toggles
        .get("IMAGEFETCH_DISK_CACHE_VERSION")
        .and_then(|v| v.trim().parse::<u32>().ok())
      {
        disk.cache.app_version = version;
      }
      config.disk = Some(disk);
    }

    if let Some(timeout) = toggles.duration_ms("IMAGEFETCH_CONNECT_TIMEOUT_MS") {
      config.http.connect_timeout = Some(timeout);
    }
    if let Some(timeout) = toggles.duration_ms("IMAGEFETCH_TIMEOUT_MS") {
      config.http.timeout = Some(timeout);
    }
    if let Some(limit) = toggles.u64("IMAGEFETCH_MAX_RESPONSE_BYTES") {
      config.http.max_response_bytes = Some(limit);
    }
    if let Some(agent) = toggles.get("IMAGEFETCH_USER_AGENT") {
      config.http.user_agent = agent.trim().to_string();
    }

    config
  }

  pub fn with_disk_cache(mut self, disk: DiskTierConfig) -> Self {
    self.disk = Some(disk);
    self
  }

  pub fn without_disk_cache(mut self) -> Self {
    self.disk = None;
    self
  }

  pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
    self.executor = executor;
    self
  }

  pub fn with_memory_max_bytes(mut self, bytes: u64) -> Self {
    self.memory_max_bytes = bytes;
    self
  }

  pub fn with_http(mut self, http: HttpConfig) -> Self {
    self.http = http;
    self
  }

  pub fn with_decode_limits(mut self, decode: DecodeLimits) -> Self {
    self.decode = decode;
    self
  }
}
