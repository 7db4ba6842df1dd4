//! Helpers shared by the command-line tools.

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// Installs a stderr subscriber filtered by `RUST_LOG` (default `info`). `verbose` forces
/// `debug` for this crate.
pub fn init_logging(verbose: bool) {
  let filter = if verbose {
    EnvFilter::new("imagefetch=debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
  };
  let _ = fmt::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .with_writer(std::io::stderr)
    .compact()
    .try_init();
}
