//! Error types for imagefetch
//!
//! Every failure in the pipeline is reported as a value of [`Error`]. Subsystems have their own
//! enums (image decoding, networking, the disk cache) which convert into the top-level type with
//! `?`. Errors are `Clone` so a single failure can be fanned out to every caller that coalesced
//! onto the same in-flight request.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for imagefetch operations
///
/// # Examples
///
/// ```
/// use imagefetch::Result;
///
/// fn load() -> Result<Vec<u8>> {
///   Ok(Vec::new())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
///
/// Each variant wraps a more specific error for the subsystem that produced it. Use
/// [`Error::kind`] when only the coarse category matters.
#[derive(Error, Debug, Clone)]
pub enum Error {
  /// The addressed file, resource or remote object does not exist
  #[error("Not found: {0}")]
  NotFound(String),

  /// I/O error (file reading, cache directory access, socket reads)
  #[error("I/O error: {0}")]
  Io(Arc<io::Error>),

  /// Image decoding error
  #[error("Image error: {0}")]
  Image(#[from] ImageError),

  /// HTTP transport or status error
  #[error("Network error: {0}")]
  Network(#[from] NetworkError),

  /// Disk cache error
  #[error("Cache error: {0}")]
  Cache(#[from] CacheError),

  /// Work was submitted to an executor that is shutting down
  #[error("Executor is shut down")]
  ExecutorShutdown,

  /// Generic error for miscellaneous issues
  #[error("{0}")]
  Other(String),
}

impl From<io::Error> for Error {
  fn from(err: io::Error) -> Self {
    Error::Io(Arc::new(err))
  }
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  NotFound,
  Io,
  Decode,
  Closed,
  ConcurrentEdit,
  VersionMismatch,
  Other,
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::NotFound(_) => ErrorKind::NotFound,
      Error::Io(_) => ErrorKind::Io,
      Error::Image(_) => ErrorKind::Decode,
      Error::Network(NetworkError::Status { status: 404 | 410, .. }) => ErrorKind::NotFound,
      Error::Network(NetworkError::Transport { .. }) => ErrorKind::Io,
      Error::Network(_) => ErrorKind::Other,
      Error::Cache(CacheError::Closed) => ErrorKind::Closed,
      Error::Cache(CacheError::ConcurrentEdit { .. }) => ErrorKind::ConcurrentEdit,
      Error::Cache(CacheError::VersionMismatch { .. }) => ErrorKind::VersionMismatch,
      Error::Cache(_) => ErrorKind::Io,
      Error::ExecutorShutdown => ErrorKind::Closed,
      Error::Other(_) => ErrorKind::Other,
    }
  }

  pub fn is_not_found(&self) -> bool {
    self.kind() == ErrorKind::NotFound
  }
}

/// Errors that occur while turning bytes into pixels
///
/// # Examples
///
/// ```
/// use imagefetch::error::ImageError;
///
/// let error = ImageError::DecodeFailed {
///   reason: "unsupported format".to_string(),
/// };
/// assert!(error.to_string().contains("unsupported format"));
/// ```
#[derive(Error, Debug, Clone)]
pub enum ImageError {
  /// The bytes could not be decoded as any supported format
  #[error("Failed to decode image: {reason}")]
  DecodeFailed { reason: String },

  /// The image header could be read but its dimensions exceed configured limits
  #[error("Image {width}x{height} exceeds decode limits: {reason}")]
  TooLarge {
    width: u32,
    height: u32,
    reason: String,
  },

  /// Base64 payload was malformed
  #[error("Invalid base64 payload: {reason}")]
  InvalidBase64 { reason: String },
}

/// Errors from the HTTP layer
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
  /// The URL could not be parsed or uses an unsupported scheme
  #[error("Invalid URL '{url}': {reason}")]
  InvalidUrl { url: String, reason: String },

  /// The server answered with a non-success status
  #[error("HTTP status {status} for '{url}'")]
  Status { url: String, status: u16 },

  /// Connecting, sending or receiving failed
  #[error("Request to '{url}' failed: {reason}")]
  Transport { url: String, reason: String },

  /// The request description itself was malformed (bad method or header)
  #[error("Invalid request: {reason}")]
  InvalidRequest { reason: String },
}

/// Errors from the disk cache
#[derive(Error, Debug, Clone)]
pub enum CacheError {
  /// Operation on a cache that was closed
  #[error("cache is closed")]
  Closed,

  /// Another editor is live for the key
  #[error("entry {key} is already being edited")]
  ConcurrentEdit { key: String },

  /// Commit of an edit that did not write a required slot
  #[error("edit of {key} did not write value {index}")]
  IncompleteEdit { key: String, index: usize },

  /// The editor no longer owns its entry (aborted, or the cache was closed underneath it)
  #[error("editor for {key} is no longer valid")]
  StaleEditor { key: String },

  /// Journal header does not match the expected format/app version/value count
  #[error("journal header mismatch: expected {expected:?}, found {found:?}")]
  VersionMismatch {
    expected: Vec<String>,
    found: Vec<String>,
  },

  /// A journal line could not be parsed
  #[error("corrupt journal line {line}: {reason}")]
  CorruptJournal { line: usize, reason: String },

  /// Slot index outside `0..value_count`
  #[error("value index {index} out of range (value count {value_count})")]
  InvalidIndex { index: usize, value_count: usize },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_errors_convert_and_clone() {
    let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
    let cloned = err.clone();
    assert_eq!(cloned.kind(), ErrorKind::Io);
    assert!(cloned.to_string().contains("denied"));
  }

  #[test]
  fn kinds_follow_taxonomy() {
    let closed: Error = CacheError::Closed.into();
    assert_eq!(closed.kind(), ErrorKind::Closed);

    let busy: Error = CacheError::ConcurrentEdit {
      key: "abc".to_string(),
    }
    .into();
    assert_eq!(busy.kind(), ErrorKind::ConcurrentEdit);

    let missing: Error = NetworkError::Status {
      url: "http://example.com/a.png".to_string(),
      status: 404,
    }
    .into();
    assert!(missing.is_not_found());

    let decode: Error = ImageError::DecodeFailed {
      reason: "bad".to_string(),
    }
    .into();
    assert_eq!(decode.kind(), ErrorKind::Decode);
  }
}
