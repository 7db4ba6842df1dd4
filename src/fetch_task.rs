//! Origin fetches for each kind of [`Source`].
//!
//! A [`FetchTask`] turns one source into a [`FetchResult`] without touching either cache tier;
//! the coordinator decides when a task runs and what happens to its output. Failures are
//! returned as values, never panics.

use crate::error::{Error, Result};
use crate::image_loader::{BitmapDecoder, DecodedImage, SampledDecoder, TargetBox};
use crate::resource::bundle::{ResourceBundle, ResourceTable};
use crate::resource::data_url::decode_base64_payload;
use crate::resource::{HttpSession, ResourceFetcher, Source};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
  Success,
  Failure,
}

/// The tier that produced an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
  Memory,
  Disk,
  Origin,
}

/// Outcome of one fetch. Cheap to clone; the image is shared.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub status: FetchStatus,
  pub image: Option<Arc<DecodedImage>>,
  pub error: Option<Error>,
  pub tier: Option<Tier>,
}

impl FetchResult {
  pub fn success(image: Arc<DecodedImage>, tier: Tier) -> Self {
    Self {
      status: FetchStatus::Success,
      image: Some(image),
      error: None,
      tier: Some(tier),
    }
  }

  pub fn failure(error: Error) -> Self {
    Self {
      status: FetchStatus::Failure,
      image: None,
      error: Some(error),
      tier: None,
    }
  }

  pub fn is_success(&self) -> bool {
    self.status == FetchStatus::Success
  }

  pub fn into_result(self) -> Result<Arc<DecodedImage>> {
    match (self.image, self.error) {
      (Some(image), _) => Ok(image),
      (None, Some(error)) => Err(error),
      (None, None) => Err(Error::Other("fetch produced no image".to_string())),
    }
  }

  fn from_decode(result: Result<DecodedImage>) -> Self {
    match result {
      Ok(image) => Self::success(Arc::new(image), Tier::Origin),
      Err(err) => Self::failure(err),
    }
  }
}

/// One origin fetch, run on a worker.
pub trait FetchTask: Send {
  fn run(&self, target: TargetBox) -> FetchResult;
}

/// GET over the shared HTTP session; the whole body is buffered before decoding.
pub struct NetworkFetch {
  url: String,
  fetcher: Arc<dyn ResourceFetcher>,
  decoder: Arc<dyn BitmapDecoder>,
}

impl NetworkFetch {
  pub fn new(
    url: impl Into<String>,
    fetcher: Arc<dyn ResourceFetcher>,
    decoder: Arc<dyn BitmapDecoder>,
  ) -> Self {
    Self {
      url: url.into(),
      fetcher,
      decoder,
    }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Raw response body, for callers that persist the encoded bytes.
  pub fn download(&self) -> Result<Vec<u8>> {
    let resource = self.fetcher.fetch(&self.url)?;
    Ok(resource.bytes)
  }
}

impl FetchTask for NetworkFetch {
  fn run(&self, target: TargetBox) -> FetchResult {
    match self.download() {
      Ok(bytes) => FetchResult::from_decode(self.decoder.decode(&bytes, target)),
      Err(err) => FetchResult::failure(err),
    }
  }
}

/// Decodes a local file.
pub struct FileFetch {
  path: PathBuf,
  decoder: Arc<dyn BitmapDecoder>,
}

impl FileFetch {
  pub fn new(path: impl Into<PathBuf>, decoder: Arc<dyn BitmapDecoder>) -> Self {
    Self {
      path: path.into(),
      decoder,
    }
  }
}

impl FetchTask for FileFetch {
  fn run(&self, target: TargetBox) -> FetchResult {
    match self.decoder.decode_file(&self.path, target) {
      Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
        FetchResult::failure(Error::NotFound(self.path.display().to_string()))
      }
      other => FetchResult::from_decode(other),
    }
  }
}

/// Decodes a named resource from the application's resource table.
pub struct ResourceFetch {
  name: String,
  resources: Arc<dyn ResourceTable>,
  decoder: Arc<dyn BitmapDecoder>,
}

impl ResourceFetch {
  pub fn new(
    name: impl Into<String>,
    resources: Arc<dyn ResourceTable>,
    decoder: Arc<dyn BitmapDecoder>,
  ) -> Self {
    Self {
      name: name.into(),
      resources,
      decoder,
    }
  }
}

impl FetchTask for ResourceFetch {
  fn run(&self, target: TargetBox) -> FetchResult {
    match self.resources.open(&self.name) {
      Ok(Some(bytes)) => FetchResult::from_decode(self.decoder.decode(&bytes, target)),
      Ok(None) => FetchResult::failure(Error::NotFound(format!("resource:{}", self.name))),
      Err(err) => FetchResult::failure(err),
    }
  }
}

/// Decodes an inline base64 payload.
pub struct Base64Fetch {
  payload: String,
  decoder: Arc<dyn BitmapDecoder>,
}

impl Base64Fetch {
  pub fn new(payload: impl Into<String>, decoder: Arc<dyn BitmapDecoder>) -> Self {
    Self {
      payload: payload.into(),
      decoder,
    }
  }
}

impl FetchTask for Base64Fetch {
  fn run(&self, target: TargetBox) -> FetchResult {
    match decode_base64_payload(&self.payload) {
      Ok(bytes) => FetchResult::from_decode(self.decoder.decode(&bytes, target)),
      Err(err) => FetchResult::failure(err),
    }
  }
}

/// Collaborators shared by every task: the HTTP session, the network fetcher (normally the
/// session itself), the bitmap decoder and the resource table.
#[derive(Clone)]
pub struct FetchEnv {
  pub session: HttpSession,
  pub fetcher: Arc<dyn ResourceFetcher>,
  pub decoder: Arc<dyn BitmapDecoder>,
  pub resources: Arc<dyn ResourceTable>,
}

impl Default for FetchEnv {
  fn default() -> Self {
    Self::new(HttpSession::default(), Arc::new(SampledDecoder::default()))
  }
}

impl FetchEnv {
  pub fn new(session: HttpSession, decoder: Arc<dyn BitmapDecoder>) -> Self {
    Self {
      fetcher: Arc::new(session.clone()),
      session,
      decoder,
      resources: Arc::new(ResourceBundle::empty()),
    }
  }

  pub fn with_fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
    self.fetcher = fetcher;
    self
  }

  pub fn with_decoder(mut self, decoder: Arc<dyn BitmapDecoder>) -> Self {
    self.decoder = decoder;
    self
  }

  pub fn with_resources(mut self, resources: Arc<dyn ResourceTable>) -> Self {
    self.resources = resources;
    self
  }

  pub fn network(&self, url: &str) -> NetworkFetch {
    NetworkFetch::new(url, Arc::clone(&self.fetcher), Arc::clone(&self.decoder))
  }

  /// The task that fetches `source` from its origin.
  pub fn task_for(&self, source: &Source) -> Box<dyn FetchTask> {
    let decoder = Arc::clone(&self.decoder);
    match source {
      Source::Network(url) => Box::new(self.network(url)),
      Source::File(path) => Box::new(FileFetch::new(path.clone(), decoder)),
      Source::Resource(name) => Box::new(ResourceFetch::new(
        name.clone(),
        Arc::clone(&self.resources),
        decoder,
      )),
      Source::Base64(payload) => Box::new(Base64Fetch::new(payload.clone(), decoder)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ErrorKind, NetworkError};
  use crate::image_loader::test_support::png_bytes;
  use crate::resource::FetchedResource;
  use base64::Engine;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct StaticFetcher {
    response: Result<Vec<u8>>,
    calls: AtomicUsize,
  }

  impl ResourceFetcher for StaticFetcher {
    fn fetch(&self, _url: &str) -> Result<FetchedResource> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self
        .response
        .clone()
        .map(|bytes| FetchedResource::new(bytes, Some("image/png".to_string())))
    }
  }

  fn env_with(response: Result<Vec<u8>>) -> FetchEnv {
    FetchEnv::default().with_fetcher(Arc::new(StaticFetcher {
      response,
      calls: AtomicUsize::new(0),
    }))
  }

  #[test]
  fn network_fetch_decodes_downloaded_bytes() {
    let env = env_with(Ok(png_bytes(40, 40)));
    let task = env.network("http://example.invalid/a.png");
    assert_eq!(task.download().unwrap(), png_bytes(40, 40));
    let result = task.run(TargetBox::new(10, 10));
    assert!(result.is_success());
    assert_eq!(result.tier, Some(Tier::Origin));
    assert_eq!(result.into_result().unwrap().sample_factor(), 2);
  }

  #[test]
  fn network_errors_are_values() {
    let env = env_with(Err(Error::Network(NetworkError::Status {
      url: "http://example.invalid/".to_string(),
      status: 500,
    })));
    let result = env
      .task_for(&Source::parse("http://example.invalid/"))
      .run(TargetBox::UNBOUNDED);
    assert!(!result.is_success());
    assert!(result.image.is_none());
    assert!(matches!(
      result.error,
      Some(Error::Network(NetworkError::Status { status: 500, .. }))
    ));

    let env = env_with(Ok(b"<html></html>".to_vec()));
    let result = env.network("http://example.invalid/").run(TargetBox::UNBOUNDED);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::Decode);
  }

  #[test]
  fn file_fetch_maps_missing_files_to_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let env = FetchEnv::default();
    let missing = Source::File(dir.path().join("nope.png"));
    let result = env.task_for(&missing).run(TargetBox::UNBOUNDED);
    assert!(result.error.unwrap().is_not_found());

    let path = dir.path().join("ok.png");
    std::fs::write(&path, png_bytes(16, 16)).unwrap();
    let result = env.task_for(&Source::File(path)).run(TargetBox::UNBOUNDED);
    assert_eq!(result.into_result().unwrap().width(), 16);
  }

  #[test]
  fn resource_fetch_uses_the_table() {
    let bundle = ResourceBundle::empty().with_resource("logo", png_bytes(8, 8));
    let env = FetchEnv::default().with_resources(Arc::new(bundle));
    let result = env
      .task_for(&Source::parse("resource:logo"))
      .run(TargetBox::UNBOUNDED);
    assert!(result.is_success());
    let result = env
      .task_for(&Source::parse("res://missing"))
      .run(TargetBox::UNBOUNDED);
    assert!(result.error.unwrap().is_not_found());
  }

  #[test]
  fn base64_fetch_accepts_data_urls_with_whitespace() {
    let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes(6, 6));
    let wrapped = encoded
      .as_bytes()
      .chunks(20)
      .map(|c| std::str::from_utf8(c).unwrap())
      .collect::<Vec<_>>()
      .join("\n");
    let env = FetchEnv::default();
    let result = env
      .task_for(&Source::base64(format!("data:image/png;base64,{wrapped}")))
      .run(TargetBox::UNBOUNDED);
    assert_eq!(result.into_result().unwrap().height(), 6);

    let result = env
      .task_for(&Source::base64("!!!not base64"))
      .run(TargetBox::UNBOUNDED);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::Decode);
  }
}
