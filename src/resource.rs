//! Resource addressing and fetching
//!
//! A [`Source`] says where an image's bytes come from: the network, a local file, a named
//! resource bundled with the application, or an inline base64 payload. Network access goes
//! through one [`HttpSession`] (agent and cookie jar) constructed at startup and shared by
//! reference.

pub mod bundle;
pub mod cache_key;
pub mod data_url;
pub mod disk_cache;
mod disk_cache_journal;

pub use bundle::{ResourceBundle, ResourceTable};
pub use cache_key::CacheKey;
pub use disk_cache::{DiskCache, DiskCacheConfig, EditState, Editor, EntryInfo, Snapshot};

use crate::error::{Error, NetworkError, Result};
use crate::image_loader::{sniff_image_format, BitmapDecoder, DecodedImage, TargetBox};
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default User-Agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = concat!("imagefetch/", env!("CARGO_PKG_VERSION"));

/// Default Accept-Language header value.
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

const RESOURCE_PREFIXES: &[&str] = &["res://", "resource:"];
const FILE_PREFIX: &str = "file:";

/// Where a resource's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
  Network(String),
  File(PathBuf),
  Resource(String),
  Base64(String),
}

impl Source {
  /// Classifies an address by prefix: `resource:`/`res://` names a bundled resource, `file:`
  /// a local path, anything else is treated as a network URL.
  pub fn parse(address: &str) -> Self {
    let trimmed = address.trim();
    for prefix in RESOURCE_PREFIXES {
      if let Some(name) = strip_prefix_ignore_case(trimmed, prefix) {
        return Source::Resource(name.trim_start_matches('/').to_string());
      }
    }
    if let Some(rest) = strip_prefix_ignore_case(trimmed, FILE_PREFIX) {
      // `file:///tmp/a.png`, `file:/tmp/a.png` and `file://relative.png` all name a path.
      let path = rest.strip_prefix("//").unwrap_or(rest);
      return Source::File(PathBuf::from(path));
    }
    Source::Network(trimmed.to_string())
  }

  /// An inline base64 payload (optionally a `data:` URL).
  pub fn base64(payload: impl Into<String>) -> Self {
    Source::Base64(payload.into())
  }

  /// Stable string the cache key is derived from.
  pub fn logical_address(&self) -> Cow<'_, str> {
    match self {
      Source::Network(url) => Cow::Borrowed(url),
      Source::File(path) => Cow::Owned(format!("file://{}", path.display())),
      Source::Resource(name) => Cow::Owned(format!("resource:{name}")),
      Source::Base64(payload) => Cow::Owned(format!("base64:{payload}")),
    }
  }

  pub fn cache_key(&self) -> CacheKey {
    CacheKey::for_source(&self.logical_address())
  }

  /// Only network bytes are written to the disk tier.
  pub fn is_network(&self) -> bool {
    matches!(self, Source::Network(_))
  }
}

impl fmt::Display for Source {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Source::Base64(payload) => write!(f, "base64:<{} chars>", payload.len()),
      other => f.write_str(&other.logical_address()),
    }
  }
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
  let head = input.get(..prefix.len())?;
  head
    .eq_ignore_ascii_case(prefix)
    .then(|| &input[prefix.len()..])
}

/// Bytes fetched from an origin.
#[derive(Debug, Clone)]
pub struct FetchedResource {
  /// Raw bytes of the resource
  pub bytes: Vec<u8>,
  /// Content-Type header value, if available
  pub content_type: Option<String>,
  /// HTTP status, for network resources
  pub status: Option<u16>,
}

impl FetchedResource {
  pub fn new(bytes: Vec<u8>, content_type: Option<String>) -> Self {
    Self {
      bytes,
      content_type,
      status: None,
    }
  }

  /// Check if this resource appears to be an image based on content-type
  pub fn is_image(&self) -> bool {
    self
      .content_type
      .as_ref()
      .map(|ct| ct.starts_with("image/"))
      .unwrap_or(false)
  }
}

/// Fetches network resources by URL.
///
/// [`HttpSession`] is the production implementation; tests substitute their own.
pub trait ResourceFetcher: Send + Sync {
  fn fetch(&self, url: &str) -> Result<FetchedResource>;
}

impl<T: ResourceFetcher + ?Sized> ResourceFetcher for Arc<T> {
  fn fetch(&self, url: &str) -> Result<FetchedResource> {
    (**self).fetch(url)
  }
}

/// HTTP client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
  /// Connect timeout applied to every request unless the request carries its own.
  pub connect_timeout: Option<Duration>,
  /// Overall per-request timeout.
  pub timeout: Option<Duration>,
  pub user_agent: String,
  pub accept_language: String,
  /// Cap on buffered response bodies. `None` reads bodies of any size into memory.
  pub max_response_bytes: Option<u64>,
  pub max_redirects: u32,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      connect_timeout: Some(Duration::from_secs(15)),
      timeout: Some(Duration::from_secs(60)),
      user_agent: DEFAULT_USER_AGENT.to_string(),
      accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
      max_response_bytes: None,
      max_redirects: 10,
    }
  }
}

impl HttpConfig {
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = Some(timeout);
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = user_agent.into();
    self
  }

  pub fn with_max_response_bytes(mut self, limit: u64) -> Self {
    self.max_response_bytes = Some(limit);
    self
  }
}

/// One request of the generic (uncached) request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
  /// Case-insensitive; empty means GET.
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  /// Sent for methods that carry a body; DELETE, GET and HEAD never send one.
  pub body: Option<String>,
  /// Connect timeout override.
  pub timeout: Option<Duration>,
  /// Image-shaped responses are decoded to fit this box.
  pub target: TargetBox,
}

impl HttpRequest {
  pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      method: method.into(),
      url: url.into(),
      headers: Vec::new(),
      body: None,
      timeout: None,
      target: TargetBox::UNBOUNDED,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_target(mut self, target: TargetBox) -> Self {
    self.target = target;
    self
  }

  fn method(&self) -> Result<http::Method> {
    let normalized = self.method.trim().to_ascii_uppercase();
    if normalized.is_empty() {
      return Ok(http::Method::GET);
    }
    http::Method::from_bytes(normalized.as_bytes()).map_err(|e| {
      Error::Network(NetworkError::InvalidRequest {
        reason: format!("method {:?}: {e}", self.method),
      })
    })
  }
}

/// Interpreted response body.
#[derive(Debug, Clone)]
pub enum ResponseContent {
  /// HEAD requests, and bodies with no bytes
  Empty,
  Image(Arc<DecodedImage>),
  Text(String),
}

/// Response of the generic request path. Error statuses are responses, not errors.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub content: ResponseContent,
}

impl HttpResponse {
  /// First header value named `name` (case-insensitive).
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> Option<&str> {
    match &self.content {
      ResponseContent::Text(text) => Some(text),
      _ => None,
    }
  }

  pub fn image(&self) -> Option<&Arc<DecodedImage>> {
    match &self.content {
      ResponseContent::Image(image) => Some(image),
      _ => None,
    }
  }
}

/// Shared HTTP agent with a cookie jar.
///
/// Clones share the underlying connection pool and cookies.
#[derive(Clone)]
pub struct HttpSession {
  agent: ureq::Agent,
  config: HttpConfig,
}

impl fmt::Debug for HttpSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HttpSession")
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

impl Default for HttpSession {
  fn default() -> Self {
    Self::new(HttpConfig::default())
  }
}

impl HttpSession {
  pub fn new(config: HttpConfig) -> Self {
    let agent_config = ureq::Agent::config_builder()
      .http_status_as_error(false)
      .timeout_global(config.timeout)
      .timeout_connect(config.connect_timeout)
      .max_redirects(config.max_redirects)
      .build();
    let agent: ureq::Agent = agent_config.into();
    Self { agent, config }
  }

  pub fn config(&self) -> &HttpConfig {
    &self.config
  }

  /// GETs `url` and returns its body; non-2xx statuses are errors (404/410 as
  /// [`Error::NotFound`]).
  pub fn get(&self, url: &str) -> Result<FetchedResource> {
    let parsed = Url::parse(url).map_err(|e| {
      Error::Network(NetworkError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
      })
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
      return Err(Error::Network(NetworkError::InvalidUrl {
        url: url.to_string(),
        reason: format!("unsupported scheme {:?}", parsed.scheme()),
      }));
    }

    let response = self.execute(&HttpRequest::get(url))?;
    match response.status {
      200..=299 => {}
      404 | 410 => return Err(Error::NotFound(url.to_string())),
      status => {
        return Err(Error::Network(NetworkError::Status {
          url: url.to_string(),
          status,
        }))
      }
    }
    if response.body.is_empty() {
      return Err(Error::Io(Arc::new(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Empty HTTP response body",
      ))));
    }
    let content_type = response.header("content-type").map(str::to_string);
    Ok(FetchedResource {
      bytes: response.body,
      content_type,
      status: Some(response.status),
    })
  }

  /// Runs `request` and reads the raw body without interpreting it.
  pub fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let method = request.method()?;
    let mut builder = http::Request::builder()
      .method(method.clone())
      .uri(request.url.as_str());
    let mut has_user_agent = false;
    let mut has_accept_language = false;
    for (name, value) in &request.headers {
      has_user_agent |= name.eq_ignore_ascii_case("user-agent");
      has_accept_language |= name.eq_ignore_ascii_case("accept-language");
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !has_user_agent {
      builder = builder.header("User-Agent", self.config.user_agent.as_str());
    }
    if !has_accept_language {
      builder = builder.header("Accept-Language", self.config.accept_language.as_str());
    }

    let sends_body = !matches!(
      method,
      http::Method::DELETE | http::Method::GET | http::Method::HEAD
    );
    let mut response = match request.body.as_ref().filter(|_| sends_body) {
      Some(body) => {
        let req = builder
          .body(body.clone().into_bytes())
          .map_err(|e| invalid_request(&e))?;
        self.run(req, request.timeout)?
      }
      None => {
        let req = builder.body(()).map_err(|e| invalid_request(&e))?;
        self.run(req, request.timeout)?
      }
    };

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = if method == http::Method::HEAD {
      Vec::new()
    } else {
      response
        .body_mut()
        .with_config()
        .limit(self.config.max_response_bytes.unwrap_or(u64::MAX))
        .read_to_vec()
        .map_err(|e| transport_error(&request.url, &e))?
    };

    Ok(HttpResponse {
      status,
      headers,
      body,
      content: ResponseContent::Empty,
    })
  }

  /// Runs `request` and interprets the body: image-shaped bytes are decoded to fit
  /// `request.target`, anything else becomes text.
  pub fn request(&self, request: &HttpRequest, decoder: &dyn BitmapDecoder) -> Result<HttpResponse> {
    let mut response = self.execute(request)?;
    response.content = if response.body.is_empty() {
      ResponseContent::Empty
    } else if sniff_image_format(&response.body).is_some() {
      match decoder.decode(&response.body, request.target) {
        Ok(image) => ResponseContent::Image(Arc::new(image)),
        Err(err) => {
          tracing::debug!(url = %request.url, error = %err, "image-shaped response failed to decode");
          ResponseContent::Text(String::from_utf8_lossy(&response.body).into_owned())
        }
      }
    } else {
      ResponseContent::Text(String::from_utf8_lossy(&response.body).into_owned())
    };
    Ok(response)
  }

  fn run<B: ureq::AsSendBody>(
    &self,
    request: http::Request<B>,
    connect_timeout: Option<Duration>,
  ) -> Result<http::Response<ureq::Body>> {
    let url = request.uri().to_string();
    let request = match connect_timeout {
      Some(timeout) => self
        .agent
        .configure_request(request)
        .timeout_connect(Some(timeout))
        .build(),
      None => request,
    };
    self
      .agent
      .run(request)
      .map_err(|e| transport_error(&url, &e))
  }
}

impl ResourceFetcher for HttpSession {
  fn fetch(&self, url: &str) -> Result<FetchedResource> {
    self.get(url)
  }
}

fn invalid_request(err: &http::Error) -> Error {
  Error::Network(NetworkError::InvalidRequest {
    reason: err.to_string(),
  })
}

fn transport_error(url: &str, err: &ureq::Error) -> Error {
  Error::Network(NetworkError::Transport {
    url: url.to_string(),
    reason: err.to_string(),
  })
}
