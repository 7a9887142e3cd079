//! Owned request and response values passed between the router, strategies and caches.
//!
//! Responses are full byte snapshots, so cloning one for the cache leaves the
//! caller's copy intact.

use reqwest::Method;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document navigation
  Navigate,
  SameOrigin,
  #[default]
  NoCors,
  Cors,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Header names are stored lowercase
  pub headers: BTreeMap<String, String>,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      mode: RequestMode::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation, which always accepts HTML.
  pub fn navigate(url: Url) -> Self {
    Self::get(url)
      .with_header("accept", "text/html,application/xhtml+xml")
      .with_mode(RequestMode::Navigate)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  /// Whether the Accept header lists HTML. A missing header does not.
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate || self.accepts_html()
  }

  /// Stable identity of this request inside a cache (method + URL, without fragment).
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    let input = format!("{} {}", self.method, url);

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Response tainting, as seen by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
  /// Same-origin response
  #[default]
  Basic,
  /// Cross-origin response
  Cors,
  /// Produced locally, never came off the wire
  Error,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseType::Basic => "basic",
      ResponseType::Cors => "cors",
      ResponseType::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(ResponseType::Basic),
      "cors" => Some(ResponseType::Cors),
      "error" => Some(ResponseType::Error),
      _ => None,
    }
  }
}

/// Where a response handed to the page came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseSource {
  #[default]
  Network,
  Cache,
  /// The offline document substituted for a failed navigation
  OfflineFallback,
  /// Built by the worker (e.g. 503 while offline)
  Synthetic,
}

impl std::fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ResponseSource::Network => write!(f, "network"),
      ResponseSource::Cache => write!(f, "cache"),
      ResponseSource::OfflineFallback => write!(f, "offline-fallback"),
      ResponseSource::Synthetic => write!(f, "synthetic"),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub response_type: ResponseType,
  pub source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    let status_text = reqwest::StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or("")
      .to_string();

    Self {
      status,
      status_text,
      headers: BTreeMap::new(),
      body: body.into(),
      response_type: ResponseType::Basic,
      source: ResponseSource::Network,
    }
  }

  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, body)
  }

  /// The response handed to non-navigation requests that cannot be served offline.
  pub fn service_unavailable() -> Self {
    Self::new(503, "Offline")
      .with_header("content-type", "text/plain")
      .with_type(ResponseType::Error)
      .with_source(ResponseSource::Synthetic)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_type(mut self, response_type: ResponseType) -> Self {
    self.response_type = response_type;
    self
  }

  pub fn with_source(mut self, source: ResponseSource) -> Self {
    self.source = source;
    self
  }

  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}
