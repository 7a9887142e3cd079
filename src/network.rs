//! Network access used by the strategies and the installer.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::http::{Request, Response, ResponseSource, ResponseType};

/// Anything that can turn a request into a response over the network.
///
/// An `Err` means the request never produced a response (offline, DNS,
/// connection reset, aborted). HTTP error statuses are `Ok`.
pub trait Fetch: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

impl<T: Fetch> Fetch for Arc<T> {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.as_ref().fetch(request).await
  }
}

/// Fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.network.timeout_secs))
      .user_agent(concat!("osp-worker/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin.clone(),
    })
  }
}

impl Fetch for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let response_type = if response.url().origin() == self.origin.origin() {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    };

    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      headers,
      body: body.to_vec(),
      response_type,
      source: ResponseSource::Network,
    })
  }
}
