use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::api_types::ApiEnvelope;
use crate::config::Config;
use crate::error::{PortalError, PortalResult, UpstreamError};

/// Query string pairs for a request.
pub type Params = [(&'static str, String)];

/// Raw body of a binary download.
#[derive(Debug, Clone)]
pub struct Download {
  pub bytes: Vec<u8>,
  pub content_type: Option<String>,
}

/// Outbound access to the portal API.
///
/// Implementations attach caller identity to every request. Nothing here
/// caches or retries.
#[async_trait]
pub trait Transport: Send + Sync {
  /// GET a JSON endpoint and return the `data` member of its envelope.
  async fn get_json(&self, path: &str, params: &Params) -> PortalResult<Value>;

  /// GET a binary endpoint (CSV, PDF).
  async fn get_bytes(&self, path: &str, params: &Params) -> PortalResult<Download>;
}

/// Portal API client over HTTP
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(config: &Config) -> color_eyre::Result<Self> {
    let base_url = parse_base_url(&config.api.url)?;
    let token = Config::get_api_token();
    if token.is_none() {
      warn!("RELEVE_API_TOKEN is not set, requests will be anonymous");
    }

    let client = reqwest::Client::builder()
      .user_agent(concat!("releve/", env!("CARGO_PKG_VERSION")))
      .build()?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn endpoint(&self, path: &str) -> PortalResult<Url> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| PortalError::Upstream(UpstreamError::Unreachable(format!("bad url {}: {}", path, e))))
  }

  async fn send(&self, path: &str, params: &Params, accept: &'static str) -> PortalResult<reqwest::Response> {
    let url = self.endpoint(path)?;
    debug!(%url, "GET");

    let mut request = self
      .client
      .get(url)
      .header(ACCEPT, HeaderValue::from_static(accept))
      .query(params);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let err = UpstreamError::from_response(status.as_u16(), &body);
    warn!(path, status = status.as_u16(), "{}", err);
    Err(err.into())
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn get_json(&self, path: &str, params: &Params) -> PortalResult<Value> {
    let response = self.send(path, params, "application/json").await?;
    let bytes = response
      .bytes()
      .await
      .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
    unwrap_envelope(path, &bytes)
  }

  async fn get_bytes(&self, path: &str, params: &Params) -> PortalResult<Download> {
    let response = self
      .send(path, params, "text/csv, application/pdf, application/octet-stream")
      .await?;
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let bytes = response
      .bytes()
      .await
      .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

    Ok(Download {
      bytes: bytes.to_vec(),
      content_type,
    })
  }
}

/// Base URLs are joined against, so they must end with a slash.
fn parse_base_url(raw: &str) -> color_eyre::Result<Url> {
  let mut url = Url::parse(raw.trim())?;
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

/// Extract `data` from a `{ "data": ... }` body.
pub fn unwrap_envelope(path: &str, body: &[u8]) -> PortalResult<Value> {
  serde_json::from_slice::<ApiEnvelope<Value>>(body)
    .map(|envelope| envelope.data)
    .map_err(|e| PortalError::Decode {
      what: path.to_string(),
      reason: e.to_string(),
    })
}
