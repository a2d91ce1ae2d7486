//! In-memory `Transport` for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::client::{Download, Params, Transport};
use crate::error::{PortalError, PortalResult, UpstreamError};

#[derive(Default)]
pub struct FakeTransport {
  json: HashMap<String, PortalResult<Value>>,
  bytes: HashMap<String, PortalResult<Download>>,
  delay: Duration,
  calls: AtomicUsize,
  requests: Mutex<Vec<String>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer `path` with `data` (the envelope's `data` member).
  pub fn with_json(mut self, path: &str, data: Value) -> Self {
    self.json.insert(path.to_string(), Ok(data));
    self
  }

  pub fn with_bytes(mut self, path: &str, bytes: &[u8], content_type: &str) -> Self {
    self.bytes.insert(
      path.to_string(),
      Ok(Download {
        bytes: bytes.to_vec(),
        content_type: Some(content_type.to_string()),
      }),
    );
    self
  }

  pub fn with_error(mut self, path: &str, err: UpstreamError) -> Self {
    self.json.insert(path.to_string(), Err(err.clone().into()));
    self.bytes.insert(path.to_string(), Err(err.into()));
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  /// Every request seen, as `path?k=v&...`.
  pub fn requests(&self) -> Vec<String> {
    self.requests.lock().unwrap().clone()
  }

  fn record(&self, path: &str, params: &Params) {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    let line = if query.is_empty() {
      path.to_string()
    } else {
      format!("{}?{}", path, query.join("&"))
    };
    self.requests.lock().unwrap().push(line);
  }

  fn not_found(path: &str) -> PortalError {
    UpstreamError::Client {
      status: 404,
      reason: format!("no route {}", path),
    }
    .into()
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn get_json(&self, path: &str, params: &Params) -> PortalResult<Value> {
    self.record(path, params);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self
      .json
      .get(path)
      .cloned()
      .unwrap_or_else(|| Err(Self::not_found(path)))
  }

  async fn get_bytes(&self, path: &str, params: &Params) -> PortalResult<Download> {
    self.record(path, params);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self
      .bytes
      .get(path)
      .cloned()
      .unwrap_or_else(|| Err(Self::not_found(path)))
  }
}
