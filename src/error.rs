//! Error taxonomy for the data-access layer.
//!
//! Every error is `Clone` so a single de-duplicated fetch can hand the same
//! failure to all of its waiters.

use serde_json::Value;
use thiserror::Error;

pub type PortalResult<T> = std::result::Result<T, PortalError>;

#[derive(Debug, Clone, Error)]
pub enum PortalError {
  /// A scope id was required but absent. Raised before any network call.
  #[error("{what} scope id is required")]
  ScopeMissing { what: String },

  #[error(transparent)]
  Upstream(#[from] UpstreamError),

  #[error("Failed to decode {what}: {reason}")]
  Decode { what: String, reason: String },

  #[error("Failed to export {what}: {reason}")]
  Export { what: String, reason: String },

  #[error("Cache error: {0}")]
  Cache(String),

  #[error("I/O error: {0}")]
  Io(String),
}

impl PortalError {
  pub fn scope_missing(what: impl Into<String>) -> Self {
    Self::ScopeMissing { what: what.into() }
  }

  /// Wrap any failure into the single aggregated export error.
  pub fn export(what: impl Into<String>, cause: &PortalError) -> Self {
    let reason = match cause {
      PortalError::Export { reason, .. } => reason.clone(),
      other => other.to_string(),
    };
    Self::Export {
      what: what.into(),
      reason,
    }
  }

  pub fn is_scope_missing(&self) -> bool {
    matches!(self, PortalError::ScopeMissing { .. })
  }
}

impl From<std::io::Error> for PortalError {
  fn from(e: std::io::Error) -> Self {
    Self::Io(e.to_string())
  }
}

/// Network or HTTP failure talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
  #[error("Unable to reach the server: {0}")]
  Unreachable(String),

  /// 4xx: the backend rejected the request.
  #[error("Request rejected ({status}): {reason}")]
  Client { status: u16, reason: String },

  /// 5xx (or any other non-success status).
  #[error("Server error ({status}): {reason}")]
  Server { status: u16, reason: String },
}

impl UpstreamError {
  /// Classify a non-success response and derive a readable reason from its body.
  pub fn from_response(status: u16, body: &str) -> Self {
    let reason = reason_from_body(body).unwrap_or_else(|| default_reason(status).to_string());
    if (400..500).contains(&status) {
      Self::Client { status, reason }
    } else {
      Self::Server { status, reason }
    }
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Unreachable(_) => None,
      Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
    }
  }
}

/// The backend answers errors as `{message}` or `{error}`; fall back to the raw text.
fn reason_from_body(body: &str) -> Option<String> {
  let body = body.trim();
  if body.is_empty() {
    return None;
  }

  if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
    for field in ["message", "error", "detail"] {
      if let Some(Value::String(s)) = map.get(field) {
        if !s.trim().is_empty() {
          return Some(s.trim().to_string());
        }
      }
    }
    return None;
  }

  Some(body.chars().take(200).collect())
}

fn default_reason(status: u16) -> &'static str {
  match status {
    400 => "Bad request",
    401 => "Authentication required",
    403 => "Access denied",
    404 => "Not found",
    422 => "Invalid parameters",
    500 => "Internal server error",
    502 => "Bad gateway",
    503 => "Service unavailable",
    504 => "Gateway timeout",
    s if (400..500).contains(&s) => "Request rejected",
    _ => "Upstream failure",
  }
}
