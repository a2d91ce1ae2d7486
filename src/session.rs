//! Session identity persisted between runs.
//!
//! Login writes a blob shaped `{"state":{"user":{"FK":...}}}`; logout removes
//! it. A `SessionResolver` reads the blob once and exposes the caller's
//! occupant id. Missing or malformed blobs resolve to `None` without error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::error::PortalResult;
use crate::portal::{Scope, ScopeId};

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
  state: PersistedState,
  #[serde(default)]
  version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
  user: Option<PersistedUser>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedUser {
  #[serde(rename = "FK")]
  fk: Value,
}

/// Parse a persisted blob. Anything unexpected yields `None`.
pub fn parse_scope_id(raw: &str) -> Option<ScopeId> {
  let session: PersistedSession = match serde_json::from_str(raw) {
    Ok(s) => s,
    Err(e) => {
      debug!("Ignoring malformed session blob: {}", e);
      return None;
    }
  };

  match session.state.user?.fk {
    Value::String(s) => ScopeId::new(s),
    Value::Number(n) => ScopeId::new(n.to_string()),
    other => {
      debug!("Ignoring session FK of unexpected type: {}", other);
      None
    }
  }
}

/// Resolves the session scope id once and keeps it for the session's lifetime.
pub struct SessionResolver {
  path: PathBuf,
  resolved: OnceLock<Option<ScopeId>>,
}

impl SessionResolver {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      resolved: OnceLock::new(),
    }
  }

  /// The scope id, or `None` until hydrated or when there is no usable session.
  pub fn scope_id(&self) -> Option<ScopeId> {
    self.resolved.get().cloned().flatten()
  }

  /// Occupant scope for occupant-scoped queries.
  pub fn occupant_scope(&self) -> Option<Scope> {
    self.scope_id().map(Scope::Occupant)
  }

  pub fn is_resolved(&self) -> bool {
    self.resolved.get().is_some()
  }

  /// Read the persisted blob. Only the first call reads; later calls return
  /// the same answer.
  pub async fn hydrate(&self) -> Option<ScopeId> {
    if let Some(resolved) = self.resolved.get() {
      return resolved.clone();
    }

    let scope = match tokio::fs::read_to_string(&self.path).await {
      Ok(raw) => parse_scope_id(&raw),
      Err(e) => {
        debug!(path = %self.path.display(), "No session blob: {}", e);
        None
      }
    };

    // A concurrent hydrate may have won; keep whichever landed first
    let _ = self.resolved.set(scope);
    self.scope_id()
  }
}

/// Writes and clears the persisted session.
#[derive(Debug, Clone)]
pub struct SessionStore {
  path: PathBuf,
}

impl SessionStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Persist the logged-in user's id.
  pub fn login(&self, user_fk: &ScopeId) -> PortalResult<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let blob = PersistedSession {
      state: PersistedState {
        user: Some(PersistedUser {
          fk: Value::String(user_fk.to_string()),
        }),
      },
      version: 0,
    };
    let data = serde_json::to_vec(&blob).map_err(|e| crate::error::PortalError::Io(e.to_string()))?;
    std::fs::write(&self.path, data)?;

    info!(path = %self.path.display(), "Session persisted");
    Ok(())
  }

  /// Remove the persisted session. Missing files are fine.
  pub fn logout(&self) -> PortalResult<()> {
    match std::fs::remove_file(&self.path) {
      Ok(()) => {
        info!(path = %self.path.display(), "Session cleared");
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  /// A fresh resolver for the persisted session.
  pub fn resolver(&self) -> SessionResolver {
    SessionResolver::new(&self.path)
  }
}
