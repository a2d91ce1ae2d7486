//! Inbound prefetch endpoint.
//!
//! `GET /prefetch/logement?pkLogement=<id>&complete=<true|false>` warms a cache
//! created for that request alone and reports whether the unit holds data.

use axum::{
  extract::{Query, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::get,
  Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::warmer::{PrefetchMode, PrefetchWarmer};
use crate::portal::ScopeId;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchParams {
  pub pk_logement: Option<String>,
  pub complete: Option<String>,
}

impl PrefetchParams {
  fn mode(&self) -> PrefetchMode {
    PrefetchMode::from_flag(self.complete.as_deref().map(str::trim) == Some("true"))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub error: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /prefetch/logement
pub async fn prefetch_housing_unit(
  State(warmer): State<Arc<PrefetchWarmer>>,
  Query(params): Query<PrefetchParams>,
) -> Response {
  let id = match params.pk_logement.as_deref().and_then(ScopeId::new) {
    Some(id) => id,
    None => {
      let body = ErrorResponse {
        error: "pkLogement parameter is required".to_string(),
        message: None,
      };
      return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }
  };

  match warmer.warm(&id, params.mode()).await {
    Ok(report) => (StatusCode::OK, Json(report)).into_response(),
    Err(e) => {
      warn!(logement = %id, "Prefetch failed: {}", e);
      let body = ErrorResponse {
        error: "Prefetch failed".to_string(),
        message: Some(e.to_string()),
      };
      (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
  }
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router(warmer: PrefetchWarmer) -> Router {
  Router::new()
    .route("/prefetch/logement", get(prefetch_housing_unit))
    .with_state(Arc::new(warmer))
}
