use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::CacheLayer;
use crate::error::PortalResult;
use crate::portal::{CachedPortalClient, PortalQueryKey, ScopeId, Transport};

/// How much to load ahead of first render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchMode {
  /// The housing unit only
  Shallow,
  /// The housing unit and its building
  Complete,
}

impl PrefetchMode {
  pub fn from_flag(complete: bool) -> Self {
    if complete {
      Self::Complete
    } else {
      Self::Shallow
    }
  }
}

/// Outcome of one warm-up, as returned to the caller of the boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchReport {
  pub success: bool,
  pub pk_logement: String,
  pub has_data: bool,
  pub message: String,
}

/// Fills a cache with the data a housing-unit view needs.
#[derive(Clone)]
pub struct PrefetchWarmer {
  transport: Arc<dyn Transport>,
  stale_buffer_minutes: i64,
}

impl PrefetchWarmer {
  pub fn new(transport: Arc<dyn Transport>, stale_buffer_minutes: i64) -> Self {
    Self {
      transport,
      stale_buffer_minutes,
    }
  }

  /// A client over a brand new cache. Call once per inbound request.
  pub fn request_client(&self) -> CachedPortalClient {
    CachedPortalClient::new(
      Arc::clone(&self.transport),
      CacheLayer::new(),
      self.stale_buffer_minutes,
    )
  }

  /// Warm housing unit `id` into a fresh request-scoped cache.
  pub async fn warm(&self, id: &ScopeId, mode: PrefetchMode) -> PortalResult<PrefetchReport> {
    warm_housing_unit(&self.request_client(), id, mode).await
  }
}

/// Populate `client`'s cache for housing unit `id`.
///
/// Entries that are already fresh are left alone, so calling this twice on
/// the same client costs one round of requests.
pub async fn warm_housing_unit(
  client: &CachedPortalClient,
  id: &ScopeId,
  mode: PrefetchMode,
) -> PortalResult<PrefetchReport> {
  let unit = client.housing_unit(id).await?;

  let related = match (mode, unit.building_id.as_deref().and_then(ScopeId::new)) {
    (PrefetchMode::Complete, Some(building)) => {
      client.building(&building).await?;
      Some(building)
    }
    (PrefetchMode::Complete, None) => {
      debug!(logement = %id, "Housing unit has no building to prefetch");
      None
    }
    (PrefetchMode::Shallow, _) => None,
  };

  let has_data = client
    .cache()
    .has_data(&PortalQueryKey::housing_unit(id.clone()))?;

  let message = match related {
    Some(building) => format!("Prefetched logement {} and immeuble {}", id, building),
    None => format!("Prefetched logement {}", id),
  };
  info!(logement = %id, ?mode, has_data, "{}", message);

  Ok(PrefetchReport {
    success: true,
    pk_logement: id.to_string(),
    has_data,
    message,
  })
}
