//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};

/// Identity of a cached query.
///
/// Two keys that compare equal must produce the same `cache_hash`, so they
/// resolve to the same cache slot.
pub trait QueryKey {
  /// Stable, fixed-length slot id.
  fn cache_hash(&self) -> String;

  /// Human-readable description for logs.
  fn description(&self) -> String;

  /// Labels used for bulk invalidation.
  fn tags(&self) -> Vec<String> {
    Vec::new()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the value was fetched from the network
  pub fetched_at: DateTime<Utc>,
  /// When the value stops being trusted
  pub stale_at: DateTime<Utc>,
}

impl<T> CacheResult<T> {
  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      fetched_at: self.fetched_at,
      stale_at: self.stale_at,
    }
  }

  pub fn is_stale(&self) -> bool {
    Utc::now() >= self.stale_at
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// This call issued the network request
  Network,
  /// Joined a request already in flight for the same key
  Shared,
  /// Served from an unexpired entry
  Cache,
}

/// Change notification for cache observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// A fresh value was stored for the slot
  Updated {
    hash: String,
    fetched_at: DateTime<Utc>,
  },
  /// The slot was dropped by an external trigger
  Invalidated { hash: String },
}

impl CacheEvent {
  pub fn hash(&self) -> &str {
    match self {
      Self::Updated { hash, .. } | Self::Invalidated { hash } => hash,
    }
  }
}
