//! In-memory query cache with nightly-refresh aware staleness.
//!
//! This module provides an API-agnostic cache service that:
//! - Stores fetched values keyed by a structural query key
//! - Trusts an entry until its staleness deadline, then refetches
//! - Collapses concurrent fetches of one key into a single request
//! - Notifies subscribers when an entry changes or is invalidated
//!
//! A `CacheLayer` has an explicit lifetime: one per interactive session, one
//! per inbound prefetch request.

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::CacheEntry;
pub use traits::{CacheEvent, CacheResult, CacheSource, QueryKey};
