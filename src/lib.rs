//! Client for the metering portal API.
//!
//! Reads go through a query cache whose entries stay fresh until shortly
//! before local midnight, matching the backend's nightly recompute. Exports
//! bypass the cache. A small HTTP endpoint warms a cache ahead of first render.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod logging;
pub mod portal;
pub mod prefetch;
pub mod query;
pub mod session;
pub mod stale_time;
