//! Portal API access: scopes, wire types, transport and the cached client.

mod api_types;
mod cache;
mod cached_client;
mod client;
mod scope;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use cache::{EntityKind, PortalQueryKey};
pub use cached_client::CachedPortalClient;
pub use client::{Download, HttpTransport, Params, Transport};
pub use scope::{Scope, ScopeId};
