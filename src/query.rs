//! Async query abstraction for data fetching with caching support.
//!
//! Inspired by TanStack Query, this module provides a `Query<T>` type that
//! encapsulates async data fetching, loading states, and error handling. A UI
//! collaborator polls it from its event loop and re-renders when `poll()`
//! reports a change.
//!
//! # Example
//!
//! ```ignore
//! let mut query = portal.anomalies_query(Some(scope), None);
//!
//! // Start fetching (no-op for a disabled query)
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Success(data) => render_data(data),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{broadcast, mpsc};

use crate::cache::{CacheEvent, CacheResult};
use crate::error::{PortalError, PortalResult};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started, or is disabled
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed; rendered inline by the caller
  Error(PortalError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&PortalError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = PortalResult<CacheResult<T>>> + Send>>;

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Reactive binding to one cache slot.
///
/// Query<T> encapsulates:
/// - The fetching logic (via a closure, normally going through the cache)
/// - Loading/success/error states
/// - Async result handling via channels
/// - The staleness deadline of the value it holds
/// - Cache change notifications for its slot
///
/// Failures are never retried.
pub struct Query<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  enabled: bool,
  slot: Option<String>,
  receiver: Option<mpsc::UnboundedReceiver<PortalResult<CacheResult<T>>>>,
  changes: Option<broadcast::Receiver<CacheEvent>>,
  fetched_at: Option<DateTime<Utc>>,
  stale_at: Option<DateTime<Utc>>,
}

impl<T: Send + 'static> Query<T> {
  /// Create an enabled query with the given fetcher function.
  ///
  /// The fetcher is a closure that returns a future. It will be called
  /// each time `fetch()` or `refetch()` starts a fetch.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PortalResult<CacheResult<T>>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move || Box::pin(fetcher())),
      enabled: true,
      slot: None,
      receiver: None,
      changes: None,
      fetched_at: None,
      stale_at: None,
    }
  }

  /// A query whose scope is absent. It stays idle and never fetches.
  pub fn disabled(what: &'static str) -> Self {
    let mut query = Self::new(move || async move { Err(PortalError::scope_missing(what)) });
    query.enabled = false;
    query
  }

  /// Follow cache notifications for `slot`.
  pub fn observing(mut self, slot: String, changes: broadcast::Receiver<CacheEvent>) -> Self {
    self.slot = Some(slot);
    self.changes = Some(changes);
    self
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&PortalError> {
    self.state.error()
  }

  /// When the held value was fetched from the network.
  pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
    self.fetched_at
  }

  /// Check if the held value is past its staleness deadline.
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self.stale_at.map(|t| Utc::now() >= t).unwrap_or(true),
      _ => false,
    }
  }

  /// Start fetching data if enabled and not already loading.
  pub fn fetch(&mut self) {
    if !self.enabled || self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a new fetch, dropping interest in a pending one. The cache still
  /// decides whether this reaches the network.
  pub fn refetch(&mut self) {
    if !self.enabled {
      return;
    }
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch and for cache changes.
  ///
  /// Returns `true` if the state changed.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.poll_result();

    if self.slot_changed() && self.enabled && !self.state.is_loading() {
      self.start_fetch();
      changed = true;
    }

    changed
  }

  fn poll_result(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(result)) => {
        self.fetched_at = Some(result.fetched_at);
        self.stale_at = Some(result.stale_at);
        self.state = QueryState::Success(result.data);
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = QueryState::Error(PortalError::Cache("Query was cancelled".to_string()));
        self.receiver = None;
        true
      }
    }
  }

  /// Drain notifications; true if our slot got a value we don't hold or was invalidated.
  fn slot_changed(&mut self) -> bool {
    let (slot, changes) = match (&self.slot, &mut self.changes) {
      (Some(slot), Some(changes)) => (slot, changes),
      _ => return false,
    };

    let mut changed = false;
    let mut closed = false;
    loop {
      match changes.try_recv() {
        Ok(CacheEvent::Updated { hash, fetched_at }) if &hash == slot => {
          if self.fetched_at != Some(fetched_at) {
            changed = true;
          }
        }
        Ok(CacheEvent::Invalidated { hash }) if &hash == slot => changed = true,
        Ok(_) => {}
        Err(broadcast::error::TryRecvError::Empty) => break,
        Err(broadcast::error::TryRecvError::Lagged(_)) => changed = true,
        Err(broadcast::error::TryRecvError::Closed) => {
          closed = true;
          break;
        }
      }
    }

    if closed {
      self.changes = None;
    }
    changed
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let future = (self.fetcher)();
    tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("enabled", &self.enabled)
      .field("fetched_at", &self.fetched_at)
      .field("stale_at", &self.stale_at)
      .finish_non_exhaustive()
  }
}
