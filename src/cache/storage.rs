//! In-memory entry storage with change notifications.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

use super::traits::CacheEvent;
use crate::error::{PortalError, PortalResult};

const EVENT_CAPACITY: usize = 64;

/// A single cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  /// The value in canonical JSON form
  pub value: Value,
  pub fetched_at: DateTime<Utc>,
  /// Never before `fetched_at`, never more than a day after it
  pub stale_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(value: Value, fetched_at: DateTime<Utc>, stale_time: std::time::Duration) -> Self {
    let ttl = chrono::Duration::from_std(stale_time)
      .unwrap_or_else(|_| chrono::Duration::zero())
      .clamp(chrono::Duration::zero(), chrono::Duration::hours(24));
    Self {
      value,
      fetched_at,
      stale_at: fetched_at + ttl,
    }
  }

  pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
    now < self.stale_at
  }
}

/// Outcome of `MemoryStorage::lookup`.
#[derive(Debug)]
pub enum Lookup {
  Fresh(CacheEntry),
  /// An expired entry was found and removed
  Evicted,
  Missing,
}

/// Entry map keyed by slot hash.
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, CacheEntry>>,
  events: broadcast::Sender<CacheEvent>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
    Self {
      entries: Mutex::new(HashMap::new()),
      events,
    }
  }

  pub fn get(&self, hash: &str) -> PortalResult<Option<CacheEntry>> {
    let entries = self.lock()?;
    Ok(entries.get(hash).cloned())
  }

  pub fn store(&self, hash: &str, entry: CacheEntry) -> PortalResult<()> {
    let fetched_at = entry.fetched_at;
    self.lock()?.insert(hash.to_string(), entry);
    self.notify_updated(hash, fetched_at);
    Ok(())
  }

  /// Store unless `superseded` is set. The flag is read under the entry lock,
  /// so an invalidation that sets it before removing entries cannot be undone
  /// by a late store. Returns whether the entry was stored.
  pub fn store_unless(&self, hash: &str, entry: CacheEntry, superseded: &AtomicBool) -> PortalResult<bool> {
    let fetched_at = entry.fetched_at;
    {
      let mut entries = self.lock()?;
      if superseded.load(Ordering::SeqCst) {
        return Ok(false);
      }
      entries.insert(hash.to_string(), entry);
    }
    self.notify_updated(hash, fetched_at);
    Ok(true)
  }

  /// Fresh entry for `hash`. An expired one is removed in the same locked
  /// step, without notifying; expiry is not a change.
  pub fn lookup(&self, hash: &str, now: DateTime<Utc>) -> PortalResult<Lookup> {
    let mut entries = self.lock()?;
    match entries.get(hash) {
      Some(entry) if entry.is_fresh_at(now) => Ok(Lookup::Fresh(entry.clone())),
      Some(_) => {
        entries.remove(hash);
        Ok(Lookup::Evicted)
      }
      None => Ok(Lookup::Missing),
    }
  }

  /// Drop entries and notify subscribers. Returns the hashes that were present.
  pub fn invalidate<'a>(&self, hashes: impl IntoIterator<Item = &'a str>) -> PortalResult<Vec<String>> {
    let mut removed = Vec::new();
    {
      let mut entries = self.lock()?;
      for hash in hashes {
        if entries.remove(hash).is_some() {
          removed.push(hash.to_string());
        }
      }
    }

    for hash in &removed {
      self.notify_invalidated(hash);
    }
    Ok(removed)
  }

  /// Tell subscribers a slot was invalidated that held no entry yet.
  pub fn notify_invalidated(&self, hash: &str) {
    let _ = self.events.send(CacheEvent::Invalidated {
      hash: hash.to_string(),
    });
  }

  pub fn hashes(&self) -> PortalResult<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  pub fn len(&self) -> PortalResult<usize> {
    Ok(self.lock()?.len())
  }

  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  fn notify_updated(&self, hash: &str, fetched_at: DateTime<Utc>) {
    // No subscribers is fine
    let _ = self.events.send(CacheEvent::Updated {
      hash: hash.to_string(),
      fetched_at,
    });
  }

  fn lock(&self) -> PortalResult<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
    self
      .entries
      .lock()
      .map_err(|e| PortalError::Cache(format!("Lock poisoned: {}", e)))
  }
}

impl Default for MemoryStorage {
  fn default() -> Self {
    Self::new()
  }
}
