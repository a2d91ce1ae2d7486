//! Cache layer that orchestrates staleness and request de-duplication with
//! network fetching.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::storage::{CacheEntry, Lookup, MemoryStorage};
use super::traits::{CacheEvent, CacheResult, CacheSource, QueryKey};
use crate::error::{PortalError, PortalResult};

type SharedFetch = Shared<BoxFuture<'static, PortalResult<CacheEntry>>>;
type InFlightMap = HashMap<String, InFlight>;
type TagMap = HashMap<String, Vec<String>>;

/// Cache service shared by every query of one session (or one prefetch request).
///
/// Cloning is cheap and every clone points at the same entries.
#[derive(Clone)]
pub struct CacheLayer {
  inner: Arc<Inner>,
}

/// A running fetch. Once `superseded` is set its result is handed to the
/// callers already waiting but never stored.
struct InFlight {
  fetch: SharedFetch,
  superseded: Arc<AtomicBool>,
}

// Lock order: `in_flight`, then `tags`, then the storage entries.
struct Inner {
  storage: MemoryStorage,
  in_flight: Mutex<InFlightMap>,
  /// Tags of every slot that holds an entry or has a fetch in flight
  tags: Mutex<TagMap>,
}

impl Inner {
  /// Clear our in-flight slot once the fetch has settled. A superseded fetch
  /// no longer owns the slot and leaves it alone.
  fn settle(&self, hash: &str, superseded: &Arc<AtomicBool>, stored: bool) {
    let mut in_flight = match self.in_flight.lock() {
      Ok(in_flight) => in_flight,
      Err(e) => {
        warn!(hash, "Lock poisoned while clearing in-flight fetch: {}", e);
        return;
      }
    };

    let owned = in_flight
      .get(hash)
      .is_some_and(|slot| Arc::ptr_eq(&slot.superseded, superseded));
    if !owned {
      return;
    }
    in_flight.remove(hash);

    if !stored {
      match self.tags.lock() {
        Ok(mut tags) => {
          tags.remove(hash);
        }
        Err(e) => warn!(hash, "Lock poisoned while forgetting tags: {}", e),
      }
    }
  }
}

impl CacheLayer {
  /// Create an empty cache.
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        storage: MemoryStorage::new(),
        in_flight: Mutex::new(HashMap::new()),
        tags: Mutex::new(HashMap::new()),
      }),
    }
  }

  /// Fetch a value with cache-first strategy.
  ///
  /// 1. Unexpired entry: return it, no network
  /// 2. Fetch already in flight for the key: wait for that one
  /// 3. Otherwise run `fetcher` on its own task and store the result
  ///
  /// The fetch task runs to completion even if every caller goes away. A
  /// failure is handed to all waiters and is not cached. There is no retry.
  /// A fetch overtaken by an invalidation still answers its waiters but does
  /// not store.
  pub async fn fetch<K, F, Fut>(
    &self,
    key: &K,
    stale_time: Duration,
    fetcher: F,
  ) -> PortalResult<CacheResult<Value>>
  where
    K: QueryKey + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = PortalResult<Value>> + Send + 'static,
  {
    let hash = key.cache_hash();

    if let Some(entry) = self.fresh_entry(&hash)? {
      debug!(query = %key.description(), "cache hit");
      return Ok(into_result(entry, CacheSource::Cache));
    }

    let (shared, source) = {
      let mut in_flight = self.lock_in_flight()?;

      if let Some(existing) = in_flight.get(&hash) {
        debug!(query = %key.description(), "joining in-flight fetch");
        (existing.fetch.clone(), CacheSource::Shared)
      } else {
        // A fetch may have landed between the first lookup and taking the lock.
        // `fresh_entry` would take `in_flight` again, so go to storage directly.
        if let Lookup::Fresh(entry) = self.inner.storage.lookup(&hash, Utc::now())? {
          return Ok(into_result(entry, CacheSource::Cache));
        }

        debug!(query = %key.description(), stale_secs = stale_time.as_secs(), "cache miss, fetching");
        self.remember_tags(&hash, key.tags())?;

        let superseded = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(&self.inner);
        let task_hash = hash.clone();
        let task_superseded = Arc::clone(&superseded);
        let request = fetcher();
        let handle = tokio::spawn(async move {
          let result = request
            .await
            .map(|value| CacheEntry::new(value, Utc::now(), stale_time));
          let stored = match &result {
            Ok(entry) => inner
              .storage
              .store_unless(&task_hash, entry.clone(), &task_superseded)
              .unwrap_or_else(|e| {
                warn!(hash = %task_hash, "Failed to store fetched value: {}", e);
                false
              }),
            Err(_) => false,
          };
          if !stored && task_superseded.load(AtomicOrdering::SeqCst) {
            debug!(hash = %task_hash, "discarding result of invalidated fetch");
          }
          inner.settle(&task_hash, &task_superseded, stored);
          result
        });

        let shared = async move {
          handle
            .await
            .unwrap_or_else(|e| Err(PortalError::Cache(format!("Fetch task failed: {}", e))))
        }
        .boxed()
        .shared();

        in_flight.insert(
          hash.clone(),
          InFlight {
            fetch: shared.clone(),
            superseded,
          },
        );
        (shared, CacheSource::Network)
      }
    };

    let entry = shared.await?;
    Ok(into_result(entry, source))
  }

  /// Peek at an unexpired entry without fetching.
  pub fn peek<K: QueryKey + ?Sized>(&self, key: &K) -> PortalResult<Option<CacheResult<Value>>> {
    Ok(
      self
        .fresh_entry(&key.cache_hash())?
        .map(|entry| into_result(entry, CacheSource::Cache)),
    )
  }

  /// Whether the key currently holds trusted data.
  pub fn has_data<K: QueryKey + ?Sized>(&self, key: &K) -> PortalResult<bool> {
    Ok(self.fresh_entry(&key.cache_hash())?.is_some())
  }

  /// Drop one slot and notify subscribers. A fetch in flight for it is
  /// superseded, so the next call fetches again. Returns whether there was
  /// anything to drop.
  pub fn invalidate<K: QueryKey + ?Sized>(&self, key: &K) -> PortalResult<bool> {
    let hash = key.cache_hash();
    debug!(query = %key.description(), "invalidating");
    let dropped = self.drop_slots(|candidate, _| candidate == hash)?;
    Ok(dropped > 0)
  }

  /// Drop every slot whose key carried `tag`. Returns how many were dropped.
  pub fn invalidate_tagged(&self, tag: &str) -> PortalResult<usize> {
    let dropped = self.drop_slots(|_, tags| tags.iter().any(|t| t == tag))?;
    debug!(tag, dropped, "invalidated tagged entries");
    Ok(dropped)
  }

  /// Subscribe to entry changes.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.storage.subscribe()
  }

  /// Number of stored entries, expired ones included.
  pub fn len(&self) -> PortalResult<usize> {
    self.inner.storage.len()
  }

  pub fn is_empty(&self) -> PortalResult<bool> {
    Ok(self.len()? == 0)
  }

  /// Slot hashes of every stored entry.
  pub fn hashes(&self) -> PortalResult<Vec<String>> {
    self.inner.storage.hashes()
  }

  /// Supersede in-flight fetches and forget tags for the selected slots, then
  /// drop their entries. Slots are selected by hash and remembered tags; a slot
  /// without tags is only reachable by hash.
  fn drop_slots<P>(&self, selects: P) -> PortalResult<usize>
  where
    P: Fn(&str, &[String]) -> bool,
  {
    let (hashes, superseded) = {
      let mut in_flight = self.lock_in_flight()?;
      let mut tags = self.lock_tags()?;

      let mut hashes: Vec<String> = tags
        .iter()
        .filter(|(hash, slot_tags)| selects(hash.as_str(), slot_tags.as_slice()))
        .map(|(hash, _)| hash.clone())
        .collect();
      for hash in in_flight.keys().chain(self.inner.storage.hashes()?.iter()) {
        if !hashes.contains(hash) && !tags.contains_key(hash) && selects(hash, &[]) {
          hashes.push(hash.clone());
        }
      }

      let mut superseded = Vec::new();
      for hash in &hashes {
        if let Some(slot) = in_flight.remove(hash) {
          slot.superseded.store(true, AtomicOrdering::SeqCst);
          superseded.push(hash.clone());
        }
        tags.remove(hash);
      }
      (hashes, superseded)
    };

    let removed = self
      .inner
      .storage
      .invalidate(hashes.iter().map(String::as_str))?;
    for hash in superseded.iter().filter(|hash| !removed.contains(*hash)) {
      self.inner.storage.notify_invalidated(hash);
    }

    let mut dropped = removed;
    dropped.extend(superseded);
    dropped.sort();
    dropped.dedup();
    Ok(dropped.len())
  }

  fn fresh_entry(&self, hash: &str) -> PortalResult<Option<CacheEntry>> {
    match self.inner.storage.lookup(hash, Utc::now())? {
      Lookup::Fresh(entry) => Ok(Some(entry)),
      Lookup::Evicted => {
        self.prune_tags(hash)?;
        Ok(None)
      }
      Lookup::Missing => Ok(None),
    }
  }

  /// Forget the tags of an evicted slot unless a fetch has claimed it since.
  fn prune_tags(&self, hash: &str) -> PortalResult<()> {
    let in_flight = self.lock_in_flight()?;
    if in_flight.contains_key(hash) || self.inner.storage.get(hash)?.is_some() {
      return Ok(());
    }
    self.lock_tags()?.remove(hash);
    Ok(())
  }

  fn remember_tags(&self, hash: &str, tags: Vec<String>) -> PortalResult<()> {
    if !tags.is_empty() {
      self.lock_tags()?.insert(hash.to_string(), tags);
    }
    Ok(())
  }

  fn lock_in_flight(&self) -> PortalResult<MutexGuard<'_, InFlightMap>> {
    self
      .inner
      .in_flight
      .lock()
      .map_err(|e| PortalError::Cache(format!("Lock poisoned: {}", e)))
  }

  fn lock_tags(&self) -> PortalResult<MutexGuard<'_, TagMap>> {
    self
      .inner
      .tags
      .lock()
      .map_err(|e| PortalError::Cache(format!("Lock poisoned: {}", e)))
  }
}

impl Default for CacheLayer {
  fn default() -> Self {
    Self::new()
  }
}

fn into_result(entry: CacheEntry, source: CacheSource) -> CacheResult<Value> {
  CacheResult {
    data: entry.value,
    source,
    fetched_at: entry.fetched_at,
    stale_at: entry.stale_at,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::UpstreamError;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct TestKey(&'static str);

  impl QueryKey for TestKey {
    fn cache_hash(&self) -> String {
      format!("test:{}", self.0)
    }

    fn description(&self) -> String {
      self.0.to_string()
    }

    fn tags(&self) -> Vec<String> {
      vec!["group".to_string()]
    }
  }

  const HOUR: Duration = Duration::from_secs(3600);

  fn counting_fetcher(
    calls: &Arc<AtomicUsize>,
    delay_ms: u64,
    value: Value,
  ) -> impl FnOnce() -> BoxFuture<'static, PortalResult<Value>> {
    let calls = Arc::clone(calls);
    move || {
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(value)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_concurrent_fetches_share_one_request() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = TestKey("anomalies");

    let (a, b) = tokio::join!(
      cache.fetch(&key, HOUR, counting_fetcher(&calls, 20, json!([1, 2]))),
      cache.fetch(&key, HOUR, counting_fetcher(&calls, 20, json!([3]))),
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.data, json!([1, 2]));
    assert_eq!(b.data, json!([1, 2]));
    assert_eq!(a.source, CacheSource::Network);
    assert_eq!(b.source, CacheSource::Shared);
  }

  #[tokio::test]
  async fn test_fresh_entry_is_reused() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = TestKey("leaks");

    cache
      .fetch(&key, HOUR, counting_fetcher(&calls, 0, json!("v1")))
      .await
      .unwrap();
    let second = cache
      .fetch(&key, HOUR, counting_fetcher(&calls, 0, json!("v2")))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data, json!("v1"));
    assert!(cache.has_data(&key).unwrap());
  }

  #[tokio::test]
  async fn test_expired_entry_is_refetched() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = TestKey("invoices");

    cache
      .fetch(&key, Duration::ZERO, counting_fetcher(&calls, 0, json!("v1")))
      .await
      .unwrap();
    assert!(!cache.has_data(&key).unwrap());

    let second = cache
      .fetch(&key, HOUR, counting_fetcher(&calls, 0, json!("v2")))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(second.source, CacheSource::Network);
    assert_eq!(second.data, json!("v2"));
  }

  #[tokio::test]
  async fn test_failure_is_shared_and_not_cached() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = TestKey("pannes");

    let failing = |calls: &Arc<AtomicUsize>| {
      let calls = Arc::clone(calls);
      move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Err::<Value, _>(PortalError::Upstream(UpstreamError::Server {
          status: 502,
          reason: "Bad gateway".into(),
        }))
      }
    };

    let (a, b) = tokio::join!(
      cache.fetch(&key, HOUR, failing(&calls)),
      cache.fetch(&key, HOUR, failing(&calls)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap_err().to_string(), b.unwrap_err().to_string());
    assert!(!cache.has_data(&key).unwrap());

    // Nothing is retried on our behalf, but a later call goes to the network again
    let _ = cache.fetch(&key, HOUR, failing(&calls)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_abandoned_fetch_still_lands_in_cache() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = TestKey("interventions");

    let abandoned = tokio::time::timeout(
      Duration::from_millis(5),
      cache.fetch(&key, HOUR, counting_fetcher(&calls, 40, json!("late"))),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cache.has_data(&key).unwrap());
    assert_eq!(cache.peek(&key).unwrap().unwrap().data, json!("late"));
  }

  #[tokio::test]
  async fn test_invalidate_notifies_and_forces_refetch() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = TestKey("logements");

    cache
      .fetch(&key, HOUR, counting_fetcher(&calls, 0, json!(1)))
      .await
      .unwrap();

    let mut rx = cache.subscribe();
    assert!(cache.invalidate(&key).unwrap());
    assert_eq!(
      rx.try_recv().unwrap(),
      CacheEvent::Invalidated {
        hash: key.cache_hash()
      }
    );

    cache
      .fetch(&key, HOUR, counting_fetcher(&calls, 0, json!(2)))
      .await
      .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_invalidate_tagged() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for name in ["a", "b"] {
      cache
        .fetch(&TestKey(name), HOUR, counting_fetcher(&calls, 0, json!(name)))
        .await
        .unwrap();
    }

    assert_eq!(cache.invalidate_tagged("group").unwrap(), 2);
    assert_eq!(cache.invalidate_tagged("other").unwrap(), 0);
    assert!(cache.is_empty().unwrap());
  }

  fn remembered_tags(cache: &CacheLayer) -> usize {
    cache.inner.tags.lock().unwrap().len()
  }

  #[tokio::test]
  async fn test_invalidate_during_fetch_discards_its_result() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = TestKey("occupant");

    let before_write = {
      let cache = cache.clone();
      let calls = Arc::clone(&calls);
      tokio::spawn(async move {
        let key = TestKey("occupant");
        cache
          .fetch(&key, HOUR, counting_fetcher(&calls, 50, json!("pre-write")))
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut rx = cache.subscribe();
    assert!(cache.invalidate(&key).unwrap());
    assert_eq!(
      rx.try_recv().unwrap(),
      CacheEvent::Invalidated {
        hash: key.cache_hash()
      }
    );

    let after_write = cache
      .fetch(&key, HOUR, counting_fetcher(&calls, 0, json!("post-write")))
      .await
      .unwrap();
    assert_eq!(after_write.source, CacheSource::Network);
    assert_eq!(after_write.data, json!("post-write"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The earlier caller still gets its answer, but it never reaches the cache
    let earlier = before_write.await.unwrap().unwrap();
    assert_eq!(earlier.data, json!("pre-write"));
    assert_eq!(cache.peek(&key).unwrap().unwrap().data, json!("post-write"));
  }

  #[tokio::test]
  async fn test_invalidate_tagged_supersedes_in_flight_fetch() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let pending = {
      let cache = cache.clone();
      let calls = Arc::clone(&calls);
      tokio::spawn(async move {
        let key = TestKey("fuites");
        cache
          .fetch(&key, HOUR, counting_fetcher(&calls, 40, json!("old")))
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(cache.invalidate_tagged("group").unwrap(), 1);
    assert_eq!(remembered_tags(&cache), 0);

    assert_eq!(pending.await.unwrap().unwrap().data, json!("old"));
    assert!(cache.is_empty().unwrap());
    assert!(!cache.has_data(&TestKey("fuites")).unwrap());
  }

  #[tokio::test]
  async fn test_tags_are_forgotten_with_their_slot() {
    let cache = CacheLayer::new();
    let calls = Arc::new(AtomicUsize::new(0));

    // Invalidated
    let key = TestKey("factures");
    cache
      .fetch(&key, HOUR, counting_fetcher(&calls, 0, json!(1)))
      .await
      .unwrap();
    assert_eq!(remembered_tags(&cache), 1);
    cache.invalidate(&key).unwrap();
    assert_eq!(remembered_tags(&cache), 0);

    // Failed
    let failed = cache
      .fetch(&TestKey("gestionnaires"), HOUR, || async {
        Err::<Value, _>(PortalError::Cache("boom".into()))
      })
      .await;
    assert!(failed.is_err());
    assert_eq!(remembered_tags(&cache), 0);

    // Expired, then evicted by a lookup
    let key = TestKey("occupants");
    cache
      .fetch(&key, Duration::ZERO, counting_fetcher(&calls, 0, json!(2)))
      .await
      .unwrap();
    assert_eq!(remembered_tags(&cache), 1);
    assert!(!cache.has_data(&key).unwrap());
    assert_eq!(remembered_tags(&cache), 0);
    assert!(cache.is_empty().unwrap());
  }
}
