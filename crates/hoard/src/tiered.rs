//! Tiered cache store: a fast tier in front of a durable fallback tier.
//!
//! Writes fan out to both tiers; reads are served from the cache tier
//! when possible and repopulate it from the fallback tier when not. An
//! LRU tracker bounds the cache tier to a byte budget, and a
//! pending-rename set keeps a budget-triggered eviction from deleting
//! cache content that a concurrent rename has merely relocated.
//!
//! The fallback tier is the durability source of truth: every finalized
//! blob lives there, the cache tier holds a bounded subset, and a
//! cache-tier miss is never an error.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::key::BlobKey;
use crate::store::{ByteStream, Capability, Store};
use crate::tee::{fan_out_pair, resolve_fan_out};

/// Default cache-tier byte budget: 100 MiB.
pub const DEFAULT_BYTE_BUDGET: u64 = 100 * 1024 * 1024;

struct CacheEntry {
    size: u64,
    last_access: u64,
}

/// LRU tracker plus pending renames. Single-owner state of one
/// [`TieredStore`] instance, mutated only under its lock.
struct LruState {
    entries: HashMap<BlobKey, CacheEntry>,
    pending_renames: HashMap<BlobKey, BlobKey>,
    clock: u64,
    total: u64,
    budget: u64,
}

impl LruState {
    fn new(budget: u64) -> Self {
        Self {
            entries: HashMap::new(),
            pending_renames: HashMap::new(),
            clock: 0,
            total: 0,
            budget,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Mark `key` as recently used. Returns whether it is tracked.
    fn touch(&mut self, key: &BlobKey) -> bool {
        let clock = self.tick();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = clock;
                true
            }
            None => false,
        }
    }

    /// Track `key` at `size`, then evict LRU entries until the total is
    /// back under budget. Returns the keys whose cache-tier copies must
    /// be deleted (evicted keys with a rename in flight are skipped: the
    /// content moved, it did not disappear).
    fn register(&mut self, key: BlobKey, size: u64) -> Vec<BlobKey> {
        let clock = self.tick();
        if let Some(old) = self.entries.insert(key, CacheEntry { size, last_access: clock }) {
            self.total -= old.size;
        }
        self.total += size;
        self.evict_over_budget()
    }

    fn evict_over_budget(&mut self) -> Vec<BlobKey> {
        let mut doomed = Vec::new();
        while self.total > self.budget {
            let Some(lru) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            let entry = self.entries.remove(&lru).expect("lru key present");
            self.total -= entry.size;

            if self.pending_renames.remove(&lru).is_some() {
                debug!(blob.key = %lru, "eviction skipped, rename in flight");
                continue;
            }
            doomed.push(lru);
        }
        doomed
    }

    fn remove(&mut self, key: &BlobKey) -> Option<u64> {
        let entry = self.entries.remove(key)?;
        self.total -= entry.size;
        Some(entry.size)
    }

    /// Move the tracked entry from `from` to `to`, keeping its size.
    /// No-op when an eviction already consumed the entry.
    fn transfer(&mut self, from: &BlobKey, to: &BlobKey) {
        let clock = self.tick();
        if let Some(mut entry) = self.entries.remove(from) {
            entry.last_access = clock;
            if let Some(old) = self.entries.insert(to.clone(), entry) {
                self.total -= old.size;
            }
        }
    }
}

/// A capability synthesized over both tiers: invoke the primary tier,
/// and if the other tier declares the same name, invoke it too with the
/// same arguments. The result is the primary tier's.
struct ForwardedCapability {
    primary: Arc<dyn Capability>,
    secondary: Option<Arc<dyn Capability>>,
}

#[async_trait]
impl Capability for ForwardedCapability {
    async fn invoke(&self, args: Value) -> Result<Value, StoreError> {
        match &self.secondary {
            Some(secondary) => {
                let result = self.primary.invoke(args.clone()).await?;
                secondary.invoke(args).await?;
                Ok(result)
            }
            None => self.primary.invoke(args).await,
        }
    }
}

fn forwarded_capabilities(
    cache: &Arc<dyn Store>,
    fallback: &Arc<dyn Store>,
) -> HashMap<String, Arc<dyn Capability>> {
    let mut names: BTreeSet<String> = cache.capability_names().into_iter().collect();
    names.extend(fallback.capability_names());

    let mut forwarded: HashMap<String, Arc<dyn Capability>> = HashMap::new();
    for name in names {
        let capability: Arc<dyn Capability> =
            match (cache.capability(&name), fallback.capability(&name)) {
                (Some(primary), secondary) => Arc::new(ForwardedCapability { primary, secondary }),
                (None, Some(primary)) => Arc::new(ForwardedCapability {
                    primary,
                    secondary: None,
                }),
                (None, None) => continue,
            };
        forwarded.insert(name, capability);
    }
    forwarded
}

async fn delete_evicted(cache: &dyn Store, doomed: Vec<BlobKey>) {
    for key in doomed {
        match cache.delete(&key).await {
            Ok(()) => debug!(blob.key = %key, "evicted from cache tier"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(blob.key = %key, error = %e, "failed to delete evicted cache entry"),
        }
    }
}

/// A [`Store`] composing a fast `cache` tier and a durable `fallback`
/// tier under a byte budget.
///
/// On a partial tier failure the operation fails as a whole and the tier
/// that succeeded is not rolled back; the fallback tier stays
/// authoritative and the cache tier reconciles on the next read-through.
pub struct TieredStore {
    cache: Arc<dyn Store>,
    fallback: Arc<dyn Store>,
    state: Arc<Mutex<LruState>>,
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl TieredStore {
    /// Compose two tiers with the default 100 MiB byte budget.
    pub fn new(cache: Arc<dyn Store>, fallback: Arc<dyn Store>) -> Self {
        Self::with_byte_budget(cache, fallback, DEFAULT_BYTE_BUDGET)
    }

    pub fn with_byte_budget(cache: Arc<dyn Store>, fallback: Arc<dyn Store>, budget: u64) -> Self {
        let capabilities = forwarded_capabilities(&cache, &fallback);
        Self {
            cache,
            fallback,
            state: Arc::new(Mutex::new(LruState::new(budget))),
            capabilities,
        }
    }

    pub fn byte_budget(&self) -> u64 {
        self.state.lock().unwrap().budget
    }

    /// Sum of tracked cache-tier entry sizes.
    pub fn cached_bytes(&self) -> u64 {
        self.state.lock().unwrap().total
    }

    /// Number of tracked cache-tier entries.
    pub fn cached_len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether the LRU tracker currently holds `key`.
    pub fn is_cached(&self, key: &BlobKey) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }
}

#[async_trait]
impl Store for TieredStore {
    async fn put(&self, key: &BlobKey, src: ByteStream) -> Result<u64, StoreError> {
        let (cache_stream, fallback_stream, driver) = fan_out_pair(src);

        let (driver_res, cache_res, fallback_res) = tokio::join!(
            driver,
            self.cache.put(key, cache_stream),
            self.fallback.put(key, fallback_stream),
        );

        let consumer_errors: Vec<StoreError> = [cache_res, fallback_res]
            .into_iter()
            .filter_map(Result::err)
            .collect();
        let total = resolve_fan_out(driver_res, consumer_errors)?;

        let doomed = self.state.lock().unwrap().register(key.clone(), total);
        delete_evicted(self.cache.as_ref(), doomed).await;

        Ok(total)
    }

    async fn get(&self, key: &BlobKey) -> Result<ByteStream, StoreError> {
        if self.state.lock().unwrap().touch(key) {
            match self.cache.get(key).await {
                Ok(stream) => {
                    debug!(blob.key = %key, "cache tier hit");
                    return Ok(stream);
                }
                Err(e) if e.is_not_found() => {
                    // Tracker said cached but the tier lost it; heal the
                    // tracker and read through.
                    warn!(blob.key = %key, "cache tier lost a tracked entry");
                    self.state.lock().unwrap().remove(key);
                }
                Err(e) => return Err(e),
            }
        }

        // Miss: stream from the fallback tier while populating the cache
        // tier through a forked pass-through. The entry is registered
        // only once population completes.
        let fallback_stream = self.fallback.get(key).await?;
        let (caller_stream, cache_stream, driver) = fan_out_pair(fallback_stream);

        let cache = Arc::clone(&self.cache);
        let state = Arc::clone(&self.state);
        let key = key.clone();
        tokio::spawn(async move {
            let (driver_res, put_res) = tokio::join!(driver, cache.put(&key, cache_stream));
            match (driver_res, put_res) {
                (Ok(total), Ok(_)) => {
                    let doomed = state.lock().unwrap().register(key.clone(), total);
                    delete_evicted(cache.as_ref(), doomed).await;
                    debug!(blob.key = %key, blob.size = total, "populated cache tier on read");
                }
                _ => {
                    // The caller hung up or a tier failed; drop whatever
                    // partial entry landed so the budget stays truthful.
                    let _ = cache.delete(&key).await;
                }
            }
        });

        Ok(caller_stream)
    }

    async fn rename(&self, from: &BlobKey, to: &BlobKey) -> Result<(), StoreError> {
        // Registered before the rename is issued, so an eviction racing
        // with the rename treats the key as moved, not gone.
        self.state
            .lock()
            .unwrap()
            .pending_renames
            .insert(from.clone(), to.clone());

        let result: Result<(), StoreError> = async {
            self.fallback.rename(from, to).await?;
            if self.cache.exists(from).await? {
                self.cache.rename(from, to).await?;
            }
            Ok(())
        }
        .await;

        let mut state = self.state.lock().unwrap();
        state.pending_renames.remove(from);
        result?;
        state.transfer(from, to);
        Ok(())
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, StoreError> {
        // The durability source of truth; cache absence is not informative.
        self.fallback.exists(key).await
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), StoreError> {
        self.state.lock().unwrap().remove(key);
        match self.cache.delete(key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(blob.key = %key, error = %e, "cache tier delete failed"),
        }
        self.fallback.delete(key).await
    }

    fn capability(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    fn capability_names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemStore;
    use crate::store::{stream_from_bytes, StoreExt};
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn tiers() -> (Arc<MemStore>, Arc<MemStore>) {
        (Arc::new(MemStore::new()), Arc::new(MemStore::new()))
    }

    async fn read_all(store: &dyn Store, key: &BlobKey) -> Result<Vec<u8>, StoreError> {
        let mut stream = store.get(key).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.map_err(StoreError::Io)?);
        }
        Ok(out)
    }

    /// Read-through population finishes on a background task; poll until
    /// the condition holds.
    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_put_populates_both_tiers() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = TieredStore::new(cache.clone(), fallback.clone());
        let key = BlobKey::from("objects/ab/cdef");

        let size = store.put(&key, stream_from_bytes("both tiers")).await?;

        assert_eq!(size, 10);
        assert!(cache.exists(&key).await?);
        assert!(fallback.exists(&key).await?);
        assert!(store.is_cached(&key));
        assert_eq!(store.cached_bytes(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn test_default_budget_is_100_mib() {
        let (cache, fallback) = tiers();
        let store = TieredStore::new(cache, fallback);
        assert_eq!(store.byte_budget(), 100 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_lru_eviction_scenario() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = TieredStore::with_byte_budget(cache.clone(), fallback.clone(), 100);

        let a = BlobKey::from("a");
        let b = BlobKey::from("b");
        let c = BlobKey::from("c");
        let payload = vec![7u8; 40];

        store.put(&a, stream_from_bytes(payload.clone())).await?;
        store.put(&b, stream_from_bytes(payload.clone())).await?;
        store.put(&c, stream_from_bytes(payload.clone())).await?;

        // 40+40+40 > 100: the oldest entry is evicted from the cache
        // tier only.
        assert!(!store.is_cached(&a));
        assert!(store.is_cached(&b));
        assert!(store.is_cached(&c));
        assert!(!cache.exists(&a).await?);
        assert!(fallback.exists(&a).await?);
        assert_eq!(store.cached_bytes(), 80);

        // B and C hit the cache tier; A falls through and still reads
        // back unchanged.
        assert_eq!(read_all(&store, &b).await?, payload);
        assert_eq!(read_all(&store, &c).await?, payload);
        assert_eq!(read_all(&store, &a).await?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_touch_protects_from_eviction() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = TieredStore::with_byte_budget(cache.clone(), fallback, 100);

        let a = BlobKey::from("a");
        let b = BlobKey::from("b");
        let c = BlobKey::from("c");
        let payload = vec![1u8; 40];

        store.put(&a, stream_from_bytes(payload.clone())).await?;
        store.put(&b, stream_from_bytes(payload.clone())).await?;

        // Touch A so B becomes least recently used.
        read_all(&store, &a).await?;

        store.put(&c, stream_from_bytes(payload.clone())).await?;

        assert!(store.is_cached(&a));
        assert!(!store.is_cached(&b));
        assert!(store.is_cached(&c));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_through_repopulates_cache() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = TieredStore::with_byte_budget(cache.clone(), fallback.clone(), 100);
        let key = BlobKey::from("repop");

        // Seed the fallback tier only, as if the entry had been evicted.
        fallback.put(&key, stream_from_bytes("fallback copy")).await?;
        assert!(!store.is_cached(&key));

        assert_eq!(read_all(&store, &key).await?, b"fallback copy");

        let store = Arc::new(store);
        let probe = Arc::clone(&store);
        let probe_key = key.clone();
        wait_until(move || probe.is_cached(&probe_key)).await;
        assert!(cache.exists(&key).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_read_through_leaves_no_tracked_entry() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = Arc::new(TieredStore::with_byte_budget(
            cache.clone(),
            fallback.clone(),
            100,
        ));
        let key = BlobKey::from("abandoned");
        fallback.put(&key, stream_from_bytes("never read")).await?;

        let stream = store.get(&key).await?;
        drop(stream);

        // The background population notices the dropped consumer and
        // cleans up without registering anything. Give it a moment to
        // run before polling for the cleaned-up state.
        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..200 {
            if !cache.exists(&key).await? && !store.is_cached(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!cache.exists(&key).await?);
        assert!(!store.is_cached(&key));
        Ok(())
    }

    #[tokio::test]
    async fn test_budget_invariant_after_every_put() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = TieredStore::with_byte_budget(cache, fallback, 128);

        for (i, size) in [30usize, 50, 70, 10, 120, 40].into_iter().enumerate() {
            let key = BlobKey::new(format!("blob-{i}"));
            store.put(&key, stream_from_bytes(vec![0u8; size])).await?;
            assert!(
                store.cached_bytes() <= 128,
                "budget exceeded after put {i}: {}",
                store.cached_bytes()
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_transfers_tracked_entry() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = TieredStore::with_byte_budget(cache.clone(), fallback.clone(), 100);
        let from = BlobKey::from("staging/tmp");
        let to = BlobKey::from("objects/ab/final");

        store.put(&from, stream_from_bytes("moved bytes")).await?;
        store.rename(&from, &to).await?;

        assert!(!store.is_cached(&from));
        assert!(store.is_cached(&to));
        assert_eq!(store.cached_bytes(), 11);
        assert_eq!(read_all(&store, &to).await?, b"moved bytes");
        assert!(fallback.exists(&to).await?);
        assert!(!fallback.exists(&from).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_rename_missing_source_clears_pending() {
        let (cache, fallback) = tiers();
        let store = TieredStore::new(cache, fallback);

        let err = store
            .rename(&BlobKey::from("gone"), &BlobKey::from("dest"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.state.lock().unwrap().pending_renames.is_empty());
    }

    /// Store wrapper that parks renames on a gate so a concurrent
    /// eviction can be staged deterministically.
    struct GatedRename {
        inner: Arc<dyn Store>,
        gate: Arc<Notify>,
        parked: Arc<Notify>,
    }

    #[async_trait]
    impl Store for GatedRename {
        async fn put(&self, key: &BlobKey, src: ByteStream) -> Result<u64, StoreError> {
            self.inner.put(key, src).await
        }
        async fn get(&self, key: &BlobKey) -> Result<ByteStream, StoreError> {
            self.inner.get(key).await
        }
        async fn rename(&self, from: &BlobKey, to: &BlobKey) -> Result<(), StoreError> {
            self.parked.notify_one();
            self.gate.notified().await;
            self.inner.rename(from, to).await
        }
        async fn exists(&self, key: &BlobKey) -> Result<bool, StoreError> {
            self.inner.exists(key).await
        }
        async fn delete(&self, key: &BlobKey) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_rename_racing_eviction_keeps_content() -> anyhow::Result<()> {
        let cache = Arc::new(MemStore::new());
        let fallback_inner = Arc::new(MemStore::new());
        let gate = Arc::new(Notify::new());
        let parked = Arc::new(Notify::new());
        let fallback: Arc<dyn Store> = Arc::new(GatedRename {
            inner: fallback_inner.clone(),
            gate: gate.clone(),
            parked: parked.clone(),
        });

        let store = Arc::new(TieredStore::with_byte_budget(
            cache.clone(),
            fallback,
            100,
        ));

        let victim = BlobKey::from("staging/victim");
        let moved = BlobKey::from("objects/ab/moved");
        store.put(&victim, stream_from_bytes(vec![1u8; 60])).await?;

        // Start the rename; it registers the pending entry, then parks
        // inside the fallback tier.
        let renamer = Arc::clone(&store);
        let (rv, rm) = (victim.clone(), moved.clone());
        let rename_task = tokio::spawn(async move { renamer.rename(&rv, &rm).await });
        parked.notified().await;

        // This put pushes the budget over and evicts the victim, which
        // must be treated as moved, not gone.
        store
            .put(&BlobKey::from("big"), stream_from_bytes(vec![2u8; 60]))
            .await?;
        assert!(!store.is_cached(&victim));
        assert!(cache.exists(&victim).await?, "cache copy must survive the eviction");

        gate.notify_one();
        rename_task.await??;

        // Durable copy intact and readable under the destination key.
        assert!(fallback_inner.exists(&moved).await?);
        assert_eq!(read_all(store.as_ref(), &moved).await?, vec![1u8; 60]);
        Ok(())
    }

    #[tokio::test]
    async fn test_exists_consults_fallback_only() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = TieredStore::new(cache.clone(), fallback.clone());
        let key = BlobKey::from("k");

        cache.put(&key, stream_from_bytes("cache only")).await?;
        assert!(!store.exists(&key).await?);

        fallback.put(&key, stream_from_bytes("durable")).await?;
        assert!(store.exists(&key).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_from_both_tiers() -> anyhow::Result<()> {
        let (cache, fallback) = tiers();
        let store = TieredStore::new(cache.clone(), fallback.clone());
        let key = BlobKey::from("doomed");

        store.put(&key, stream_from_bytes("bytes")).await?;
        store.delete(&key).await?;

        assert!(!cache.exists(&key).await?);
        assert!(!fallback.exists(&key).await?);
        assert!(!store.is_cached(&key));
        assert_eq!(store.cached_bytes(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_capability_forwarding() -> anyhow::Result<()> {
        let fallback_calls = Arc::new(AtomicUsize::new(0));
        let calls = fallback_calls.clone();

        let cache: Arc<dyn Store> = Arc::new(MemStore::new().with_capability(
            "shared",
            Arc::new(|_args: Value| async move { Ok::<_, StoreError>(json!("from cache tier")) }),
        ));
        let fallback: Arc<dyn Store> = Arc::new(
            MemStore::new()
                .with_capability(
                    "shared",
                    Arc::new(move |_args: Value| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, StoreError>(json!("from fallback tier"))
                        }
                    }),
                )
                .with_capability(
                    "fallback-only",
                    Arc::new(|_args: Value| async move { Ok::<_, StoreError>(json!("durable")) }),
                ),
        );

        let store = TieredStore::new(cache, fallback);

        // Declared on both tiers: both run, the cache tier's result wins.
        let result = store.invoke_capability("shared", json!({})).await?;
        assert_eq!(result, json!("from cache tier"));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);

        // Declared on the fallback tier only: reachable through the
        // composite.
        let result = store.invoke_capability("fallback-only", json!({})).await?;
        assert_eq!(result, json!("durable"));

        // Declared nowhere.
        let err = store
            .invoke_capability("bulk-copy", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CapabilityNotFound(_)));

        let mut names = store.capability_names();
        names.sort();
        assert_eq!(names, vec!["fallback-only", "shared"]);
        Ok(())
    }
}
