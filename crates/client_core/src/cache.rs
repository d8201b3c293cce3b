use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::{error::CacheError, lock};

/// Composite cache key compared by value, e.g. `["messages", user, peer]`.
/// The first part names the domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn domain(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl<const N: usize> From<[&str; N]> for CacheKey {
    fn from(parts: [&str; N]) -> Self {
        Self::new(parts)
    }
}

impl From<Vec<String>> for CacheKey {
    fn from(parts: Vec<String>) -> Self {
        Self(parts)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Snapshot of one cached entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: CacheKey,
    pub value: V,
    pub fetched_at: Instant,
    pub stale: bool,
    pub dependents: BTreeSet<CacheKey>,
}

type LoadFuture<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

struct StoredValue<V> {
    value: V,
    fetched_at: Instant,
    stale: bool,
}

struct PendingLoad<V> {
    id: u64,
    future: LoadFuture<V>,
}

struct CacheState<V> {
    entries: HashMap<CacheKey, StoredValue<V>>,
    /// Edges may exist before the source key is ever fetched.
    dependents: HashMap<CacheKey, BTreeSet<CacheKey>>,
    inflight: HashMap<CacheKey, PendingLoad<V>>,
    /// Bumped by an invalidation that races a load, so the load lands
    /// stale. Only keys with a load in flight have an entry.
    generations: HashMap<CacheKey, u64>,
    era: u64,
    next_load_id: u64,
    stale_times: HashMap<String, Duration>,
}

impl<V> CacheState<V> {
    fn generation(&self, key: &CacheKey) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    fn bump_generation(&mut self, key: &CacheKey) {
        if self.inflight.contains_key(key) {
            *self.generations.entry(key.clone()).or_insert(0) += 1;
        }
    }

    fn prune_generation(&mut self, key: &CacheKey) {
        if !self.inflight.contains_key(key) {
            self.generations.remove(key);
        }
    }

    fn stale_time(&self, key: &CacheKey, default: Duration) -> Duration {
        key.domain()
            .and_then(|domain| self.stale_times.get(domain))
            .copied()
            .unwrap_or(default)
    }

    fn is_fresh(&self, key: &CacheKey, stored: &StoredValue<V>, default: Duration, now: Instant) -> bool {
        !stored.stale && now.duration_since(stored.fetched_at) < self.stale_time(key, default)
    }

    /// Breadth-first over the dependents graph; each key is visited once.
    fn invalidate_from(&mut self, roots: Vec<CacheKey>, visited: &mut BTreeSet<CacheKey>) -> Vec<CacheKey> {
        let mut order = Vec::new();
        let mut queue: VecDeque<CacheKey> = roots.into();
        while let Some(key) = queue.pop_front() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(stored) = self.entries.get_mut(&key) {
                stored.stale = true;
            }
            self.bump_generation(&key);
            if let Some(dependents) = self.dependents.get(&key) {
                queue.extend(dependents.iter().cloned());
            }
            order.push(key);
        }
        order
    }
}

/// Keyed store of fetched values with dependency-based invalidation.
///
/// Loads are single-flight per key. Invalidation only marks entries stale;
/// the next `fetch` performs the reload.
pub struct ReactiveCache<V> {
    default_stale_time: Duration,
    state: Mutex<CacheState<V>>,
}

impl<V> ReactiveCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_stale_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            default_stale_time,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                dependents: HashMap::new(),
                inflight: HashMap::new(),
                generations: HashMap::new(),
                era: 0,
                next_load_id: 0,
                stale_times: HashMap::new(),
            }),
        })
    }

    /// Stale time for every key whose first part is `domain`.
    pub fn set_stale_time(&self, domain: impl Into<String>, stale_time: Duration) {
        lock(&self.state).stale_times.insert(domain.into(), stale_time);
    }

    /// Returns the cached value while fresh, otherwise loads it. Concurrent
    /// callers for one key share a single loader invocation.
    ///
    /// A loader error reaches every waiter and leaves any previous value in
    /// place.
    pub async fn fetch<F, Fut>(self: &Arc<Self>, key: CacheKey, loader: F) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let future = {
            let mut state = lock(&self.state);
            if let Some(stored) = state.entries.get(&key) {
                if state.is_fresh(&key, stored, self.default_stale_time, Instant::now()) {
                    trace!(key = %key, "cache: hit");
                    return Ok(stored.value.clone());
                }
            }
            let pending = state
                .inflight
                .get(&key)
                .map(|pending| (pending.id, pending.future.clone()));
            if let Some((id, future)) = pending {
                debug!(key = %key, load_id = id, "cache: joining in-flight load");
                future
            } else {
                let id = state.next_load_id;
                state.next_load_id += 1;
                let generation = state.generation(&key);
                let era = state.era;

                debug!(key = %key, load_id = id, "cache: loading");
                let cache = Arc::clone(self);
                let load_key = key.clone();
                let task = tokio::spawn(async move {
                    let result = loader().await;
                    cache.complete_load(load_key, id, generation, era, result)
                });
                let task_key = key.clone();
                let weak = Arc::downgrade(self);
                let future = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(err) => {
                            if let Some(cache) = weak.upgrade() {
                                cache.abandon_load(&task_key, id);
                            }
                            Err(CacheError::Loader {
                                key: task_key,
                                cause: Arc::new(anyhow::anyhow!("load task failed: {err}")),
                            })
                        }
                    }
                }
                .boxed()
                .shared();
                state.inflight.insert(
                    key,
                    PendingLoad {
                        id,
                        future: future.clone(),
                    },
                );
                future
            }
        };
        future.await
    }

    fn abandon_load(&self, key: &CacheKey, id: u64) {
        let mut state = lock(&self.state);
        if state.inflight.get(key).is_some_and(|pending| pending.id == id) {
            state.inflight.remove(key);
            state.prune_generation(key);
        }
    }

    fn complete_load(
        &self,
        key: CacheKey,
        id: u64,
        generation: u64,
        era: u64,
        result: anyhow::Result<V>,
    ) -> Result<V, CacheError> {
        let mut state = lock(&self.state);
        let stale = state.generation(&key) != generation;
        if state.inflight.get(&key).is_some_and(|pending| pending.id == id) {
            state.inflight.remove(&key);
            state.prune_generation(&key);
        }

        match result {
            Ok(value) => {
                if state.era != era {
                    debug!(key = %key, "cache: cleared while loading; result not stored");
                    return Ok(value);
                }
                if stale {
                    debug!(key = %key, "cache: invalidated while loading; storing as stale");
                }
                state.entries.insert(
                    key,
                    StoredValue {
                        value: value.clone(),
                        fetched_at: Instant::now(),
                        stale,
                    },
                );
                Ok(value)
            }
            Err(err) => {
                warn!(
                    key = %key,
                    retained = state.entries.contains_key(&key),
                    "cache: loader failed: {err:#}"
                );
                Err(CacheError::Loader {
                    key,
                    cause: Arc::new(err),
                })
            }
        }
    }

    /// Marks `key` and everything that transitively depends on it stale.
    /// Returns the keys touched, in visit order.
    pub fn invalidate(&self, key: &CacheKey) -> Vec<CacheKey> {
        let invalidated = lock(&self.state).invalidate_from(vec![key.clone()], &mut BTreeSet::new());
        debug!(key = %key, count = invalidated.len(), "cache: invalidated");
        invalidated
    }

    /// Invalidates every known key that starts with `prefix`, plus dependents.
    pub fn invalidate_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        let mut state = lock(&self.state);
        let roots: BTreeSet<CacheKey> = state
            .entries
            .keys()
            .chain(state.inflight.keys())
            .chain(state.dependents.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        let invalidated = state.invalidate_from(roots.into_iter().collect(), &mut BTreeSet::new());
        drop(state);
        debug!(prefix = %prefix, count = invalidated.len(), "cache: invalidated by prefix");
        invalidated
    }

    /// Invalidating `source` will also invalidate `dependent`.
    pub fn add_dependent(&self, source: CacheKey, dependent: CacheKey) {
        lock(&self.state)
            .dependents
            .entry(source)
            .or_default()
            .insert(dependent);
    }

    /// The cached value regardless of freshness.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        lock(&self.state).entries.get(key).map(|stored| stored.value.clone())
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let state = lock(&self.state);
        let stored = state.entries.get(key)?;
        Some(CacheEntry {
            key: key.clone(),
            value: stored.value.clone(),
            fetched_at: stored.fetched_at,
            stale: !state.is_fresh(key, stored, self.default_stale_time, Instant::now()),
            dependents: state.dependents.get(key).cloned().unwrap_or_default(),
        })
    }

    pub fn is_loading(&self, key: &CacheKey) -> bool {
        lock(&self.state).inflight.contains_key(key)
    }

    /// Removes the entry. A load already in flight for it lands stale.
    pub fn evict(&self, key: &CacheKey) -> bool {
        let mut state = lock(&self.state);
        state.bump_generation(key);
        state.entries.remove(key).is_some()
    }

    /// Drops every entry, dependency edge and in-flight load. Loads still
    /// running complete for their callers but are not stored.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        let entries = state.entries.len();
        state.entries.clear();
        state.dependents.clear();
        state.inflight.clear();
        state.generations.clear();
        state.era += 1;
        debug!(entries, "cache: cleared");
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
