//! The registry of all cache entries and its event bus.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::watch;
use tracing::debug;

use crate::client::QueryClient;
use crate::fetch::QueryData;
use crate::key::QueryKey;
use crate::notify::NotifyManager;
use crate::options::QueryOptions;
use crate::query::{DispatchAction, FetchStatus, Query};

/// Callback invoked once per successful terminal fetch outcome.
pub type SuccessCallback = Arc<dyn Fn(&QueryData, &Arc<Query>) + Send + Sync>;
/// Callback invoked once per failed terminal fetch outcome.
pub type ErrorCallback = Arc<dyn Fn(&Arc<anyhow::Error>, &Arc<Query>) + Send + Sync>;
/// Callback invoked once per terminal fetch outcome, success or failure.
pub type SettledCallback =
    Arc<dyn Fn(Option<&QueryData>, Option<&Arc<anyhow::Error>>, &Arc<Query>) + Send + Sync>;
/// Caller-supplied predicate composed into a [`QueryFilter`].
pub type QueryPredicate = Arc<dyn Fn(&Arc<Query>) -> bool + Send + Sync>;

pub(crate) type CacheListener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Every mutation of cache contents or derived observer results emits one
/// of these on the cache bus. This is the sole notification surface
/// external adapter code depends on.
#[derive(Clone)]
pub enum CacheEvent {
    /// A new entry was registered.
    Added {
        /// The entry that was added.
        query: Arc<Query>,
    },
    /// An entry was deregistered.
    Removed {
        /// The entry that was removed.
        query: Arc<Query>,
    },
    /// An entry's state machine transitioned.
    Updated {
        /// The entry that changed.
        query: Arc<Query>,
        /// Which transition happened.
        action: DispatchAction,
    },
    /// An observer attached to an entry.
    ObserverAdded {
        /// The entry observed.
        query: Arc<Query>,
    },
    /// An observer detached from an entry.
    ObserverRemoved {
        /// The entry that was observed.
        query: Arc<Query>,
    },
    /// An observer's derived result changed.
    ObserverResultsUpdated {
        /// The entry whose observer recomputed.
        query: Arc<Query>,
    },
}

impl CacheEvent {
    /// The entry this event concerns.
    pub fn query(&self) -> &Arc<Query> {
        match self {
            CacheEvent::Added { query }
            | CacheEvent::Removed { query }
            | CacheEvent::Updated { query, .. }
            | CacheEvent::ObserverAdded { query }
            | CacheEvent::ObserverRemoved { query }
            | CacheEvent::ObserverResultsUpdated { query } => query,
        }
    }

    /// The event's discriminant, for recording and matching.
    pub fn kind(&self) -> CacheEventKind {
        match self {
            CacheEvent::Added { .. } => CacheEventKind::Added,
            CacheEvent::Removed { .. } => CacheEventKind::Removed,
            CacheEvent::Updated { .. } => CacheEventKind::Updated,
            CacheEvent::ObserverAdded { .. } => CacheEventKind::ObserverAdded,
            CacheEvent::ObserverRemoved { .. } => CacheEventKind::ObserverRemoved,
            CacheEvent::ObserverResultsUpdated { .. } => CacheEventKind::ObserverResultsUpdated,
        }
    }
}

/// Discriminant of a [`CacheEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    /// See [`CacheEvent::Added`].
    Added,
    /// See [`CacheEvent::Removed`].
    Removed,
    /// See [`CacheEvent::Updated`].
    Updated,
    /// See [`CacheEvent::ObserverAdded`].
    ObserverAdded,
    /// See [`CacheEvent::ObserverRemoved`].
    ObserverRemoved,
    /// See [`CacheEvent::ObserverResultsUpdated`].
    ObserverResultsUpdated,
}

/// Which entries a filter selects based on observer presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTypeFilter {
    /// Entries with at least one observer.
    Active,
    /// Entries with no observers.
    Inactive,
    /// Every entry.
    #[default]
    All,
}

/// Filter accepted by [`QueryCache::find`] and [`QueryCache::find_all`].
/// All set fields must match (AND semantics); an empty filter matches
/// every entry.
#[derive(Clone, Default)]
pub struct QueryFilter {
    query_key: Option<QueryKey>,
    exact: Option<bool>,
    query_type: QueryTypeFilter,
    stale: Option<bool>,
    fetch_status: Option<FetchStatus>,
    predicate: Option<QueryPredicate>,
}

impl QueryFilter {
    /// An empty filter, matching every entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match against a structured key. Whether the match is exact or a
    /// prefix depends on [`QueryFilter::exact`] and the lookup's default.
    pub fn key(mut self, key: QueryKey) -> Self {
        self.query_key = Some(key);
        self
    }

    /// Force exact (or prefix) key matching regardless of the lookup's
    /// default.
    pub fn exact(mut self, exact: bool) -> Self {
        self.exact = Some(exact);
        self
    }

    /// Restrict by observer presence.
    pub fn query_type(mut self, query_type: QueryTypeFilter) -> Self {
        self.query_type = query_type;
        self
    }

    /// Restrict by the entry's current computed freshness.
    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Restrict by exact fetch status. Leaving this unset means "don't
    /// filter on fetch status", which is distinct from filtering for idle.
    pub fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    /// Restrict by an arbitrary predicate, ANDed with the other fields.
    pub fn predicate(
        mut self,
        predicate: impl Fn(&Arc<Query>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn matches(&self, query: &Arc<Query>, default_exact: bool) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact.unwrap_or(default_exact) {
                if key.hash_str() != query.hash_str() {
                    return false;
                }
            } else if !key.partial_match(query.key()) {
                return false;
            }
        }
        match self.query_type {
            QueryTypeFilter::Active if !query.is_active() => return false,
            QueryTypeFilter::Inactive if query.is_active() => return false,
            _ => {}
        }
        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(fetch_status) = self.fetch_status {
            if query.fetch_status() != fetch_status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(query) {
                return false;
            }
        }
        true
    }
}

/// Cache-level callbacks fired on terminal fetch outcomes.
///
/// Each terminal outcome fires exactly one `on_error` + `on_settled` (or
/// `on_success` + `on_settled`) pair, never duplicated across retries.
/// Errors raised by the callbacks propagate to the dispatching context;
/// the state transition has already completed by the time they run.
#[derive(Clone, Default)]
pub struct CacheConfig {
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    on_settled: Option<SettledCallback>,
}

impl CacheConfig {
    /// Empty config with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per successful terminal fetch outcome.
    pub fn on_success(mut self, f: impl Fn(&QueryData, &Arc<Query>) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called once per failed terminal fetch outcome.
    pub fn on_error(
        mut self,
        f: impl Fn(&Arc<anyhow::Error>, &Arc<Query>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called once per terminal fetch outcome, after the success or error
    /// callback.
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&QueryData>, Option<&Arc<anyhow::Error>>, &Arc<Query>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

struct CacheInner {
    queries: HashMap<String, Arc<Query>, ahash::RandomState>,
    /// Insertion order, for deterministic iteration.
    order: Vec<Arc<Query>>,
}

pub(crate) struct CacheShared {
    inner: Mutex<CacheInner>,
    listeners: Mutex<Slab<CacheListener>>,
    config: CacheConfig,
    notify: Arc<NotifyManager>,
    online_tx: watch::Sender<bool>,
}

/// The registry of all cache entries.
///
/// Cheap to clone; all state is behind `Arc`. The cache owns entry
/// lifetimes; entries hold weak references back to it. Explicitly
/// constructed, never a process-wide singleton: independent caches
/// coexist freely.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

impl QueryCache {
    /// An empty cache with no callbacks configured.
    pub fn new() -> Self {
        Self::with_config(CacheConfig::new())
    }

    /// An empty cache with terminal-outcome callbacks.
    pub fn with_config(config: CacheConfig) -> Self {
        let (online_tx, _) = watch::channel(true);
        Self {
            shared: Arc::new(CacheShared {
                inner: Mutex::new(CacheInner {
                    queries: HashMap::with_hasher(ahash::RandomState::new()),
                    order: Vec::new(),
                }),
                listeners: Mutex::new(Slab::new()),
                config,
                notify: Arc::new(NotifyManager::new()),
                online_tx,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<CacheShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<CacheShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn notify_manager(&self) -> &Arc<NotifyManager> {
        &self.shared.notify
    }

    /// Run `f` inside a notification batch: consumer callbacks triggered by
    /// mutations within `f` are delivered once when the outermost batch
    /// exits.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.notify.batch(f)
    }

    /// Look up an entry by its canonical key hash.
    pub fn get(&self, hash: &str) -> Option<Arc<Query>> {
        self.shared.inner.lock().queries.get(hash).cloned()
    }

    /// Every entry, in insertion order.
    pub fn get_all(&self) -> Vec<Arc<Query>> {
        self.shared.inner.lock().order.clone()
    }

    /// Get or create the entry for the options' key. Idempotent: building
    /// twice with the same key never creates two entries. New entries emit
    /// `Added`.
    pub fn build(&self, client: &QueryClient, options: QueryOptions) -> Arc<Query> {
        self.build_defaulted(Arc::new(client.defaulted_options(options)))
    }

    pub(crate) fn build_defaulted(&self, options: Arc<QueryOptions>) -> Arc<Query> {
        let hash = options.key().hash_str();
        let (query, created) = {
            let mut inner = self.shared.inner.lock();
            if let Some(existing) = inner.queries.get(&hash) {
                (existing.clone(), false)
            } else {
                let query = Query::new(
                    self.downgrade(),
                    options.key().clone(),
                    hash.clone(),
                    options.clone(),
                );
                inner.queries.insert(hash.clone(), query.clone());
                inner.order.push(query.clone());
                (query, true)
            }
        };
        if created {
            debug!(query = %hash, "new cache entry");
            self.emit(CacheEvent::Added {
                query: query.clone(),
            });
            query.schedule_gc();
        } else {
            query.update_options(&options);
        }
        query
    }

    /// Register a pre-existing entry. A no-op when an entry with the same
    /// hash is already tracked: re-registration never creates a second copy
    /// nor changes the cache's count.
    pub fn add(&self, query: Arc<Query>) {
        let added = {
            let mut inner = self.shared.inner.lock();
            if inner.queries.contains_key(query.hash_str()) {
                false
            } else {
                inner
                    .queries
                    .insert(query.hash_str().to_owned(), query.clone());
                inner.order.push(query.clone());
                true
            }
        };
        if added {
            self.emit(CacheEvent::Added {
                query: query.clone(),
            });
            if query.observer_count() == 0 {
                query.schedule_gc();
            }
        }
    }

    /// Deregister an entry, cancelling its timers and any in-flight
    /// execution, and emit `Removed`. A no-op when the entry is not (or no
    /// longer) tracked.
    pub fn remove(&self, query: &Arc<Query>) {
        let removed = {
            let mut inner = self.shared.inner.lock();
            match inner.queries.get(query.hash_str()) {
                Some(existing) if Arc::ptr_eq(existing, query) => {
                    inner.queries.remove(query.hash_str());
                    inner.order.retain(|q| !Arc::ptr_eq(q, query));
                    true
                }
                _ => false,
            }
        };
        if removed {
            query.destroy();
            self.emit(CacheEvent::Removed {
                query: query.clone(),
            });
        }
    }

    /// Remove every entry and cancel every pending timer and execution.
    /// Bulk teardown: no individual `Removed` events are emitted.
    pub fn clear(&self) {
        let drained = {
            let mut inner = self.shared.inner.lock();
            inner.queries.clear();
            std::mem::take(&mut inner.order)
        };
        for query in &drained {
            query.destroy();
        }
    }

    /// First entry matching `filter`, in insertion order. An unset `exact`
    /// defaults to exact matching here.
    pub fn find(&self, filter: QueryFilter) -> Option<Arc<Query>> {
        self.get_all()
            .into_iter()
            .find(|query| filter.matches(query, true))
    }

    /// All entries matching `filter`, in insertion order. An unset `exact`
    /// defaults to prefix matching here.
    pub fn find_all(&self, filter: QueryFilter) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|query| filter.matches(query, false))
            .collect()
    }

    /// Register a cache-wide listener receiving every emitted event.
    /// Dropping the returned subscription unsubscribes it.
    pub fn subscribe(
        &self,
        listener: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> CacheSubscription {
        let key = self.shared.listeners.lock().insert(Arc::new(listener));
        CacheSubscription {
            shared: Arc::downgrade(&self.shared),
            key,
        }
    }

    /// Deliver `event` to every listener, synchronously, inside a
    /// notification batch.
    pub(crate) fn emit(&self, event: CacheEvent) {
        let listeners: Vec<CacheListener> = self
            .shared
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        self.shared.notify.batch(|| {
            for listener in &listeners {
                listener(&event);
            }
        });
    }

    /// Flip the online flag gating fetch executions. While offline,
    /// executions park with `fetch_status = Paused` and resume when the
    /// flag comes back up.
    pub fn set_online(&self, online: bool) {
        self.shared.online_tx.send_replace(online);
    }

    /// Current value of the online flag.
    pub fn is_online(&self) -> bool {
        *self.shared.online_tx.borrow()
    }

    pub(crate) fn online_receiver(&self) -> watch::Receiver<bool> {
        self.shared.online_tx.subscribe()
    }

    pub(crate) fn run_success_callbacks(&self, data: &QueryData, query: &Arc<Query>) {
        if let Some(on_success) = &self.shared.config.on_success {
            on_success(data, query);
        }
        if let Some(on_settled) = &self.shared.config.on_settled {
            on_settled(Some(data), None, query);
        }
    }

    pub(crate) fn run_error_callbacks(&self, error: &Arc<anyhow::Error>, query: &Arc<Query>) {
        if let Some(on_error) = &self.shared.config.on_error {
            on_error(error, query);
        }
        if let Some(on_settled) = &self.shared.config.on_settled {
            on_settled(None, Some(error), query);
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a cache listener registered; dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct CacheSubscription {
    shared: Weak<CacheShared>,
    key: usize,
}

impl CacheSubscription {
    /// Unsubscribe explicitly.
    pub fn unsubscribe(self) {}
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let _ = shared.listeners.lock().try_remove(self.key);
        }
    }
}
