//! Reactive per-consumer view over one cache entry.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tokio::time::Instant;

use crate::cache::CacheEvent;
use crate::client::QueryClient;
use crate::fetch::QueryData;
use crate::options::QueryOptions;
use crate::query::{FetchStatus, Query, QueryStatus};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(0);

type ObserverListener = Arc<dyn Fn(&QueryObserverResult) + Send + Sync>;

/// The consumer-facing result an observer derives from its query.
#[derive(Clone)]
pub struct QueryObserverResult {
    /// Whether usable data exists.
    pub status: QueryStatus,
    /// Current network activity.
    pub fetch_status: FetchStatus,
    /// The derived data, after any `select` transform.
    pub data: Option<QueryData>,
    /// The last terminal failure reason, if any.
    pub error: Option<Arc<anyhow::Error>>,
    /// Whether the entry is stale for this observer's stale time.
    pub is_stale: bool,
    /// When the underlying data was last written.
    pub data_updated_at: Option<Instant>,
    /// Failed attempts of the current or last execution.
    pub fetch_failure_count: u32,
}

impl QueryObserverResult {
    fn pending() -> Self {
        Self {
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            data: None,
            error: None,
            is_stale: true,
            data_updated_at: None,
            fetch_failure_count: 0,
        }
    }

    /// The derived data downcast to `T`.
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data
            .clone()
            .and_then(|data| data.downcast::<T>().ok())
    }

    /// Whether data is available.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// Whether the last fetch failed terminally.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// Whether no data has been produced yet.
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Whether an execution is currently running or paused.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status != FetchStatus::Idle
    }

    /// Structural comparison used to decide whether listeners must be
    /// re-notified. Data and error compare by identity: a fetch producing
    /// a new value is a change even if it is structurally equal.
    fn same_as(&self, other: &Self) -> bool {
        self.status == other.status
            && self.fetch_status == other.fetch_status
            && self.is_stale == other.is_stale
            && self.fetch_failure_count == other.fetch_failure_count
            && self.data_updated_at == other.data_updated_at
            && option_ptr_eq(&self.data, &other.data)
            && option_ptr_eq(&self.error, &other.error)
    }
}

impl fmt::Debug for QueryObserverResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverResult")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("is_stale", &self.is_stale)
            .finish()
    }
}

fn option_ptr_eq<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

struct ObserverState {
    options: Arc<QueryOptions>,
    query: Arc<Query>,
    result: QueryObserverResult,
    /// Last (input, derived) pair of the select transform, keyed by input
    /// identity, so recomputation does not fabricate a new result.
    select_memo: Option<(QueryData, QueryData)>,
    listeners: Slab<ObserverListener>,
}

impl ObserverState {
    /// Recompute the derived result from the bound query. Returns whether
    /// it changed.
    fn refresh(&mut self) -> bool {
        let query = self.query.clone();
        let state = query.state();
        let data = match (self.options.select_fn(), state.data.clone()) {
            (Some(select), Some(input)) => {
                let memoized = self
                    .select_memo
                    .as_ref()
                    .filter(|(raw, _)| Arc::ptr_eq(raw, &input))
                    .map(|(_, derived)| derived.clone());
                Some(match memoized {
                    Some(derived) => derived,
                    None => {
                        let derived = select(&input);
                        self.select_memo = Some((input, derived.clone()));
                        derived
                    }
                })
            }
            (None, data) => data,
            (Some(_), None) => None,
        };
        let result = QueryObserverResult {
            status: state.status,
            fetch_status: state.fetch_status,
            data,
            error: state.error.clone(),
            is_stale: query.is_stale_by_time(self.options.effective_stale_time()),
            data_updated_at: state.data_updated_at,
            fetch_failure_count: state.fetch_failure_count,
        };
        if result.same_as(&self.result) {
            false
        } else {
            self.result = result;
            true
        }
    }
}

pub(crate) struct ObserverInner {
    id: u64,
    client: QueryClient,
    state: Mutex<ObserverState>,
}

impl ObserverInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Recompute after any update of the bound query; notify listeners and
    /// the cache bus only when the derived result actually changed.
    pub(crate) fn on_query_update(self: &Arc<Self>, query: &Arc<Query>) {
        let (changed, result, listeners) = {
            let mut state = self.state.lock();
            if !Arc::ptr_eq(&state.query, query) {
                // A late notification from a query this observer has since
                // been re-pointed away from.
                return;
            }
            let changed = state.refresh();
            let listeners: Vec<ObserverListener> = if changed {
                state
                    .listeners
                    .iter()
                    .map(|(_, listener)| listener.clone())
                    .collect()
            } else {
                Vec::new()
            };
            (changed, state.result.clone(), listeners)
        };
        if !changed {
            return;
        }
        let notify = self.client.cache().notify_manager().clone();
        for listener in listeners {
            let result = result.clone();
            notify.notify(move || listener(&result));
        }
        self.client.cache().emit(CacheEvent::ObserverResultsUpdated {
            query: query.clone(),
        });
    }

    /// This observer's staleness computed from the current time.
    pub(crate) fn current_stale(&self) -> bool {
        let (query, stale_time) = {
            let state = self.state.lock();
            (state.query.clone(), state.options.effective_stale_time())
        };
        query.is_stale_by_time(stale_time)
    }
}

/// Binds a consumer's options to one cache entry at a time and derives the
/// consumer-facing result from it.
///
/// The observer is owned by the consumer, never by the cache. Subscribing
/// the first listener attaches it to its query (creating the entry if
/// absent) and fetches if the entry is stale or missing; dropping the last
/// subscription detaches it, which may start the entry's retention timer.
pub struct QueryObserver {
    inner: Arc<ObserverInner>,
}

impl QueryObserver {
    /// Create an observer for `options`, resolving or creating the cache
    /// entry and publishing an initial synchronous result snapshot.
    pub fn new(client: &QueryClient, options: QueryOptions) -> Self {
        let options = Arc::new(client.defaulted_options(options));
        let query = client.cache().build_defaulted(options.clone());
        let mut state = ObserverState {
            options,
            query: query.clone(),
            result: QueryObserverResult::pending(),
            select_memo: None,
            listeners: Slab::new(),
        };
        state.refresh();
        let inner = Arc::new(ObserverInner {
            id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
            client: client.clone(),
            state: Mutex::new(state),
        });
        client
            .cache()
            .emit(CacheEvent::ObserverResultsUpdated { query });
        Self { inner }
    }

    /// The current derived result, available synchronously at any time.
    pub fn current_result(&self) -> QueryObserverResult {
        self.inner.state.lock().result.clone()
    }

    /// The cache entry this observer is currently bound to.
    pub fn query(&self) -> Arc<Query> {
        self.inner.state.lock().query.clone()
    }

    /// Register a listener. The first listener attaches the observer to its
    /// query and triggers an initial fetch if the entry is stale or missing
    /// and fetching is enabled. Dropping the subscription unsubscribes; the
    /// last one detaches the observer from the query.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult) + Send + Sync + 'static,
    ) -> ObserverSubscription {
        let (first, key) = {
            let mut state = self.inner.state.lock();
            let first = state.listeners.is_empty();
            (first, state.listeners.insert(Arc::new(listener)))
        };
        if first {
            attach(&self.inner);
        }
        ObserverSubscription {
            inner: Arc::downgrade(&self.inner),
            key,
        }
    }

    /// Replace the observer's options. When the key changes, the observer
    /// detaches from the old query strictly before attaching to the new
    /// one; it is never bound to two queries at once.
    pub fn set_options(&self, options: QueryOptions) {
        set_options(&self.inner, options);
    }

    /// Request a fetch of the bound query, joining any in-flight execution.
    pub fn refetch(&self) {
        execute_fetch(&self.inner);
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        let (attached, query) = {
            let state = self.inner.state.lock();
            (!state.listeners.is_empty(), state.query.clone())
        };
        if attached {
            query.remove_observer(self.inner.id);
        }
    }
}

fn attach(inner: &Arc<ObserverInner>) {
    let (query, options) = {
        let state = inner.state.lock();
        (state.query.clone(), state.options.clone())
    };
    query.add_observer(inner);
    if options.is_enabled() && query.is_stale_by_time(options.effective_stale_time()) {
        execute_fetch(inner);
    }
}

fn execute_fetch(inner: &Arc<ObserverInner>) {
    let (query, options) = {
        let state = inner.state.lock();
        (state.query.clone(), state.options.clone())
    };
    if !options.is_enabled() {
        return;
    }
    // The outcome is observed through update events; the execution does not
    // depend on this future being polled.
    let _ = query.fetch(options);
}

fn set_options(inner: &Arc<ObserverInner>, options: QueryOptions) {
    let options = Arc::new(inner.client.defaulted_options(options));
    let (old_query, attached) = {
        let state = inner.state.lock();
        (state.query.clone(), !state.listeners.is_empty())
    };
    if options.key().hash_str() == old_query.hash_str() {
        {
            let mut state = inner.state.lock();
            state.options = options.clone();
        }
        old_query.update_options(&options);
        inner.on_query_update(&old_query);
        return;
    }
    let new_query = inner.client.cache().build_defaulted(options.clone());
    if attached {
        // Detach before attach; never bound to two queries concurrently.
        old_query.remove_observer(inner.id);
    }
    {
        let mut state = inner.state.lock();
        state.options = options.clone();
        state.query = new_query.clone();
        state.select_memo = None;
    }
    if attached {
        new_query.add_observer(inner);
        if options.is_enabled() && new_query.is_stale_by_time(options.effective_stale_time()) {
            execute_fetch(inner);
        }
    }
    inner.on_query_update(&new_query);
}

/// Keeps an observer listener registered; dropping it unsubscribes, and
/// dropping the last one detaches the observer from its query.
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct ObserverSubscription {
    inner: Weak<ObserverInner>,
    key: usize,
}

impl ObserverSubscription {
    /// Unsubscribe explicitly.
    pub fn unsubscribe(self) {}
}

impl Drop for ObserverSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let (emptied, query) = {
            let mut state = inner.state.lock();
            let _ = state.listeners.try_remove(self.key);
            (state.listeners.is_empty(), state.query.clone())
        };
        if emptied {
            query.remove_observer(inner.id);
        }
    }
}
