//! The per-key cache entity and its fetch state machine.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::{CacheEvent, CacheShared, QueryCache};
use crate::error::FetchError;
use crate::fetch::QueryData;
use crate::key::QueryKey;
use crate::observer::ObserverInner;
use crate::options::QueryOptions;

/// Whether usable data exists for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// No data has been produced yet.
    Pending,
    /// The last fetch failed terminally and no newer data exists.
    Error,
    /// Data is available.
    Success,
}

/// Current network activity for a query, orthogonal to [`QueryStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    /// No execution in flight.
    Idle,
    /// An execution is running.
    Fetching,
    /// An execution is parked, waiting for the client to come back online.
    Paused,
}

/// Why an `Updated` cache event was emitted, so subscribers can tell
/// success from error from invalidation without recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchAction {
    /// An execution started.
    Fetch,
    /// Data was written, by a fetch or directly.
    Success,
    /// A fetch attempt failed; the failure count moved.
    Failed,
    /// A fetch failed terminally.
    Error,
    /// The entry was marked stale by force.
    Invalidate,
    /// The in-flight execution parked while offline.
    Pause,
    /// The parked execution resumed.
    Continue,
}

/// Snapshot of a query's state machine.
#[derive(Clone)]
pub struct QueryState {
    /// Whether usable data exists.
    pub status: QueryStatus,
    /// Current network activity.
    pub fetch_status: FetchStatus,
    /// The cached value, if any.
    pub data: Option<QueryData>,
    /// The last terminal failure reason, if any.
    pub error: Option<Arc<anyhow::Error>>,
    /// When `data` was last written.
    pub data_updated_at: Option<Instant>,
    /// When `error` was last written.
    pub error_updated_at: Option<Instant>,
    /// Failed attempts of the current or last execution; reset on success.
    pub fetch_failure_count: u32,
    /// Whether the entry was forced stale.
    pub is_invalidated: bool,
}

impl QueryState {
    fn initial(initial_data: Option<QueryData>) -> Self {
        let has_data = initial_data.is_some();
        Self {
            status: if has_data {
                QueryStatus::Success
            } else {
                QueryStatus::Pending
            },
            fetch_status: FetchStatus::Idle,
            data_updated_at: has_data.then(Instant::now),
            data: initial_data,
            error: None,
            error_updated_at: None,
            fetch_failure_count: 0,
            is_invalidated: false,
        }
    }
}

impl fmt::Debug for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("fetch_failure_count", &self.fetch_failure_count)
            .field("is_invalidated", &self.is_invalidated)
            .finish()
    }
}

pub(crate) type FetchOutcome = Result<QueryData, FetchError>;

/// One in-flight fetch execution. Later fetch requests clone the outcome
/// receiver and join it instead of starting a second execution.
struct InFlight {
    outcome: watch::Receiver<Option<FetchOutcome>>,
    cancel: CancellationToken,
}

struct QueryInner {
    options: Arc<QueryOptions>,
    state: QueryState,
    observers: Vec<(u64, Weak<ObserverInner>)>,
    in_flight: Option<InFlight>,
    gc_timer: Option<JoinHandle<()>>,
    stale_timer: Option<JoinHandle<()>>,
}

/// A single cache entry: the cached value, fetch state machine, timers, and
/// the set of observers currently bound to it.
///
/// One `Query` exists per unique key hash; the cache owns its lifetime.
/// Observer back-references are weak; consumers own their observers.
pub struct Query {
    key: QueryKey,
    hash: String,
    cache: Weak<CacheShared>,
    inner: Mutex<QueryInner>,
}

impl Query {
    pub(crate) fn new(
        cache: Weak<CacheShared>,
        key: QueryKey,
        hash: String,
        options: Arc<QueryOptions>,
    ) -> Arc<Self> {
        let state = QueryState::initial(options.take_initial_data());
        Arc::new(Self {
            key,
            hash,
            cache,
            inner: Mutex::new(QueryInner {
                options,
                state,
                observers: Vec::new(),
                in_flight: None,
                gc_timer: None,
                stale_timer: None,
            }),
        })
    }

    /// The structured key this entry is stored under.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The canonical hash of the key; the cache's lookup key.
    pub fn hash_str(&self) -> &str {
        &self.hash
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> QueryState {
        self.inner.lock().state.clone()
    }

    /// The cached value, if any.
    pub fn data(&self) -> Option<QueryData> {
        self.inner.lock().state.data.clone()
    }

    /// The cached value downcast to `T`.
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data().and_then(|data| data.downcast::<T>().ok())
    }

    /// Current network activity.
    pub fn fetch_status(&self) -> FetchStatus {
        self.inner.lock().state.fetch_status
    }

    /// Number of live observers bound to this entry.
    pub fn observer_count(&self) -> usize {
        self.inner
            .lock()
            .observers
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    /// Whether at least one observer is bound.
    pub fn is_active(&self) -> bool {
        self.observer_count() > 0
    }

    pub(crate) fn options(&self) -> Arc<QueryOptions> {
        self.inner.lock().options.clone()
    }

    pub(crate) fn update_options(&self, options: &Arc<QueryOptions>) {
        let mut inner = self.inner.lock();
        inner.options = Arc::new(options.merged_over(&inner.options));
    }

    /// Whether the entry is stale for a consumer using `stale_time`,
    /// computed from the current time. Entries without data, and
    /// invalidated entries, are always stale.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let state = self.state();
        if state.is_invalidated || state.data.is_none() {
            return true;
        }
        let Some(updated_at) = state.data_updated_at else {
            return true;
        };
        match updated_at.checked_add(stale_time) {
            Some(deadline) => Instant::now() >= deadline,
            // Past the representable range: never stale.
            None => false,
        }
    }

    /// Cache-level staleness, as used by filters: with observers bound, any
    /// observer's currently-computed staleness decides; without observers,
    /// an entry holding data is fresh unless invalidated.
    pub fn is_stale(&self) -> bool {
        let observers = self.observers_snapshot();
        if observers.is_empty() {
            let state = self.state();
            state.is_invalidated || state.data.is_none()
        } else {
            observers.iter().any(|observer| observer.current_stale())
        }
    }

    /// Mark the entry stale regardless of its age.
    pub fn invalidate(self: &Arc<Self>) {
        let already = self.inner.lock().state.is_invalidated;
        if !already {
            self.dispatch(DispatchAction::Invalidate, |state| {
                state.is_invalidated = true;
            });
        }
    }

    /// Write `data` directly, bypassing any fetch. Transitions to success
    /// and emits an update, but runs no cache-level callbacks.
    pub fn set_data(self: &Arc<Self>, data: QueryData) {
        self.complete_success(data, false);
    }

    fn observers_snapshot(&self) -> Vec<Arc<ObserverInner>> {
        self.inner
            .lock()
            .observers
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub(crate) fn cache_handle(&self) -> Option<QueryCache> {
        self.cache.upgrade().map(QueryCache::from_shared)
    }

    /// Apply a state transition, then notify bound observers and finally the
    /// cache bus, in that order, inside one notification batch.
    fn dispatch(self: &Arc<Self>, action: DispatchAction, apply: impl FnOnce(&mut QueryState)) {
        {
            let mut inner = self.inner.lock();
            apply(&mut inner.state);
        }
        let observers = self.observers_snapshot();
        if let Some(cache) = self.cache_handle() {
            cache.batch(|| {
                for observer in &observers {
                    observer.on_query_update(self);
                }
                cache.emit(CacheEvent::Updated {
                    query: self.clone(),
                    action,
                });
            });
        }
    }

    /// Request a fetch. Starts an execution when none is in flight,
    /// otherwise joins the existing one; either way the returned future
    /// resolves with the shared outcome.
    ///
    /// The fetching transition and task spawn happen synchronously, before
    /// this returns; the future may be dropped without affecting the
    /// execution.
    pub(crate) fn fetch(
        self: &Arc<Self>,
        options: Arc<QueryOptions>,
    ) -> impl Future<Output = FetchOutcome> + Send + 'static {
        let rx = self.ensure_fetch(options);
        wait_for_outcome(rx)
    }

    fn ensure_fetch(
        self: &Arc<Self>,
        options: Arc<QueryOptions>,
    ) -> watch::Receiver<Option<FetchOutcome>> {
        let (tx, rx, cancel) = {
            let mut inner = self.inner.lock();
            if let Some(in_flight) = &inner.in_flight {
                return in_flight.outcome.clone();
            }
            inner.options = Arc::new(options.merged_over(&inner.options));
            let (tx, rx) = watch::channel::<Option<FetchOutcome>>(None);
            let cancel = CancellationToken::new();
            inner.in_flight = Some(InFlight {
                outcome: rx.clone(),
                cancel: cancel.clone(),
            });
            (tx, rx, cancel)
        };
        debug!(query = %self.hash, "starting fetch");
        self.dispatch(DispatchAction::Fetch, |state| {
            state.fetch_status = FetchStatus::Fetching;
        });
        tokio::spawn(run_fetch(self.clone(), self.options(), tx, cancel));
        rx
    }

    fn finish_fetch(
        self: &Arc<Self>,
        outcome: &FetchOutcome,
        outcome_tx: &watch::Sender<Option<FetchOutcome>>,
    ) {
        {
            self.inner.lock().in_flight = None;
        }
        match outcome {
            Ok(data) => self.complete_success(data.clone(), true),
            Err(FetchError::Rejected(error)) => self.complete_failure(error.clone()),
            Err(FetchError::Cancelled) => {
                // Cancelled because the entry was removed: it is no longer
                // in the cache to emit events against, so reset quietly.
                self.inner.lock().state.fetch_status = FetchStatus::Idle;
            }
        }
        outcome_tx.send_replace(Some(outcome.clone()));
        if !matches!(outcome, Err(FetchError::Cancelled)) && self.observer_count() == 0 {
            self.schedule_gc();
        }
    }

    fn complete_success(self: &Arc<Self>, data: QueryData, from_fetch: bool) {
        let stored = data.clone();
        self.dispatch(DispatchAction::Success, move |state| {
            state.status = QueryStatus::Success;
            state.data = Some(stored);
            state.error = None;
            state.data_updated_at = Some(Instant::now());
            state.fetch_status = FetchStatus::Idle;
            state.fetch_failure_count = 0;
            state.is_invalidated = false;
        });
        if from_fetch {
            if let Some(cache) = self.cache_handle() {
                cache.run_success_callbacks(&data, self);
            }
        }
        self.schedule_stale();
    }

    fn complete_failure(self: &Arc<Self>, error: Arc<anyhow::Error>) {
        debug!(query = %self.hash, %error, "fetch failed");
        let stored = error.clone();
        self.dispatch(DispatchAction::Error, move |state| {
            state.status = QueryStatus::Error;
            state.error = Some(stored);
            state.error_updated_at = Some(Instant::now());
            state.fetch_status = FetchStatus::Idle;
        });
        if let Some(cache) = self.cache_handle() {
            cache.run_error_callbacks(&error, self);
        }
    }

    /// Arm the stale timer for the stale time active now. A zero stale time
    /// means the entry is already stale and no timer is armed.
    fn schedule_stale(self: &Arc<Self>) {
        let stale_time = self.options().effective_stale_time();
        let deadline = if stale_time == Duration::ZERO {
            None
        } else {
            Instant::now().checked_add(stale_time)
        };
        let Some(deadline) = deadline else {
            if let Some(old) = self.inner.lock().stale_timer.take() {
                old.abort();
            }
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(query) = weak.upgrade() {
                query.on_stale();
            }
        });
        if let Some(old) = self.inner.lock().stale_timer.replace(handle) {
            old.abort();
        }
    }

    /// The stale timer fired: freshness flipped by time alone. Observers
    /// recompute their results; no state transition and no `Updated` event.
    fn on_stale(self: &Arc<Self>) {
        trace!(query = %self.hash, "entry became stale");
        let observers = self.observers_snapshot();
        if observers.is_empty() {
            return;
        }
        if let Some(cache) = self.cache_handle() {
            cache.batch(|| {
                for observer in &observers {
                    observer.on_query_update(self);
                }
            });
        }
    }

    /// Arm the removal timer. Called when the entry has no observers: at
    /// creation, when the last observer detaches, and when a fetch settles
    /// unobserved.
    pub(crate) fn schedule_gc(self: &Arc<Self>) {
        let gc_time = self.options().effective_gc_time();
        let Some(deadline) = Instant::now().checked_add(gc_time) else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(query) = weak.upgrade() {
                query.try_reclaim();
            }
        });
        if let Some(old) = self.inner.lock().gc_timer.replace(handle) {
            old.abort();
        }
    }

    fn try_reclaim(self: &Arc<Self>) {
        let idle = {
            let inner = self.inner.lock();
            inner.in_flight.is_none()
                && inner
                    .observers
                    .iter()
                    .all(|(_, weak)| weak.strong_count() == 0)
        };
        if !idle {
            return;
        }
        if let Some(cache) = self.cache_handle() {
            debug!(query = %self.hash, "garbage collecting unobserved entry");
            cache.remove(self);
        }
    }

    pub(crate) fn add_observer(self: &Arc<Self>, observer: &Arc<ObserverInner>) {
        {
            let mut inner = self.inner.lock();
            inner.observers.retain(|(_, weak)| weak.strong_count() > 0);
            inner.observers.push((observer.id(), Arc::downgrade(observer)));
            if let Some(timer) = inner.gc_timer.take() {
                timer.abort();
            }
        }
        if let Some(cache) = self.cache_handle() {
            cache.emit(CacheEvent::ObserverAdded {
                query: self.clone(),
            });
        }
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, observer_id: u64) {
        let became_empty = {
            let mut inner = self.inner.lock();
            inner
                .observers
                .retain(|(id, weak)| *id != observer_id && weak.strong_count() > 0);
            inner.observers.is_empty()
        };
        if let Some(cache) = self.cache_handle() {
            cache.emit(CacheEvent::ObserverRemoved {
                query: self.clone(),
            });
        }
        if became_empty {
            self.schedule_gc();
        }
    }

    /// Cancel timers and any in-flight execution. Called on removal from
    /// the cache; joined waiters observe [`FetchError::Cancelled`].
    pub(crate) fn destroy(&self) {
        let (gc_timer, stale_timer, in_flight) = {
            let mut inner = self.inner.lock();
            (
                inner.gc_timer.take(),
                inner.stale_timer.take(),
                inner.in_flight.take(),
            )
        };
        if let Some(timer) = gc_timer {
            timer.abort();
        }
        if let Some(timer) = stale_timer {
            timer.abort();
        }
        if let Some(in_flight) = in_flight {
            in_flight.cancel.cancel();
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

async fn wait_for_outcome(mut rx: watch::Receiver<Option<FetchOutcome>>) -> FetchOutcome {
    match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => (*outcome).clone().unwrap_or(Err(FetchError::Cancelled)),
        Err(_) => Err(FetchError::Cancelled),
    }
}

async fn run_fetch(
    query: Arc<Query>,
    options: Arc<QueryOptions>,
    outcome_tx: watch::Sender<Option<FetchOutcome>>,
    cancel: CancellationToken,
) {
    let outcome = execute(&query, &options, &cancel).await;
    query.finish_fetch(&outcome, &outcome_tx);
}

/// One execution: pause gate, then attempt/retry until a terminal outcome
/// or cancellation.
async fn execute(
    query: &Arc<Query>,
    options: &Arc<QueryOptions>,
    cancel: &CancellationToken,
) -> FetchOutcome {
    let Some(fetcher) = options.fetcher_fn() else {
        return Err(FetchError::Rejected(Arc::new(anyhow::anyhow!(
            "no fetch function configured for query {}",
            query.hash_str()
        ))));
    };
    let retry = options.retry_policy();
    loop {
        wait_until_online(query, cancel).await?;
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = fetcher.fetch() => result,
        };
        match attempt {
            Ok(data) => return Ok(data),
            Err(error) => {
                let error = Arc::new(error);
                query.dispatch(DispatchAction::Failed, |state| {
                    state.fetch_failure_count += 1;
                });
                let failures = query.state().fetch_failure_count;
                match retry.retry_after(failures, &error) {
                    Some(delay) => {
                        trace!(query = %query.hash_str(), failures, ?delay, "retrying fetch");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => return Err(FetchError::Rejected(error)),
                }
            }
        }
    }
}

/// Park the execution while the client is offline. The paused state is
/// observable through the usual update events.
async fn wait_until_online(
    query: &Arc<Query>,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let Some(cache) = query.cache_handle() else {
        return Ok(());
    };
    let mut online = cache.online_receiver();
    if *online.borrow() {
        return Ok(());
    }
    debug!(query = %query.hash_str(), "fetch paused while offline");
    query.dispatch(DispatchAction::Pause, |state| {
        state.fetch_status = FetchStatus::Paused;
    });
    tokio::select! {
        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        resumed = online.wait_for(|is_online| *is_online) => {
            if resumed.is_err() {
                return Err(FetchError::Cancelled);
            }
        }
    }
    query.dispatch(DispatchAction::Continue, |state| {
        state.fetch_status = FetchStatus::Fetching;
    });
    Ok(())
}
