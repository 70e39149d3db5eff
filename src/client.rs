//! Client-facing entry points over a cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};

use crate::cache::{QueryCache, QueryFilter};
use crate::error::FetchError;
use crate::fetch::QueryData;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::query::QueryState;
use crate::retry::{NoRetry, RetryPolicy};

/// Default retention period for unobserved entries.
pub(crate) const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Client-level defaults merged into every [`QueryOptions`] whose knobs are
/// unset.
#[derive(Clone)]
pub struct DefaultOptions {
    /// Default freshness window. Zero: immediately stale.
    pub stale_time: Duration,
    /// Default retention period for unobserved entries.
    pub gc_time: Duration,
    /// Default retry policy.
    pub retry: Arc<dyn RetryPolicy>,
}

impl Default for DefaultOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: DEFAULT_GC_TIME,
            retry: Arc::new(NoRetry),
        }
    }
}

/// Builder for [`QueryClient`].
#[derive(Default)]
pub struct QueryClientBuilder {
    cache: Option<QueryCache>,
    defaults: DefaultOptions,
}

impl QueryClientBuilder {
    /// Use `cache` instead of a fresh one.
    pub fn query_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Default freshness window for queries that set none.
    pub fn default_stale_time(mut self, stale_time: Duration) -> Self {
        self.defaults.stale_time = stale_time;
        self
    }

    /// Default retention period for queries that set none.
    pub fn default_gc_time(mut self, gc_time: Duration) -> Self {
        self.defaults.gc_time = gc_time;
        self
    }

    /// Default retry policy for queries that set none.
    pub fn default_retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.defaults.retry = Arc::new(policy);
        self
    }

    /// Build the client.
    pub fn build(self) -> QueryClient {
        QueryClient {
            shared: Arc::new(ClientShared {
                cache: self.cache.unwrap_or_default(),
                defaults: self.defaults,
            }),
        }
    }
}

struct ClientShared {
    cache: QueryCache,
    defaults: DefaultOptions,
}

/// The consumer-facing handle over a cache: fetching, direct writes,
/// invalidation, and removal.
///
/// Cheap to clone. Fetch executions and timers run on the ambient tokio
/// runtime, so a runtime context must be active when fetching is triggered.
#[derive(Clone)]
pub struct QueryClient {
    shared: Arc<ClientShared>,
}

impl QueryClient {
    /// A client over a fresh cache with default options.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder to customize the cache and defaults.
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// The underlying cache.
    pub fn cache(&self) -> &QueryCache {
        &self.shared.cache
    }

    /// Run `f` inside a notification batch; see [`QueryCache::batch`].
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.cache().batch(f)
    }

    pub(crate) fn defaulted_options(&self, mut options: QueryOptions) -> QueryOptions {
        let defaults = &self.shared.defaults;
        options.fill_defaults(
            defaults.stale_time,
            defaults.gc_time,
            defaults.retry.clone(),
        );
        options
    }

    /// Warm the cache for a key: builds the entry and fetches if it is
    /// stale or missing. The entry build and fetch start happen
    /// synchronously; the returned future resolves when the fetch settles
    /// and swallows its outcome, and may be dropped freely.
    pub fn prefetch_query(&self, options: QueryOptions) -> impl Future<Output = ()> + Send + 'static {
        let outcome = self.fetch_inner(options);
        async move {
            let _ = outcome.await;
        }
    }

    /// Fetch a key's data, deduplicating against any in-flight execution,
    /// and resolve with the cached value when the entry is fresh.
    pub fn fetch_query(
        &self,
        options: QueryOptions,
    ) -> impl Future<Output = Result<QueryData, FetchError>> + Send + 'static {
        self.fetch_inner(options)
    }

    fn fetch_inner(&self, options: QueryOptions) -> BoxFuture<'static, Result<QueryData, FetchError>> {
        let options = Arc::new(self.defaulted_options(options));
        let query = self.cache().build_defaulted(options.clone());
        if !query.is_stale_by_time(options.effective_stale_time()) {
            if let Some(data) = query.data() {
                return future::ready(Ok(data)).boxed();
            }
        }
        query.fetch(options).boxed()
    }

    /// The cached data for `key`, downcast to `T`.
    pub fn get_query_data<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<Arc<T>> {
        self.cache()
            .get(&key.hash_str())
            .and_then(|query| query.data_as::<T>())
    }

    /// The state snapshot of the entry for `key`, if present.
    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.cache().get(&key.hash_str()).map(|query| query.state())
    }

    /// Write `value` for `key` directly, bypassing any fetch. Creates the
    /// entry if absent; emits the same update events a successful fetch
    /// would.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: QueryKey, value: T) {
        let options = Arc::new(self.defaulted_options(QueryOptions::new(key)));
        let query = self.cache().build_defaulted(options);
        query.set_data(Arc::new(value) as QueryData);
    }

    /// Force every matching entry stale and refetch the active ones.
    /// Key matching defaults to prefix semantics, like
    /// [`QueryCache::find_all`].
    pub fn invalidate_queries(&self, filter: QueryFilter) {
        let queries = self.cache().find_all(filter);
        self.batch(|| {
            for query in queries {
                query.invalidate();
                if query.is_active() {
                    let options = query.options();
                    let _ = query.fetch(options);
                }
            }
        });
    }

    /// Remove every matching entry from the cache.
    pub fn remove_queries(&self, filter: QueryFilter) {
        for query in self.cache().find_all(filter) {
            self.cache().remove(&query);
        }
    }

    /// Remove every entry; see [`QueryCache::clear`].
    pub fn clear(&self) {
        self.cache().clear();
    }

    /// Flip the online flag gating fetch executions; see
    /// [`QueryCache::set_online`].
    pub fn set_online(&self, online: bool) {
        self.cache().set_online(online);
    }

    /// Current value of the online flag.
    pub fn is_online(&self) -> bool {
        self.cache().is_online()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}
