//! Per-query configuration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::fetch::{fetcher, Fetcher, QueryData};
use crate::key::QueryKey;
use crate::retry::{NoRetry, RetryPolicy};

/// Transform applied to cached data before it reaches an observer's result.
pub type SelectFn = Arc<dyn Fn(&QueryData) -> QueryData + Send + Sync>;

/// Options describing one logical query: its key, how to fetch it, and the
/// freshness/retention knobs.
///
/// Unset knobs fall back to the client's defaults when the options are used
/// through a [`crate::QueryClient`] or [`crate::QueryObserver`].
#[derive(Clone)]
pub struct QueryOptions {
    key: QueryKey,
    fetcher: Option<Arc<dyn Fetcher>>,
    stale_time: Option<Duration>,
    gc_time: Option<Duration>,
    retry: Option<Arc<dyn RetryPolicy>>,
    initial_data: Option<QueryData>,
    enabled: bool,
    select: Option<SelectFn>,
}

impl QueryOptions {
    /// Options for `key` with every knob unset and fetching enabled.
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            fetcher: None,
            stale_time: None,
            gc_time: None,
            retry: None,
            initial_data: None,
            enabled: true,
            select: None,
        }
    }

    /// Use `fetcher` to load this query's data.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Use an async closure to load this query's data.
    pub fn fetch_with<T, Fut, F>(self, f: F) -> Self
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
    {
        self.fetcher(fetcher(f))
    }

    /// How long a successful result stays fresh. Zero means immediately
    /// stale.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Retention period for the entry once it has no observers.
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Retry policy consulted after each failed fetch attempt.
    pub fn retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    /// Seed the entry with `value` at creation time, as if a fetch had
    /// already succeeded.
    pub fn initial_data<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.initial_data = Some(Arc::new(value) as QueryData);
        self
    }

    /// Whether an observer holding these options fetches on subscribe.
    /// Defaults to `true`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Derive the observer-facing data from the cached value.
    pub fn select(mut self, select: impl Fn(&QueryData) -> QueryData + Send + Sync + 'static) -> Self {
        self.select = Some(Arc::new(select));
        self
    }

    /// Typed convenience over [`QueryOptions::select`]: applies `f` when the
    /// cached value is a `T`, passing other values through untouched.
    pub fn select_with<T, U, F>(self, f: F) -> Self
    where
        T: Send + Sync + 'static,
        U: Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.select(move |data: &QueryData| match data.clone().downcast::<T>() {
            Ok(value) => Arc::new(f(&value)) as QueryData,
            Err(other) => other,
        })
    }

    /// The key these options describe.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub(crate) fn fetcher_fn(&self) -> Option<Arc<dyn Fetcher>> {
        self.fetcher.clone()
    }

    pub(crate) fn effective_stale_time(&self) -> Duration {
        self.stale_time.unwrap_or(Duration::ZERO)
    }

    pub(crate) fn effective_gc_time(&self) -> Duration {
        self.gc_time.unwrap_or(crate::client::DEFAULT_GC_TIME)
    }

    pub(crate) fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.retry
            .clone()
            .unwrap_or_else(|| Arc::new(NoRetry) as Arc<dyn RetryPolicy>)
    }

    pub(crate) fn take_initial_data(&self) -> Option<QueryData> {
        self.initial_data.clone()
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn select_fn(&self) -> Option<SelectFn> {
        self.select.clone()
    }

    /// Fill unset knobs from client-level defaults.
    pub(crate) fn fill_defaults(
        &mut self,
        stale_time: Duration,
        gc_time: Duration,
        retry: Arc<dyn RetryPolicy>,
    ) {
        self.stale_time.get_or_insert(stale_time);
        self.gc_time.get_or_insert(gc_time);
        if self.retry.is_none() {
            self.retry = Some(retry);
        }
    }

    /// Merge these options over `previous`, keeping the previous fetcher and
    /// select when the new options carry none. Initial data only applies at
    /// entry creation, so it never survives a merge.
    pub(crate) fn merged_over(&self, previous: &QueryOptions) -> QueryOptions {
        QueryOptions {
            key: self.key.clone(),
            fetcher: self.fetcher.clone().or_else(|| previous.fetcher.clone()),
            stale_time: self.stale_time.or(previous.stale_time),
            gc_time: self.gc_time.or(previous.gc_time),
            retry: self.retry.clone().or_else(|| previous.retry.clone()),
            initial_data: None,
            enabled: self.enabled,
            select: self.select.clone().or_else(|| previous.select.clone()),
        }
    }
}
