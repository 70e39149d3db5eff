//! The fetch-function contract supplied per query.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Type-erased query data as stored in the cache.
///
/// Values are wrapped in `Arc` for cheap sharing between the cache, every
/// observer result, and every waiter of a deduplicated fetch. Downcast with
/// [`crate::Query::data_as`] or [`crate::QueryObserverResult::data_as`].
pub type QueryData = Arc<dyn Any + Send + Sync>;

/// A zero-argument fetch operation producing a value or a failure reason.
///
/// The owning query invokes it at most once concurrently, no matter how
/// many observers request a fetch at the same time. Any error is a failure
/// transition subject to the query's retry policy.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Run the fetch once.
    async fn fetch(&self) -> Result<QueryData, anyhow::Error>;
}

/// Adapter turning a boxed-future closure into a [`Fetcher`].
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F>
where
    F: Fn() -> BoxFuture<'static, Result<QueryData, anyhow::Error>> + Send + Sync,
{
    /// Wrap `f` as a fetcher.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Fetcher for FnFetcher<F>
where
    F: Fn() -> BoxFuture<'static, Result<QueryData, anyhow::Error>> + Send + Sync,
{
    async fn fetch(&self) -> Result<QueryData, anyhow::Error> {
        (self.f)().await
    }
}

/// Build a [`Fetcher`] from an async closure returning a typed value.
///
/// The value is erased into [`QueryData`] on success:
///
/// ```
/// use refetch::fetcher;
///
/// let f = fetcher(|| async { Ok(String::from("data")) });
/// ```
pub fn fetcher<T, Fut, F>(f: F) -> Arc<dyn Fetcher>
where
    T: Send + Sync + 'static,
    Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
{
    Arc::new(FnFetcher::new(
        move || -> BoxFuture<'static, Result<QueryData, anyhow::Error>> {
            let fut = f();
            Box::pin(async move { fut.await.map(|value| Arc::new(value) as QueryData) })
        },
    ))
}
