#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod cache;
mod client;
mod error;
mod fetch;
mod key;
mod notify;
mod observer;
mod options;
mod query;
mod retry;

pub use cache::{
    CacheConfig, CacheEvent, CacheEventKind, CacheSubscription, ErrorCallback, QueryCache,
    QueryFilter, QueryPredicate, QueryTypeFilter, SettledCallback, SuccessCallback,
};
pub use client::{DefaultOptions, QueryClient, QueryClientBuilder};
pub use error::FetchError;
pub use fetch::{fetcher, Fetcher, FnFetcher, QueryData};
pub use key::{KeyValue, QueryKey};
pub use observer::{ObserverSubscription, QueryObserver, QueryObserverResult};
pub use options::{QueryOptions, SelectFn};
pub use query::{DispatchAction, FetchStatus, Query, QueryState, QueryStatus};
pub use retry::{ExponentialBackoff, FixedBackoff, NoRetry, RetryPolicy};
