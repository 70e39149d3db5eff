//! Observer behavior: result snapshots, change detection, dedup, and
//! re-pointing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use refetch::{
    key, CacheEventKind, FetchStatus, QueryClient, QueryFilter, QueryObserver, QueryOptions,
    QueryStatus,
};

#[tokio::test(start_paused = true)]
async fn subscribe_delivers_synchronous_snapshot_then_updates() {
    let client = QueryClient::new();
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(key!["snap"]).fetch_with(|| async { Ok(String::from("data")) }),
    );

    let initial = observer.current_result();
    assert!(initial.is_pending());
    assert!(initial.is_stale);
    assert!(!initial.is_fetching());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription =
        observer.subscribe(move |result| sink.lock().push((result.status, result.fetch_status)));

    // The fetching transition is observable before any async work resolves.
    assert_eq!(observer.current_result().fetch_status, FetchStatus::Fetching);

    tokio::time::sleep(Duration::from_millis(1)).await;
    let seen = seen.lock();
    assert_eq!(
        seen.first().copied(),
        Some((QueryStatus::Pending, FetchStatus::Fetching))
    );
    assert_eq!(
        seen.last().copied(),
        Some((QueryStatus::Success, FetchStatus::Idle))
    );
    assert_eq!(
        *observer.current_result().data_as::<String>().unwrap(),
        "data"
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_execution() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    let options = |calls: &Arc<AtomicU32>| {
        let calls = calls.clone();
        QueryOptions::new(key!["shared"]).fetch_with(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(String::from("value"))
            }
        })
    };

    let first = QueryObserver::new(&client, options(&calls));
    let second = QueryObserver::new(&client, options(&calls));
    let _sub1 = first.subscribe(|_| {});
    let _sub2 = second.subscribe(|_| {});

    // A third caller joins the same in-flight execution.
    let outcome = client.fetch_query(options(&calls)).await;
    assert!(outcome.is_ok());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let from_first = first.current_result().data.unwrap();
    let from_second = second.current_result().data.unwrap();
    assert!(Arc::ptr_eq(&from_first, &from_second));
    assert_eq!(*first.current_result().data_as::<String>().unwrap(), "value");
}

#[tokio::test(start_paused = true)]
async fn unchanged_results_do_not_renotify_listeners() {
    let client = QueryClient::new();
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(key!["quiet"])
            .stale_time(Duration::from_secs(60))
            .fetch_with(|| async { Ok(1i32) }),
    );
    let deliveries = Arc::new(AtomicU32::new(0));
    let count = deliveries.clone();
    let _subscription = observer.subscribe(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    let delivered = deliveries.load(Ordering::SeqCst);
    assert!(delivered >= 2); // fetching, then success

    // A fresh entry and an unchanged result: subscribing a second observer
    // must not disturb the first.
    let other = QueryObserver::new(
        &client,
        QueryOptions::new(key!["quiet"])
            .stale_time(Duration::from_secs(60))
            .fetch_with(|| async { Ok(1i32) }),
    );
    let _other_subscription = other.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(deliveries.load(Ordering::SeqCst), delivered);
}

#[tokio::test(start_paused = true)]
async fn select_derives_observer_data_without_touching_the_entry() {
    let client = QueryClient::new();
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(key!["numbers"])
            .fetch_with(|| async { Ok(vec![1i32, 2, 3]) })
            .select_with::<Vec<i32>, i32, _>(|numbers| numbers.iter().sum()),
    );
    let _subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(*observer.current_result().data_as::<i32>().unwrap(), 6);
    assert_eq!(
        *observer.query().data_as::<Vec<i32>>().unwrap(),
        vec![1, 2, 3]
    );
}

#[tokio::test(start_paused = true)]
async fn disabled_observer_never_fetches() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let count = calls.clone();
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(key!["disabled"])
            .enabled(false)
            .fetch_with(move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(1i32)
                }
            }),
    );
    let _subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let result = observer.current_result();
    assert!(result.is_pending());
    assert_eq!(result.fetch_status, FetchStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn set_options_detaches_before_attaching() {
    let client = QueryClient::new();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    let _subscription = client
        .cache()
        .subscribe(move |event| sink.lock().push(event.kind()));

    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(key!["first"]).fetch_with(|| async { Ok(1i32) }),
    );
    let _listener = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;

    let first = client
        .cache()
        .find(QueryFilter::new().key(key!["first"]))
        .unwrap();
    kinds.lock().clear();

    observer.set_options(QueryOptions::new(key!["second"]).fetch_with(|| async { Ok(2i32) }));

    let recorded = kinds.lock().clone();
    let removed_at = recorded
        .iter()
        .position(|kind| *kind == CacheEventKind::ObserverRemoved)
        .unwrap();
    let added_at = recorded
        .iter()
        .position(|kind| *kind == CacheEventKind::ObserverAdded)
        .unwrap();
    assert!(removed_at < added_at);

    assert_eq!(first.observer_count(), 0);
    let second = client
        .cache()
        .find(QueryFilter::new().key(key!["second"]))
        .unwrap();
    assert!(Arc::ptr_eq(&observer.query(), &second));
    assert_eq!(second.observer_count(), 1);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(*observer.current_result().data_as::<i32>().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn last_unsubscribe_arms_the_gc_timer() {
    let client = QueryClient::new();
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(key!["transient"])
            .gc_time(Duration::from_millis(20))
            .fetch_with(|| async { Ok(1i32) }),
    );
    let subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(1)).await;

    subscription.unsubscribe();
    assert!(client
        .cache()
        .get(&key!["transient"].hash_str())
        .is_some());

    tokio::time::sleep(Duration::from_millis(25)).await;
    assert!(client
        .cache()
        .get(&key!["transient"].hash_str())
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn attached_observer_blocks_garbage_collection() {
    let client = QueryClient::new();
    let observer = QueryObserver::new(
        &client,
        QueryOptions::new(key!["pinned"])
            .gc_time(Duration::from_millis(20))
            .fetch_with(|| async { Ok(1i32) }),
    );
    let _subscription = observer.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.cache().get(&key!["pinned"].hash_str()).is_some());
}

#[tokio::test(start_paused = true)]
async fn batch_defers_listener_delivery_until_exit() {
    let client = QueryClient::new();
    let observer = QueryObserver::new(&client, QueryOptions::new(key!["batched"]).enabled(false));
    let deliveries = Arc::new(AtomicU32::new(0));
    let count = deliveries.clone();
    let _subscription = observer.subscribe(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    client.batch(|| {
        client.set_query_data(key!["batched"], 1i32);
        client.set_query_data(key!["batched"], 2i32);
        assert_eq!(deliveries.load(Ordering::SeqCst), 0);
    });

    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
    assert_eq!(*client.get_query_data::<i32>(&key!["batched"]).unwrap(), 2);
}
