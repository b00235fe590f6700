use std::sync::Arc;
use std::time::Duration;

use recsync_core::SyncConfig;
use recsync_storage::{CacheGateway, InMemoryCacheBackend};
use recsync_store::{LoadOptions, PollerConfig, RecordStore, StalenessPoller};
use recsync_test_utils::fixtures::{contact_model, contact_row, transport_error};
use recsync_test_utils::{MockGateway, MockHeadSource};

type Cached = CacheGateway<Arc<MockGateway>, InMemoryCacheBackend>;

struct Collection {
    gateway: Arc<MockGateway>,
    cache: Arc<Cached>,
    store: Arc<RecordStore<Arc<Cached>>>,
}

fn collection() -> Collection {
    let gateway = MockGateway::shared();
    gateway.set_rows(vec![contact_row(1, "A")]);
    let cache = Arc::new(CacheGateway::with_defaults(
        Arc::clone(&gateway),
        Arc::new(InMemoryCacheBackend::new()),
    ));
    let store = Arc::new(RecordStore::new(contact_model(), Arc::clone(&cache)));
    Collection {
        gateway,
        cache,
        store,
    }
}

#[tokio::test]
async fn orders_marker_advance_clears_cache_and_reloads_once() {
    let orders = collection();
    orders.store.load(LoadOptions::default()).await.unwrap();
    assert_eq!(orders.gateway.read_calls(), 1);

    let heads = MockHeadSource::shared();
    heads.set_head("orders", 3);
    let poller = StalenessPoller::new(Arc::clone(&heads));
    poller
        .register_with_marker("orders", orders.store.clone(), orders.cache.clone(), 3)
        .unwrap();

    let report = poller.run().await.unwrap();
    assert!(report.advanced.is_empty());
    assert_eq!(orders.cache.stats().await.unwrap().invalidations, 0);
    assert_eq!(orders.gateway.read_calls(), 1);
    assert_eq!(heads.last_request().unwrap(), vec!["orders".to_string()]);

    heads.set_head("orders", 4);
    let report = poller.run().await.unwrap();
    assert_eq!(report.advanced, vec!["orders".to_string()]);
    assert_eq!(report.reloaded, vec!["orders".to_string()]);
    assert_eq!(orders.cache.stats().await.unwrap().invalidations, 1);
    // The reload missed the wiped cache and went to the source.
    assert_eq!(orders.gateway.read_calls(), 2);
    assert_eq!(poller.last_seen("orders").unwrap(), Some(4));
}

#[tokio::test]
async fn store_that_never_loaded_is_only_invalidated() {
    let orders = collection();
    let heads = MockHeadSource::shared();
    heads.set_head("orders", 1);
    let poller = StalenessPoller::new(Arc::clone(&heads));
    poller
        .register("orders", orders.store.clone(), orders.cache.clone())
        .unwrap();

    let report = poller.run().await.unwrap();
    assert_eq!(report.advanced.len(), 1);
    assert!(report.reloaded.is_empty());
    assert_eq!(orders.gateway.read_calls(), 0);
}

#[tokio::test]
async fn one_query_covers_every_collection() {
    let orders = collection();
    let invoices = collection();
    let heads = MockHeadSource::shared();
    heads.set_head("orders", 2);

    let poller = StalenessPoller::new(Arc::clone(&heads));
    poller
        .register_with_marker("orders", orders.store.clone(), orders.cache.clone(), 1)
        .unwrap();
    poller
        .register_with_marker("invoices", invoices.store.clone(), invoices.cache.clone(), 1)
        .unwrap();

    let report = poller.run().await.unwrap();
    assert_eq!(heads.calls(), 1);
    assert_eq!(heads.last_request().unwrap().len(), 2);
    assert_eq!(report.advanced, vec!["orders".to_string()]);
    assert_eq!(poller.last_seen("invoices").unwrap(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn scheduled_polling_survives_transport_failures() {
    let orders = collection();
    orders.store.load(LoadOptions::default()).await.unwrap();
    let heads = MockHeadSource::shared();
    heads.set_head("orders", 5);
    heads.fail_next(transport_error());

    let poller = StalenessPoller::new(Arc::clone(&heads));
    poller
        .register_with_marker("orders", orders.store.clone(), orders.cache.clone(), 4)
        .unwrap();

    let config = PollerConfig::from(&SyncConfig::default().with_poll_interval(Duration::from_secs(5)));
    poller.start_with(&config).unwrap();
    assert!(poller.is_running());

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(poller.metrics().errors, 1);
    assert_eq!(poller.last_seen("orders").unwrap(), Some(4));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(poller.last_seen("orders").unwrap(), Some(5));
    assert_eq!(poller.metrics().reloads, 1);
    assert_eq!(heads.calls(), 2);

    poller.destroy();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(heads.calls(), 2);
    assert!(poller.registered().unwrap().is_empty());
}
