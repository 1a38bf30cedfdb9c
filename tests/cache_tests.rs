/// Entity cache tests
///
/// Identity, single-flight fetching, scanning and eviction of cached entities.
/// Run with: cargo test --test cache_tests

mod common;

use common::{Harness, Sample, seed};
use futures::future::join_all;
use rustentitydb::{
    DatabaseConfig, DbError, EntityRecord, FaultRule, LogLevel, PersistenceState, StorageOp,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_concurrent_get_shares_one_fetch() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let id = Uuid::new_v4();
    seed(&h.storage, "samples", id, Sample::new(7));
    h.storage.set_latency(Some(Duration::from_millis(50)));

    let results = join_all((0..8).map(|_| cache.get(id))).await;
    let entities: Vec<_> = results
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect();

    for entity in &entities[1..] {
        assert!(Arc::ptr_eq(&entities[0], entity));
    }
    assert_eq!(h.storage.calls(StorageOp::Get), 1);
    assert_eq!(entities[0].read(|item| item.my_int).await, 7);

    // Cached now: no further I/O.
    let again = cache.get(id).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&entities[0], &again));
    assert_eq!(h.storage.calls(StorageOp::Get), 1);
}

#[tokio::test]
async fn test_get_from_spawned_tasks_yields_one_instance() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let id = Uuid::new_v4();
    seed(&h.storage, "samples", id, Sample::new(1));
    h.storage.set_latency(Some(Duration::from_millis(20)));

    let mut handles = vec![];
    for _ in 0..6 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.get(id).await.unwrap().unwrap() }));
    }

    let mut entities = vec![];
    for handle in handles {
        entities.push(handle.await.unwrap());
    }
    assert!(entities.iter().all(|e| Arc::ptr_eq(e, &entities[0])));
    assert_eq!(h.storage.calls(StorageOp::Get), 1);
}

#[tokio::test]
async fn test_get_unknown_id_is_not_found() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");

    let result = cache.get(Uuid::new_v4()).await.unwrap();
    assert!(result.is_none());
    assert_eq!(h.logger.count(LogLevel::Warning), 1);
    assert_eq!(h.logger.count(LogLevel::Emergency), 0);
}

#[tokio::test]
async fn test_store_error_reaches_every_waiter() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let id = Uuid::new_v4();
    seed(&h.storage, "samples", id, Sample::new(1));
    h.storage.set_latency(Some(Duration::from_millis(30)));
    h.storage.inject_fault(FaultRule::recoverable(StorageOp::Get, 1));

    let results = join_all((0..3).map(|_| cache.get(id))).await;
    for result in results {
        let err = result.unwrap_err();
        assert!(matches!(err, DbError::Storage(_)));
        assert!(err.is_recoverable());
    }
    assert_eq!(h.storage.calls(StorageOp::Get), 1);
    assert_eq!(h.logger.count(LogLevel::Emergency), 1);

    // Not retried inside get, but a later get starts a new fetch.
    let entity = cache.get(id).await.unwrap();
    assert!(entity.is_some());
    assert_eq!(h.storage.calls(StorageOp::Get), 2);
}

#[tokio::test]
async fn test_corrupt_record_is_decoding_error() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let id = Uuid::new_v4();
    h.storage.put_raw("samples", id, b"{\"id\": 12".to_vec());

    let err = cache.get(id).await.unwrap_err();
    assert!(matches!(err, DbError::Decoding(_)));
    assert_eq!(h.logger.count(LogLevel::Emergency), 1);
    assert!(!cache.has_cached(id));
}

#[tokio::test]
async fn test_schema_version_comes_from_cache() {
    let h = Harness::new(DatabaseConfig::new().schema_version(5));
    let id = Uuid::new_v4();
    let mut record: EntityRecord<Sample> = EntityRecord {
        id,
        schema_version: 99,
        created: chrono::Utc::now(),
        saved: None,
        item: Sample::new(3),
        persistence_state: PersistenceState::Persistent,
        version: 4,
    };
    h.storage.put_raw("samples", id, record.encode().unwrap());

    let cache = h.db.cache::<Sample>("samples");
    assert_eq!(cache.schema_version(), 5);
    let entity = cache.get(id).await.unwrap().unwrap();
    assert_eq!(entity.schema_version(), 5);
    assert_eq!(entity.version(), 4);

    record.id = Uuid::new_v4();
    h.storage.put_raw("pinned", record.id, record.encode().unwrap());
    let pinned = rustentitydb::EntityCache::<Sample>::with_schema_version(&h.db, "pinned", 2);
    let entity = pinned.get(record.id).await.unwrap().unwrap();
    assert_eq!(entity.schema_version(), 2);
}

#[tokio::test]
async fn test_new_entity_is_visible_to_get() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let batch = h.db.new_batch();

    let entity = cache.new_entity(&batch, Sample::new(10)).unwrap();
    assert_eq!(entity.persistence_state(), PersistenceState::New);
    assert_eq!(entity.version(), 0);
    assert!(entity.saved().is_none());
    assert_eq!(entity.cache_name(), "samples");
    assert_eq!(batch.len(), 1);

    let fetched = cache.get(entity.id()).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&entity, &fetched));
    assert_eq!(h.storage.total_calls(), 0);
}

#[tokio::test]
async fn test_new_entity_with_factory_and_duplicate_id() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let batch = h.db.new_batch();

    let entity = cache
        .new_entity_with(&batch, |id| Sample {
            my_int: 1,
            label: id.to_string(),
        })
        .unwrap();
    let label = entity.read(|item| item.label.clone()).await;
    assert_eq!(label, entity.id().to_string());

    let err = cache
        .new_entity_with_id(&batch, entity.id(), Sample::new(2))
        .unwrap_err();
    assert_eq!(err, DbError::DuplicateEntity(entity.id().to_string()));
}

#[tokio::test]
async fn test_has_cached_is_stable() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let batch = h.db.new_batch();
    let entity = cache.new_entity(&batch, Sample::new(1)).unwrap();
    let id = entity.id();

    assert!(cache.has_cached(id));
    assert!(cache.has_cached(id));
    assert_eq!(cache.cached_count(), 1);

    drop(entity);
    drop(batch);
    assert!(!cache.has_cached(id));
    assert!(!cache.has_cached(id));
    assert_eq!(cache.cached_count(), 0);
}

#[tokio::test]
async fn test_scan_empty_store_logs_nothing() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");

    let entities = cache.scan().await.unwrap();
    assert!(entities.is_empty());
    assert!(h.logger.records().is_empty());
}

#[tokio::test]
async fn test_scan_reuses_live_instances() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    for n in 0..4 {
        seed(&h.storage, "samples", Uuid::new_v4(), Sample::new(n));
    }

    let mut first = cache.scan().await.unwrap();
    let mut second = cache.scan().await.unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(second.len(), 4);

    first.sort_by_key(|e| e.id());
    second.sort_by_key(|e| e.id());
    for (a, b) in first.iter().zip(&second) {
        assert!(Arc::ptr_eq(a, b));
    }
    assert_eq!(cache.cached_count(), 4);

    let fetched = cache.get(first[0].id()).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first[0], &fetched));
    assert_eq!(h.storage.calls(StorageOp::Get), 0);
}

#[tokio::test]
async fn test_scan_skips_undecodable_records() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    seed(&h.storage, "samples", Uuid::new_v4(), Sample::new(1));
    seed(&h.storage, "samples", Uuid::new_v4(), Sample::new(2));
    h.storage.put_raw("samples", Uuid::new_v4(), b"garbage".to_vec());

    let entities = cache.scan().await.unwrap();
    assert_eq!(entities.len(), 2);
    assert_eq!(h.logger.count(LogLevel::Emergency), 1);
}

#[tokio::test]
async fn test_scan_filter_uses_cached_item() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let id = Uuid::new_v4();
    seed(&h.storage, "samples", id, Sample::new(1));
    seed(&h.storage, "samples", Uuid::new_v4(), Sample::new(50));

    let entity = cache.get(id).await.unwrap().unwrap();
    let batch = h.db.new_batch();
    entity.update(&batch, |item| item.my_int = 100).await.unwrap();

    // The store still says 1; the live instance says 100.
    let large = cache.scan_filtered(|item| item.my_int >= 50).await.unwrap();
    assert_eq!(large.len(), 2);
    assert!(large.iter().any(|e| Arc::ptr_eq(e, &entity)));

    let small = cache.scan_filtered(|item| item.my_int < 50).await.unwrap();
    assert!(small.is_empty());
}

#[tokio::test]
async fn test_scan_store_error_is_propagated() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    h.storage.inject_fault(FaultRule::unrecoverable(StorageOp::Scan));

    let err = cache.scan().await.unwrap_err();
    assert!(matches!(err, DbError::Storage(_)));
    assert!(!err.is_recoverable());
    assert_eq!(h.logger.count(LogLevel::Emergency), 1);
}

#[tokio::test]
async fn test_on_cached_callbacks_fire_once_in_order() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let id = Uuid::new_v4();
    let fired = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second"] {
        let fired = fired.clone();
        cache.register_on_entity_cached(id, move |entity| {
            fired.lock().unwrap().push((tag, entity.id()));
        });
    }

    let batch = h.db.new_batch();
    let entity = cache.new_entity_with_id(&batch, id, Sample::new(1)).unwrap();
    assert_eq!(
        *fired.lock().unwrap(),
        vec![("first", id), ("second", id)]
    );

    // One-shot: a later insertion of the same id fires nothing.
    batch.commit().await.unwrap();
    drop(entity);
    drop(batch);
    assert!(!cache.has_cached(id));
    cache.get(id).await.unwrap().unwrap();
    assert_eq!(fired.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_wait_while_cached_observes_eviction() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let batch = h.db.new_batch();
    let entity = cache.new_entity(&batch, Sample::new(1)).unwrap();
    let id = entity.id();
    drop(batch);

    assert!(!cache.wait_while_cached_async(id, Duration::from_millis(20)).await);

    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(entity);
    });
    assert!(cache.wait_while_cached_async(id, Duration::from_secs(5)).await);
    holder.await.unwrap();
    assert!(!cache.has_cached(id));
}

#[tokio::test]
async fn test_duplicate_cache_name_is_not_registered() {
    let h = Harness::new(DatabaseConfig::default());
    let first = h.db.cache::<Sample>("samples");
    let second = h.db.cache::<Sample>("samples");

    assert!(first.is_registered());
    assert!(!second.is_registered());
    assert_eq!(h.logger.count(LogLevel::Error), 1);
    assert!(h.context.is_cache_registered(&first.qualified_name()));

    let empty = h.db.cache::<Sample>("");
    assert!(!empty.is_registered());
    assert_eq!(h.logger.count(LogLevel::Error), 2);

    // A name freed by a dropped cache can be claimed again.
    drop(second);
    drop(first);
    let third = h.db.cache::<Sample>("samples");
    assert!(third.is_registered());
}

#[tokio::test]
async fn test_get_with_invokes_completion() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let id = Uuid::new_v4();
    seed(&h.storage, "samples", id, Sample::new(9));

    let (tx, rx) = tokio::sync::oneshot::channel();
    cache.get_with(id, move |result| {
        let _ = tx.send(result);
    });
    let entity = rx.await.unwrap().unwrap().unwrap();
    assert_eq!(entity.read(|item| item.my_int).await, 9);
}

#[tokio::test]
async fn test_scan_with_invokes_completion() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    for n in 1..=3 {
        seed(&h.storage, "samples", Uuid::new_v4(), Sample::new(n));
    }

    let threshold = Arc::new(2_i64);
    let (tx, rx) = tokio::sync::oneshot::channel();
    cache.scan_with(
        move |item| item.my_int >= *threshold,
        move |result| {
            let _ = tx.send(result);
        },
    );
    let scanned = rx.await.unwrap().unwrap();
    let mut ints = Vec::new();
    for entity in &scanned {
        ints.push(entity.read(|item| item.my_int).await);
    }
    ints.sort();
    assert_eq!(ints, vec![2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scan_racing_get_yields_one_instance_per_id() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    for (n, id) in ids.iter().enumerate() {
        seed(&h.storage, "samples", *id, Sample::new(n as i64));
    }
    h.storage.set_latency(Some(Duration::from_millis(2)));

    for _ in 0..50 {
        let scan = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.scan().await })
        };
        let gets: Vec<_> = ids
            .iter()
            .map(|&id| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(id).await })
            })
            .collect();

        let scanned = scan.await.unwrap().unwrap();
        assert_eq!(scanned.len(), ids.len());
        for get in gets {
            let entity = get.await.unwrap().unwrap().unwrap();
            let twin = scanned
                .iter()
                .find(|candidate| candidate.id() == entity.id())
                .unwrap();
            assert!(Arc::ptr_eq(twin, &entity));
        }

        drop(scanned);
        for &id in &ids {
            assert!(cache.wait_while_cached_async(id, Duration::from_secs(1)).await);
        }
    }
}

#[test]
fn test_blocking_forms_outside_runtime() {
    let h = Harness::new(DatabaseConfig::default());
    let cache = h.db.cache::<Sample>("samples");
    let id = Uuid::new_v4();
    seed(&h.storage, "samples", id, Sample::new(4));
    seed(&h.storage, "samples", Uuid::new_v4(), Sample::new(8));

    let entity = cache.get_sync(id).unwrap().unwrap();
    assert_eq!(entity.read_sync(|item| item.my_int), 4);
    entity.access_sync(|item| item.my_int += 1);
    assert_eq!(entity.read_sync(|item| item.my_int), 5);

    let scanned = cache.scan_sync(|item| item.my_int > 4).unwrap();
    assert_eq!(scanned.len(), 2);

    drop(scanned);
    drop(entity);
    assert!(cache.wait_while_cached(id, Duration::from_secs(1)));
}
