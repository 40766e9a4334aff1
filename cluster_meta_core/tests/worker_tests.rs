use cluster_meta_core::{
    config::MetaServerConfig,
    model::{Address, ClusterMeta, Instance, MasterSwitchInfo, RawAddress, RawInstance, Replica, Role, SdownInfo},
    worker::{encode_snapshot, ClusterMetaWorker},
    MemoryDirectory, MemoryMetaStore, MetaError,
};
use std::sync::Arc;
use std::time::Duration;

const HASH_KEY: &str = "cluster_meta";

fn addr(host: u8, port: u32) -> Address {
    Address::new(&format!("10.0.0.{}", host), port).unwrap()
}

fn meta_master() -> Address {
    addr(1, 6379)
}

struct Harness {
    directory: MemoryDirectory,
    store: MemoryMetaStore,
    worker: Arc<ClusterMetaWorker>,
}

/// Directory with the metadata-store instance and `cache1` (one available
/// and one unavailable replica).
fn harness() -> Harness {
    let directory = MemoryDirectory::new();
    directory.set_instance(Instance::new("meta", Some(meta_master())));
    directory.set_instance(
        Instance::new("cache1", Some(addr(2, 7000)))
            .with_replicas(vec![Replica::new(addr(3, 7000), true), Replica::new(addr(4, 7000), false)]),
    );
    let store = MemoryMetaStore::new();
    let worker = Arc::new(ClusterMetaWorker::new(
        MetaServerConfig::default(),
        Arc::new(directory.clone()),
        Arc::new(store.clone()),
    ));
    Harness { directory, store, worker }
}

fn raw_instance(name: &str, port: u32) -> RawInstance {
    RawInstance {
        name: name.to_string(),
        addr: RawAddress {
            ip: "10.0.0.9".to_string(),
            port,
        },
        epoch: 1,
        subjective_down_timeout_ms: 15_000,
        failover_timeout_ms: 450_000,
    }
}

async fn wait_for_version(worker: &ClusterMetaWorker, version: u32) {
    for _ in 0..200 {
        if worker.version().await >= version {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("version {} never reached", version);
}

#[tokio::test]
async fn test_reconcile_filters_replicas_and_persists() {
    let h = harness();

    assert!(h.worker.reconcile().await.unwrap());

    let meta = h.worker.snapshot().await;
    assert_eq!(meta.version, 1);
    assert_eq!(meta.instances.len(), 2);
    let cache1 = meta.get("cache1").unwrap();
    assert_eq!(cache1.master, Some(addr(2, 7000)));
    assert_eq!(cache1.replicas, vec![Replica::new(addr(3, 7000), true)]);
    assert!(meta.instances.values().flat_map(|i| &i.replicas).all(|r| r.available));

    let stored = h.store.hash(HASH_KEY).await.unwrap();
    assert_eq!(stored.get("version"), Some(&"1".to_string()));
    assert_eq!(stored.get("instance_name_list"), Some(&r#"{"list":["cache1","meta"]}"#.to_string()));
    assert_eq!(h.directory.discover_calls(), 2);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = harness();
    assert!(h.worker.reconcile().await.unwrap());
    let first = h.worker.snapshot().await;
    let first_json = h.worker.snapshot_json().await.unwrap();

    assert!(!h.worker.reconcile().await.unwrap());
    assert_eq!(h.worker.snapshot().await, first);
    assert_eq!(h.worker.snapshot_json().await.unwrap(), first_json);
    assert_eq!(h.store.connect_count(), 1);
}

#[tokio::test]
async fn test_reconcile_counts_one_version_per_changing_pass() {
    let h = harness();
    h.worker.reconcile().await.unwrap();

    // Replica order changes alone are not a change.
    h.directory.set_replicas(
        "cache1",
        vec![Replica::new(addr(4, 7000), false), Replica::new(addr(3, 7000), true)],
    );
    assert!(!h.worker.reconcile().await.unwrap());
    assert_eq!(h.worker.version().await, 1);

    // Two instances changing in one pass bump once.
    h.directory.set_replicas("cache1", vec![Replica::new(addr(5, 7000), true)]);
    h.directory.set_instance(Instance::new("cache2", Some(addr(6, 7000))));
    assert!(h.worker.reconcile().await.unwrap());
    assert_eq!(h.worker.version().await, 2);
}

#[tokio::test]
async fn test_reconcile_never_removes_instances() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    h.directory.drop_instance("cache1");

    assert!(!h.worker.reconcile().await.unwrap());
    assert!(h.worker.snapshot().await.get("cache1").is_some());
}

#[tokio::test]
async fn test_reconcile_aborts_on_discovery_failure() {
    let h = harness();
    h.directory.fail_discover(true);

    assert!(matches!(h.worker.reconcile().await, Err(MetaError::Directory(_))));
    assert_eq!(h.worker.snapshot().await, ClusterMeta::new());
    assert_eq!(h.store.connect_count(), 0);
}

#[tokio::test]
async fn test_reconcile_keeps_memory_ahead_when_store_fails() {
    let h = harness();
    h.store.set_fail_connect(true);

    assert!(h.worker.reconcile().await.is_err());
    assert_eq!(h.worker.version().await, 1);
    assert_eq!(h.worker.snapshot().await.instances.len(), 2);
    assert!(h.store.hash(HASH_KEY).await.is_none());

    h.store.set_fail_connect(false);
    h.worker.store_snapshot().await.unwrap();
    assert_eq!(h.store.hash(HASH_KEY).await.unwrap().get("version"), Some(&"1".to_string()));
}

#[tokio::test]
async fn test_store_requires_metadata_store_master() {
    let h = harness();
    assert!(matches!(h.worker.store_snapshot().await, Err(MetaError::Config(_))));

    h.directory.drop_instance("meta");
    h.worker.reconcile().await.unwrap_err();
    assert!(matches!(h.worker.store_snapshot().await, Err(MetaError::Config(_))));
    assert_eq!(h.store.connect_count(), 0);
}

#[tokio::test]
async fn test_snapshot_round_trip() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    h.worker
        .handle_sdown(&SdownInfo {
            name: "cache1".into(),
            role: Role::Replica,
            addr: addr(3, 7000),
        })
        .await;

    let loaded = h.worker.load_snapshot(&meta_master()).await.unwrap();
    assert_eq!(loaded, h.worker.snapshot().await);
    assert_eq!(loaded.version, 2);
}

#[tokio::test]
async fn test_conflict_leaves_memory_unchanged_and_retry_succeeds() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    let before = h.worker.snapshot().await;

    h.store.interfere_once(HASH_KEY);
    let err = h.worker.store_snapshot().await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(h.worker.snapshot().await, before);

    h.worker.store_snapshot().await.unwrap();
    let persisted = h.worker.load_snapshot(&meta_master()).await.unwrap();
    assert_eq!(persisted, before);

    // The staging hash of the aborted attempt is left behind, unread.
    assert_eq!(h.store.keys().await.len(), 2);
}

#[tokio::test]
async fn test_sdown_reduces_then_retires_instance() {
    let h = harness();
    h.worker.reconcile().await.unwrap();

    let replica_down = SdownInfo {
        name: "cache1".into(),
        role: Role::Replica,
        addr: addr(3, 7000),
    };
    assert!(h.worker.handle_sdown(&replica_down).await);
    let cache1 = h.worker.snapshot().await.get("cache1").cloned().unwrap();
    assert!(cache1.replicas.is_empty());
    assert_eq!(cache1.master, Some(addr(2, 7000)));
    assert_eq!(h.worker.version().await, 2);

    let master_down = SdownInfo {
        name: "cache1".into(),
        role: Role::Master,
        addr: addr(2, 7000),
    };
    assert!(h.worker.handle_sdown(&master_down).await);
    assert!(h.worker.snapshot().await.get("cache1").is_none());
    assert_eq!(h.worker.version().await, 3);

    let stored = h.store.hash(HASH_KEY).await.unwrap();
    assert_eq!(stored.get("version"), Some(&"3".to_string()));
    assert!(!stored.contains_key("cache1"));
}

#[tokio::test]
async fn test_sdown_without_match_changes_nothing() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    let connects = h.store.connect_count();

    let stale_master = SdownInfo {
        name: "cache1".into(),
        role: Role::Master,
        addr: addr(9, 7000),
    };
    assert!(!h.worker.handle_sdown(&stale_master).await);

    let unknown = SdownInfo {
        name: "nope".into(),
        role: Role::Replica,
        addr: addr(3, 7000),
    };
    assert!(!h.worker.handle_sdown(&unknown).await);

    assert_eq!(h.worker.version().await, 1);
    assert_eq!(h.store.connect_count(), connects);
}

#[tokio::test]
async fn test_master_switch_refreshes_replicas() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    h.directory.set_replicas(
        "cache1",
        vec![Replica::new(addr(2, 7000), false), Replica::new(addr(5, 7000), true)],
    );

    let switched = h
        .worker
        .handle_master_switch(&MasterSwitchInfo {
            name: "cache1".into(),
            old_master: Some(addr(2, 7000)),
            new_master: addr(3, 7000),
        })
        .await
        .unwrap();
    assert!(switched);

    let cache1 = h.worker.snapshot().await.get("cache1").cloned().unwrap();
    assert_eq!(cache1.master, Some(addr(3, 7000)));
    assert_eq!(cache1.replicas, vec![Replica::new(addr(5, 7000), true)]);
    assert_eq!(h.worker.version().await, 2);
    assert_eq!(h.store.hash(HASH_KEY).await.unwrap().get("version"), Some(&"2".to_string()));
}

#[tokio::test]
async fn test_repeated_master_switch_is_not_persisted_again() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    h.directory.set_replicas("cache1", vec![Replica::new(addr(2, 7000), true)]);
    let event = MasterSwitchInfo {
        name: "cache1".into(),
        old_master: Some(addr(2, 7000)),
        new_master: addr(3, 7000),
    };

    assert!(h.worker.handle_master_switch(&event).await.unwrap());
    assert_eq!(h.worker.version().await, 2);
    let connects = h.store.connect_count();

    // Redelivered event: topology already matches.
    assert!(!h.worker.handle_master_switch(&event).await.unwrap());
    assert_eq!(h.worker.version().await, 2);
    assert_eq!(h.store.connect_count(), connects);
    assert_eq!(h.store.hash(HASH_KEY).await.unwrap().get("version"), Some(&"2".to_string()));
}

#[tokio::test]
async fn test_master_switch_for_unknown_instance_is_ignored() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    let replica_calls = h.directory.replica_calls();

    let switched = h
        .worker
        .handle_master_switch(&MasterSwitchInfo {
            name: "ghost".into(),
            old_master: None,
            new_master: addr(7, 7000),
        })
        .await
        .unwrap();
    assert!(!switched);
    assert!(h.worker.snapshot().await.get("ghost").is_none());
    assert_eq!(h.worker.version().await, 1);
    assert_eq!(h.directory.replica_calls(), replica_calls);
}

#[tokio::test]
async fn test_master_switch_abandoned_when_replica_query_fails() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    let before = h.worker.snapshot().await;
    h.directory.fail_replicas(true);

    let result = h
        .worker
        .handle_master_switch(&MasterSwitchInfo {
            name: "cache1".into(),
            old_master: Some(addr(2, 7000)),
            new_master: addr(3, 7000),
        })
        .await;
    assert!(matches!(result, Err(MetaError::Directory(_))));
    assert_eq!(h.worker.snapshot().await, before);
}

#[tokio::test]
async fn test_add_instance_validates_before_directory() {
    let h = harness();

    let err = h.worker.add_instance(&raw_instance("cache9", 84007)).await.unwrap_err();
    assert!(matches!(err, MetaError::Validation(_)));

    let err = h.worker.add_instance(&raw_instance("version", 7000)).await.unwrap_err();
    assert!(matches!(err, MetaError::Validation(_)));
    assert_eq!(h.directory.add_calls(), 0);

    h.worker.add_instance(&raw_instance("cache9", 7000)).await.unwrap();
    assert_eq!(h.directory.add_calls(), 1);
    // The snapshot only learns about it on the next pass.
    assert!(h.worker.snapshot().await.get("cache9").is_none());
    h.worker.reconcile().await.unwrap();
    assert!(h.worker.snapshot().await.get("cache9").is_some());
}

#[tokio::test]
async fn test_add_duplicate_surfaces_directory_error() {
    let h = harness();
    let err = h.worker.add_instance(&raw_instance("cache1", 7000)).await.unwrap_err();
    match err {
        MetaError::Directory(message) => assert_eq!(message, "ERR Duplicated master name"),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(h.directory.add_calls(), 1);
}

#[tokio::test]
async fn test_remove_instance() {
    let h = harness();

    assert!(matches!(h.worker.remove_instance("  ").await, Err(MetaError::Validation(_))));
    assert_eq!(h.directory.remove_calls(), 0);

    assert!(matches!(h.worker.remove_instance("ghost").await, Err(MetaError::Directory(_))));
    h.worker.remove_instance("cache1").await.unwrap();
    assert_eq!(h.directory.remove_calls(), 2);
}

#[tokio::test]
async fn test_bootstrap_loads_then_reconciles() {
    let h = harness();
    let mut persisted = ClusterMeta::new();
    persisted.version = 7;
    persisted
        .instances
        .insert("meta".into(), Instance::new("meta", Some(meta_master())));
    persisted
        .instances
        .insert("cache1".into(), Instance::new("cache1", Some(addr(8, 7000))));
    for (field, value) in encode_snapshot(&persisted, &MetaServerConfig::default().meta_store).fields {
        h.store.hset(HASH_KEY, &field, &value).await;
    }

    let worker = ClusterMetaWorker::bootstrap(
        MetaServerConfig::default(),
        Arc::new(h.directory.clone()),
        Arc::new(h.store.clone()),
    )
    .await
    .unwrap();

    let meta = worker.snapshot().await;
    assert_eq!(meta.version, 8);
    assert_eq!(meta.get("cache1").unwrap().master, Some(addr(2, 7000)));
    assert_eq!(h.store.hash(HASH_KEY).await.unwrap().get("version"), Some(&"8".to_string()));
}

#[tokio::test]
async fn test_bootstrap_survives_failed_initial_store() {
    let h = harness();
    h.store.interfere_once(HASH_KEY);

    let worker = ClusterMetaWorker::bootstrap(
        MetaServerConfig::default(),
        Arc::new(h.directory.clone()),
        Arc::new(h.store.clone()),
    )
    .await
    .unwrap();
    assert_eq!(worker.version().await, 1);
}

#[tokio::test]
async fn test_bootstrap_fatal_errors() {
    let h = harness();
    h.directory.drop_instance("meta");
    let err = ClusterMetaWorker::bootstrap(
        MetaServerConfig::default(),
        Arc::new(h.directory.clone()),
        Arc::new(h.store.clone()),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, MetaError::Config(_)));

    let h = harness();
    h.directory.set_instance(Instance::new("meta", None));
    assert!(ClusterMetaWorker::bootstrap(
        MetaServerConfig::default(),
        Arc::new(h.directory.clone()),
        Arc::new(h.store.clone()),
    )
    .await
    .is_err());

    let h = harness();
    h.store.hset(HASH_KEY, "cache1", "{broken").await;
    assert!(ClusterMetaWorker::bootstrap(
        MetaServerConfig::default(),
        Arc::new(h.directory.clone()),
        Arc::new(h.store.clone()),
    )
    .await
    .is_err());

    let h = harness();
    h.directory.fail_get_instances(true);
    assert!(ClusterMetaWorker::bootstrap(
        MetaServerConfig::default(),
        Arc::new(h.directory.clone()),
        Arc::new(h.store.clone()),
    )
    .await
    .is_err());
}

#[tokio::test]
async fn test_watchers_apply_events() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    h.worker.start_watchers().await.unwrap();

    let status = h.worker.watcher_status().await;
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|s| s.running));

    h.directory.set_replicas("cache1", vec![Replica::new(addr(2, 7000), true)]);
    let delivered = h
        .directory
        .emit_master_switch(MasterSwitchInfo {
            name: "cache1".into(),
            old_master: Some(addr(2, 7000)),
            new_master: addr(3, 7000),
        })
        .await;
    assert_eq!(delivered, 1);
    wait_for_version(&h.worker, 2).await;

    let cache1 = h.worker.snapshot().await.get("cache1").cloned().unwrap();
    assert_eq!(cache1.master, Some(addr(3, 7000)));
    assert_eq!(cache1.replicas, vec![Replica::new(addr(2, 7000), true)]);

    h.worker.close().await;
    assert!(h.worker.watcher_status().await.is_empty());
}

#[tokio::test]
async fn test_close_drains_queued_events() {
    let h = harness();
    h.worker.reconcile().await.unwrap();
    h.worker.start_watchers().await.unwrap();

    h.directory
        .emit_sdown(SdownInfo {
            name: "cache1".into(),
            role: Role::Replica,
            addr: addr(3, 7000),
        })
        .await;
    h.directory
        .emit_sdown(SdownInfo {
            name: "cache1".into(),
            role: Role::Master,
            addr: addr(2, 7000),
        })
        .await;
    h.worker.close().await;

    let meta = h.worker.snapshot().await;
    assert_eq!(meta.version, 3);
    assert!(meta.get("cache1").is_none());

    let delivered = h
        .directory
        .emit_sdown(SdownInfo {
            name: "meta".into(),
            role: Role::Master,
            addr: meta_master(),
        })
        .await;
    assert_eq!(delivered, 0);
}
