use cluster_meta_core::{
    config::MetaServerConfig,
    model::{Address, Instance, MasterSwitchInfo, Replica},
    ClusterMetaWorker, MemoryDirectory, MemoryMetaStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const INSTANCES: u32 = 4;
const ROUNDS: u32 = 25;

fn addr(port: u32) -> Address {
    Address::new("10.0.0.1", port).unwrap()
}

/// Every instance owns the ports `block * 1000 .. block * 1000 + 999`.
fn port_in_block(block: u32, offset: u32) -> u32 {
    block * 1000 + offset % 1000
}

fn instance_name(block: u32) -> String {
    format!("cache{}", block)
}

fn block_of(name: &str) -> Option<u32> {
    name.strip_prefix("cache").and_then(|n| n.parse().ok())
}

fn setup() -> (MemoryDirectory, MemoryMetaStore, Arc<ClusterMetaWorker>) {
    let directory = MemoryDirectory::new();
    directory.set_instance(Instance::new("meta", Some(addr(6379))));
    for block in 1..=INSTANCES {
        directory.set_instance(
            Instance::new(instance_name(block), Some(addr(port_in_block(block, 0))))
                .with_replicas(vec![Replica::new(addr(port_in_block(block, 1)), true)]),
        );
    }
    let store = MemoryMetaStore::new();
    let worker = Arc::new(ClusterMetaWorker::new(
        MetaServerConfig::default(),
        Arc::new(directory.clone()),
        Arc::new(store.clone()),
    ));
    (directory, store, worker)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_switches_and_reconciles_keep_instances_isolated() {
    let (directory, store, worker) = setup();
    worker.reconcile().await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let worker = worker.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut last = 0;
            while !done.load(Ordering::SeqCst) {
                let version = worker.version().await;
                assert!(version >= last, "version went from {} to {}", last, version);
                last = version;
                tokio::task::yield_now().await;
            }
            last
        })
    };

    let mut tasks = Vec::new();
    for block in 1..=INSTANCES {
        let worker = worker.clone();
        let directory = directory.clone();
        tasks.push(tokio::spawn(async move {
            let name = instance_name(block);
            for round in 1..=ROUNDS {
                let master = addr(port_in_block(block, round * 2));
                let replica = addr(port_in_block(block, round * 2 + 1));
                directory.set_instance(
                    Instance::new(name.clone(), Some(master)).with_replicas(vec![Replica::new(replica, true)]),
                );
                // Conflicts between concurrent writers are tolerated; the
                // snapshot itself is what is checked.
                let _ = worker
                    .handle_master_switch(&MasterSwitchInfo {
                        name: name.clone(),
                        old_master: None,
                        new_master: master,
                    })
                    .await;
            }
        }));
    }
    for _ in 0..ROUNDS {
        let worker = worker.clone();
        tasks.push(tokio::spawn(async move {
            let _ = worker.reconcile().await;
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    done.store(true, Ordering::SeqCst);
    let observed = sampler.await.unwrap();

    let meta = worker.snapshot().await;
    assert!(meta.version >= observed);
    // A switch that finds its round already installed by a reconcile does
    // not bump, and one merge can carry every instance's round at once.
    assert!(meta.version > ROUNDS);
    assert_eq!(meta.instances.len(), INSTANCES as usize + 1);

    for (name, instance) in &meta.instances {
        let block = match block_of(name) {
            Some(block) => block,
            None => continue,
        };
        let range = block * 1000..block * 1000 + 1000;
        let master = instance.master.unwrap();
        assert!(range.contains(&(master.port() as u32)), "{} master {}", name, master);
        for replica in &instance.replicas {
            assert!(range.contains(&(replica.addr.port() as u32)), "{} replica {}", name, replica.addr);
        }
    }

    // Whatever the last successful writer stored, a final store brings the
    // persisted copy level with memory.
    worker.store_snapshot().await.unwrap();
    let persisted = worker.load_snapshot(&addr(6379)).await.unwrap();
    assert_eq!(persisted, meta);
    assert_eq!(
        store.hash("cluster_meta").await.unwrap().get("version"),
        Some(&meta.version.to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stores_serialize() {
    let (_directory, store, worker) = setup();
    worker.reconcile().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let worker = worker.clone();
        tasks.push(tokio::spawn(async move { worker.store_snapshot().await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Each attempt renamed its own staging hash; none were left behind.
    assert_eq!(store.keys().await, vec!["cluster_meta".to_string()]);
}
