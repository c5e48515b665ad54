#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conform_core::DeclaredResource;
use conform_store::{DeclaredCache, DeclaredEntry, SnapshotBuilder};

fn cm(name: &str, gen: usize) -> DeclaredEntry {
    let m = serde_json::json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "ns" },
        "data": { "gen": gen.to_string() }
    });
    DeclaredEntry::new(DeclaredResource::from_manifest(m, None).unwrap())
}

fn generation(gen: usize, size: usize) -> SnapshotBuilder {
    let mut b = SnapshotBuilder::new(format!("rev-{}", gen));
    for i in 0..size {
        b.insert(cm(&format!("cm{}", i), gen));
    }
    b
}

#[test]
fn publish_bumps_epoch_and_exposes_entries() {
    let cache = DeclaredCache::new();
    let handle = cache.handle();
    assert_eq!(handle.current().epoch, 0);
    assert!(handle.current().is_empty());

    let epoch = cache.publish(generation(1, 3));
    assert_eq!(epoch, 1);
    let snap = handle.current();
    assert_eq!(snap.revision.as_deref(), Some("rev-1"));
    assert_eq!(snap.len(), 3);
    assert_eq!(snap.gvks().len(), 1);
    assert_eq!(*handle.subscribe_epoch().borrow(), 1);

    let first = snap.ids()[0].clone();
    let entry = snap.get(&first).unwrap();
    assert_eq!(entry.fields.len(), 1);

    let mut next = SnapshotBuilder::from_snapshot(&snap, "rev-2");
    next.remove(&first);
    cache.publish(next);
    assert!(!handle.current().contains(&first));
    // the old snapshot is untouched
    assert!(snap.contains(&first));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_always_see_complete_generations() {
    const SIZE: usize = 40;
    let cache = Arc::new(DeclaredCache::new());
    cache.publish(generation(0, SIZE));
    let handle = cache.handle();
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut checks = 0u32;
            loop {
                let snap = handle.current();
                assert_eq!(snap.len(), SIZE);
                let gen = snap.get(&snap.ids()[0]).unwrap().resource.payload["data"]["gen"].clone();
                for id in snap.ids() {
                    assert_eq!(snap.get(&id).unwrap().resource.payload["data"]["gen"], gen);
                }
                checks += 1;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                tokio::task::yield_now().await;
            }
            checks
        })
    };

    for gen in 1..50 {
        cache.publish(generation(gen, SIZE));
        tokio::task::yield_now().await;
    }
    stop.store(true, Ordering::Relaxed);
    let checks = reader.await.unwrap();
    assert!(checks > 0);
    assert_eq!(cache.current().epoch, 50);
}
