#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use kreflect_core::{MirroredObject, ObjectKey};
use kreflect_store::Store;

fn obj(ns: &str, name: &str, rv: &str) -> MirroredObject {
    MirroredObject::new(Some(ns), name)
        .with_resource_version(rv)
        .with_raw(serde_json::json!({ "metadata": { "namespace": ns, "name": name, "resourceVersion": rv } }))
}

fn key_set(store: &Store) -> BTreeSet<String> {
    store.list_keys().into_iter().map(|k| k.to_string()).collect()
}

#[test]
fn replace_yields_exactly_given_items() {
    let store = Store::new();
    store.upsert(obj("old", "x", "1"));
    store.upsert(obj("old", "y", "2"));

    store.replace(vec![obj("default", "a", "3"), obj("default", "b", "3"), obj("kube-system", "c", "3")]);

    let keys = key_set(&store);
    let want: BTreeSet<String> = ["default/a", "default/b", "kube-system/c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(keys, want);
    assert!(store.has_synced());
}

#[test]
fn replace_with_duplicate_keys_keeps_last() {
    let store = Store::new();
    store.replace(vec![obj("default", "a", "1"), obj("default", "a", "2")]);
    assert_eq!(store.len(), 1);
    let got = store.get(&ObjectKey::from("default/a")).expect("present");
    assert_eq!(got.resource_version.as_deref(), Some("2"));
}

#[test]
fn delete_absent_key_is_noop() {
    let store = Store::new();
    store.replace(vec![obj("default", "a", "1")]);
    let before = store.epoch();

    assert!(!store.delete(&ObjectKey::from("default/missing")));
    assert_eq!(store.epoch(), before, "no-op delete must not publish");
    assert_eq!(key_set(&store).len(), 1);

    assert!(store.delete(&ObjectKey::from("default/a")));
    assert!(!store.delete(&ObjectKey::from("default/a")));
    assert!(store.is_empty());
}

#[test]
fn upsert_overwrites_in_order() {
    let store = Store::new();
    store.upsert(obj("default", "a", "1"));
    store.upsert(obj("default", "a", "2"));
    let got = store.get(&ObjectKey::from("default/a")).expect("present");
    assert_eq!(got.resource_version.as_deref(), Some("2"));
    assert_eq!(store.len(), 1);
}

#[test]
fn snapshot_is_stable_across_later_writes() {
    let store = Store::new();
    store.replace(vec![obj("default", "a", "1")]);
    let snap = store.snapshot();
    store.upsert(obj("default", "b", "2"));
    store.delete(&ObjectKey::from("default/a"));

    assert_eq!(snap.len(), 1);
    assert!(snap.contains(&ObjectKey::from("default/a")));
    assert_eq!(key_set(&store), BTreeSet::from(["default/b".to_string()]));
    assert!(store.epoch() > snap.epoch);
}

#[test]
fn list_returns_current_objects() {
    let store = Store::new();
    assert!(store.list().is_empty());
    store.replace(vec![obj("default", "a", "1"), obj("kube-system", "dns", "1")]);
    store.upsert(obj("default", "a", "4"));
    store.upsert(obj("default", "b", "5"));
    store.delete(&ObjectKey::from("kube-system/dns"));

    let mut listed: Vec<(String, String)> = store
        .list()
        .iter()
        .map(|o| (o.key().to_string(), o.resource_version.clone().unwrap_or_default()))
        .collect();
    listed.sort();
    assert_eq!(listed, vec![("default/a".to_string(), "4".to_string()), ("default/b".to_string(), "5".to_string())]);

    let b = store.list().into_iter().find(|o| o.name == "b").expect("b listed");
    assert_eq!(b.raw["metadata"]["resourceVersion"], "5");
    assert_eq!(key_set(&store).len(), store.list().len());
}

#[test]
fn empty_store_is_not_synced() {
    let store = Store::new();
    assert!(!store.has_synced());
    assert!(store.list_keys().is_empty());
    store.replace(Vec::new());
    assert!(store.has_synced());
    assert!(store.list_keys().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enumeration_sees_whole_replacements() {
    let store = Arc::new(Store::new());
    let set_a: Vec<MirroredObject> = (0..64).map(|i| obj("a", &format!("obj-{i}"), "1")).collect();
    let set_b: Vec<MirroredObject> = (0..48).map(|i| obj("b", &format!("obj-{i}"), "2")).collect();
    let keys_a: BTreeSet<String> = set_a.iter().map(|o| o.key().to_string()).collect();
    let keys_b: BTreeSet<String> = set_b.iter().map(|o| o.key().to_string()).collect();
    store.replace(set_a.clone());

    let writer = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            for i in 0..200 {
                if i % 2 == 0 { store.replace(set_b.clone()) } else { store.replace(set_a.clone()) }
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..3 {
        let store = Arc::clone(&store);
        let keys_a = keys_a.clone();
        let keys_b = keys_b.clone();
        readers.push(tokio::task::spawn_blocking(move || {
            for _ in 0..500 {
                let seen = key_set(&store);
                assert!(seen == keys_a || seen == keys_b, "observed a mixed key set of {} keys", seen.len());
                let listed: BTreeSet<String> = store.list().iter().map(|o| o.key().to_string()).collect();
                assert!(
                    listed == keys_a || listed == keys_b,
                    "list() returned a mixed set of {} objects",
                    listed.len()
                );
            }
        }));
    }

    writer.await.expect("writer");
    for r in readers {
        r.await.expect("reader");
    }
}

#[tokio::test]
async fn epoch_subscribers_are_notified() {
    let store = Store::new();
    let mut rx = store.subscribe_epoch();
    assert_eq!(*rx.borrow(), 0);

    store.upsert(obj("default", "a", "1"));
    tokio::time::timeout(std::time::Duration::from_secs(1), rx.changed())
        .await
        .expect("notified in time")
        .expect("sender alive");
    assert_eq!(*rx.borrow(), 1);
}
