//! Optimistic concurrency, version counter semantics, and hook dispatch.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use folio_redis::{Diff, Dict, Error, Filter, ReadOpts, RecordStore, Ref};

#[tokio::test]
async fn concurrent_update_loses_exactly_once() {
    let server = common::start_server();
    let store = common::open_store(&server);

    let r1 = store
        .commit_one(Diff::add(
            Ref::new("s-1"),
            Dict::new().set_marker("site").set("dis", "S"),
        ))
        .await
        .unwrap();

    // Two callers hold the same record and race their updates.
    let first = Diff::update(&r1, Dict::new().set("dis", "first")).unwrap();
    let second = Diff::update(&r1, Dict::new().set("dis", "second")).unwrap();

    let ver_before = store.cur_ver();
    let winner = store.commit_one(first).await.unwrap();
    let loser = store.commit_one(second).await;

    match loser {
        Err(Error::ConcurrentChange { id, expected, actual }) => {
            assert_eq!(id, "s-1");
            assert_eq!(expected, r1.mod_time());
            assert_eq!(actual, winner.mod_time());
        }
        other => panic!("expected ConcurrentChange, got {:?}", other.map(|r| r.dis())),
    }

    // Exactly one version advance; the store holds the winner's state.
    assert_eq!(store.cur_ver(), ver_before + 1);
    let current = store.read_by_id(r1.id().unwrap()).unwrap();
    assert_eq!(current.get("dis").unwrap().as_str(), Some("first"));
}

#[tokio::test]
async fn force_update_skips_mod_check() {
    let server = common::start_server();
    let store = common::open_store(&server);

    let r1 = store
        .commit_one(Diff::add(Ref::new("f-1"), Dict::new().set_marker("site")))
        .await
        .unwrap();
    store
        .commit_one(Diff::update(&r1, Dict::new().set("dis", "moved on")).unwrap())
        .await
        .unwrap();

    // Stale mod, but forced.
    let forced = Diff::update(&r1, Dict::new().set("dis", "forced")).unwrap().force();
    let rec = store.commit_one(forced).await.unwrap();
    assert_eq!(rec.get("dis").unwrap().as_str(), Some("forced"));
}

#[tokio::test]
async fn mod_is_strictly_increasing() {
    let server = common::start_server();
    let store = common::open_store(&server);

    let mut rec = store
        .commit_one(Diff::add(Ref::new("m-1"), Dict::new().set_marker("site")))
        .await
        .unwrap();
    let mut last_mod = rec.mod_time().unwrap();

    for i in 0..20 {
        rec = store
            .commit_one(
                Diff::update(&rec, Dict::new().set("counter", i as f64)).unwrap(),
            )
            .await
            .unwrap();
        let this_mod = rec.mod_time().unwrap();
        assert!(this_mod > last_mod, "mod must strictly increase");
        last_mod = this_mod;
    }
}

#[tokio::test]
async fn version_advances_once_per_batch() {
    let server = common::start_server();
    let store = common::open_store(&server);

    let ver = store.cur_ver();
    // One batch, three diffs: one advance.
    store
        .commit(vec![
            Diff::add(Ref::new("b-1"), Dict::new().set_marker("site")),
            Diff::add(Ref::new("b-2"), Dict::new().set_marker("site")),
            Diff::add(Ref::new("b-3"), Dict::new().set_marker("site")),
        ])
        .await
        .unwrap();
    assert_eq!(store.cur_ver(), ver + 1);

    // The persisted counter tracks the in-memory one.
    let mut raw = common::raw_client(&server);
    let persisted: u64 = String::from_utf8(raw.get("meta:version").unwrap().unwrap())
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(persisted, store.cur_ver());
}

#[tokio::test]
async fn transient_commit_skips_version_and_storage() {
    let server = common::start_server();
    let store = common::open_store(&server);

    let rec = store
        .commit_one(Diff::add(Ref::new("t-1"), Dict::new().set_marker("site")))
        .await
        .unwrap();
    let ver = store.cur_ver();

    let transient = store
        .commit_one(
            Diff::update(&rec, Dict::new().set("curStatus", "ok"))
                .unwrap()
                .transient(),
        )
        .await
        .unwrap();

    // Version untouched, mod untouched, but the tag is observable.
    assert_eq!(store.cur_ver(), ver);
    assert_eq!(transient.mod_time(), rec.mod_time());
    let read = store.read_by_id(rec.id().unwrap()).unwrap();
    assert_eq!(read.get("curStatus").unwrap().as_str(), Some("ok"));

    // Not persisted: the stored encoding has no curStatus.
    let mut raw = common::raw_client(&server);
    let trio = String::from_utf8(raw.hget("rec:t-1", "trio").unwrap().unwrap()).unwrap();
    assert!(!trio.contains("curStatus"), "stored: {}", trio);

    // And a restart does not resurrect it.
    store.close().await;
    let reopened = common::open_store(&server);
    let fresh = reopened.read_by_id(&Ref::new("t-1")).unwrap();
    assert!(!fresh.has("curStatus"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_commits_serialize() {
    let server = common::start_server();
    let store = common::open_store(&server);
    let ver = store.cur_ver();

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .commit_one(Diff::add(
                    Ref::new(format!("p-{}", i)),
                    Dict::new().set_marker("site"),
                ))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.cur_ver(), ver + 10);
    assert_eq!(
        store.read_count(&Filter::has("site"), &ReadOpts::default()),
        10
    );
}

#[tokio::test]
async fn pre_commit_hook_aborts_batch() {
    let server = common::start_server();
    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);

    let config = common::test_config(&server).on_pre_commit(move |event| {
        hook_calls.fetch_add(1, Ordering::SeqCst);
        if event.diff.changes.has("forbidden") {
            return Err(Error::Commit("forbidden tag".to_string()));
        }
        Ok(())
    });
    let store = RecordStore::open(config).unwrap();

    let ver = store.cur_ver();
    let result = store
        .commit(vec![
            Diff::add(Ref::new("ok-1"), Dict::new().set_marker("site")),
            Diff::add(
                Ref::new("bad-1"),
                Dict::new().set_marker("site").set_marker("forbidden"),
            ),
        ])
        .await;
    assert!(matches!(result, Err(Error::Commit(_))));
    assert!(calls.load(Ordering::SeqCst) >= 2);

    // Nothing observable: not in cache, not in storage, version unchanged.
    assert_eq!(store.cur_ver(), ver);
    assert!(store.read_by_id_opt(&Ref::new("ok-1")).is_none());
    let mut raw = common::raw_client(&server);
    assert!(raw.smembers("idx:all").unwrap().is_empty());
}

#[tokio::test]
async fn post_commit_hook_failure_is_swallowed() {
    let server = common::start_server();
    let calls = Arc::new(AtomicUsize::new(0));
    let hook_calls = Arc::clone(&calls);

    let config = common::test_config(&server).on_post_commit(move |_| {
        hook_calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Commit("post hook always fails".to_string()))
    });
    let store = RecordStore::open(config).unwrap();

    let rec = store
        .commit_one(Diff::add(Ref::new("h-1"), Dict::new().set_marker("site")))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // The commit itself succeeded despite the failing hook.
    assert!(store.read_by_id_opt(rec.id().unwrap()).is_some());
}

#[tokio::test]
async fn commit_cx_reaches_hooks() {
    let server = common::start_server();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let hook_seen = Arc::clone(&seen);

    let config = common::test_config(&server).on_pre_commit(move |event| {
        hook_seen
            .lock()
            .unwrap()
            .push(event.cx.clone().unwrap_or_default());
        Ok(())
    });
    let store = RecordStore::open(config).unwrap();

    store
        .commit_cx(
            vec![Diff::add(Ref::new("c-1"), Dict::new().set_marker("site"))],
            Some("nightly-sync".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), ["nightly-sync"]);
}

#[tokio::test]
async fn commit_after_close_fails() {
    let server = common::start_server();
    let store = common::open_store(&server);
    store.close().await;

    let result = store
        .commit_one(Diff::add(Ref::new("late"), Dict::new().set_marker("site")))
        .await;
    assert!(matches!(result, Err(Error::Commit(_))));

    // Reads keep serving the final cache state.
    assert_eq!(
        store.read_count(&Filter::has("site"), &ReadOpts::default()),
        0
    );
}

#[tokio::test]
async fn pool_close_rejects_checkout() {
    let server = common::start_server();
    let config = std::sync::Arc::new(common::test_config(&server));
    let pool = folio_redis::ConnPool::new(config);

    pool.with_conn(|c| {
        assert!(c.ping()?);
        Ok(())
    })
    .unwrap();

    pool.close();
    let result = pool.with_conn(|c| c.ping());
    assert!(matches!(result, Err(Error::PoolClosed)));
}

#[tokio::test]
async fn pool_health_check_replaces_dead_sessions() {
    let server = common::start_server();
    let config = std::sync::Arc::new(common::test_config(&server));
    let pool = folio_redis::ConnPool::new(config);

    // Park one healthy session in the free list.
    pool.with_conn(|_| Ok(())).unwrap();
    assert_eq!(pool.check_health().unwrap(), 0);

    // A failing operation closes the session and counts the error.
    let before = pool.error_count();
    let failed: folio_redis::Result<()> =
        pool.with_conn(|_| Err(Error::Remote("boom".to_string())));
    assert!(failed.is_err());
    assert_eq!(pool.error_count(), before + 1);

    // The pool still serves fresh sessions afterwards.
    pool.with_conn(|c| {
        assert!(c.ping()?);
        Ok(())
    })
    .unwrap();
}

#[tokio::test]
async fn validation_rejects_bad_diffs_before_the_actor() {
    let server = common::start_server();
    let store = common::open_store(&server);

    let rec = store
        .commit_one(Diff::add(Ref::new("v-1"), Dict::new().set_marker("site")))
        .await
        .unwrap();

    let set_mod = Diff::update(
        &rec,
        Dict::new().set("mod", chrono::Utc::now().with_timezone(&chrono_tz::UTC)),
    )
    .unwrap();
    assert!(matches!(
        store.commit_one(set_mod).await,
        Err(Error::Commit(_))
    ));

    let transient_add =
        Diff::add(Ref::new("v-2"), Dict::new().set_marker("site")).transient();
    assert!(matches!(
        store.commit_one(transient_add).await,
        Err(Error::Commit(_))
    ));

    let empty: Vec<Diff> = Vec::new();
    assert!(store.commit(empty).await.unwrap().is_empty());
}

#[tokio::test]
async fn store_handle_is_cloneable() {
    let server = common::start_server();
    let store = common::open_store(&server);
    let clone = store.clone();

    let rec = clone
        .commit_one(Diff::add(Ref::new("cl-1"), Dict::new().set_marker("site")))
        .await
        .unwrap();
    // Both handles see the same cache and counter.
    assert!(store.read_by_id_opt(rec.id().unwrap()).is_some());
    assert_eq!(store.cur_ver(), clone.cur_ver());
}
