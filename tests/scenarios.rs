use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tidedb::{
    CdcEvent, CollectionSpec, Comparator, Condition, IndexSpec, Key, MutatorDef, PullOperation,
    PullResponse, PushAck, RemoteResolver, Scalar, TidedbConfig, TidedbError, TidedbInstance,
};

/// Remote resolver that acknowledges immediately; keeps mutations pending
/// (pushed, not yet pulled) so the overlay stays observable in tests.
fn acking_remote() -> RemoteResolver {
    RemoteResolver::new(|_| async {
        Ok(PushAck {
            server_mutation_id: 1,
        })
    })
}

fn open_db() -> Arc<TidedbInstance> {
    let db = TidedbInstance::open(
        TidedbConfig::development(),
        vec![CollectionSpec::new("todo").with_index(IndexSpec::new("status"))],
    )
    .expect("open");
    db.register_mutator(
        "addTodo",
        MutatorDef::local(|ctx, args| {
            let todos = ctx.collection("todo")?;
            let key = args["key"].as_str().expect("key").to_string();
            todos.insert(key.as_str(), args["value"].clone())?;
            Ok(args)
        })
        .with_remote(acking_remote()),
    );
    db.register_mutator(
        "updateTodo",
        MutatorDef::local(|ctx, args| {
            let todos = ctx.collection("todo")?;
            let key = args["key"].as_str().expect("key").to_string();
            let post = todos.update(key.as_str(), args["delta"].clone())?;
            Ok(post)
        })
        .with_remote(acking_remote()),
    );
    db
}

fn collect_cdc(db: &Arc<TidedbInstance>) -> (Arc<Mutex<Vec<CdcEvent>>>, tidedb::Subscription) {
    let observed: Arc<Mutex<Vec<CdcEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let sub = db.subscribe_to_cdc(move |events| sink.lock().extend(events.iter().cloned()));
    (observed, sub)
}

#[tokio::test]
async fn insert_then_optimistic_update_reads_back_merged() {
    let db = open_db();
    let (observed, _sub) = collect_cdc(&db);

    db.mutate(
        "addTodo",
        json!({"key": "k1", "value": {"title": "a", "status": "incomplete"}}),
    )
    .await
    .expect("insert");
    db.mutate("updateTodo", json!({"key": "k1", "delta": {"title": "b"}}))
        .await
        .expect("update");

    let events = observed.lock().clone();
    assert_eq!(events.len(), 2);
    match &events[0] {
        CdcEvent::Insert { key, value, .. } => {
            assert_eq!(*key, Key::from("k1"));
            assert_eq!(*value, json!({"title": "a", "status": "incomplete"}));
        }
        other => panic!("expected INSERT first, got {other:?}"),
    }
    match &events[1] {
        CdcEvent::Update {
            delta,
            post_update_value,
            ..
        } => {
            assert_eq!(*delta, json!({"title": "b"}));
            assert_eq!(
                *post_update_value,
                json!({"title": "b", "status": "incomplete"})
            );
        }
        other => panic!("expected UPDATE second, got {other:?}"),
    }

    let value = db
        .batch_read(|tx| tx.query_by_key("todo", &Key::from("k1")))
        .await
        .expect("read");
    assert_eq!(value, Some(json!({"title": "b", "status": "incomplete"})));
}

#[tokio::test]
async fn overlay_update_moves_row_into_filtered_set() {
    let db = open_db();
    // k2 exists authoritatively as finished.
    db.apply_change(PullResponse {
        change: BTreeMap::from([(
            "todo".to_string(),
            vec![PullOperation::Created {
                key: Key::from("k2"),
                value: json!({"status": "finished"}),
            }],
        )]),
        cursor: None,
        last_processed_mutation_id: None,
    })
    .await
    .expect("seed");

    db.mutate(
        "updateTodo",
        json!({"key": "k2", "delta": {"status": "incomplete"}}),
    )
    .await
    .expect("update");

    let rows = db
        .batch_read(|tx| {
            tx.query_by_condition("todo", &Condition::new("status", Comparator::Eq, "incomplete"))
        })
        .await
        .expect("read");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, Key::from("k2"));
    assert_eq!(rows[0].value, json!({"status": "incomplete"}));
}

#[tokio::test]
async fn permanently_failing_push_drops_mutation_with_inverse_delete() {
    let db = open_db();
    db.register_mutator(
        "addRejected",
        MutatorDef::local(|ctx, args| {
            ctx.collection("todo")?
                .insert("k9", args["value"].clone())?;
            Ok(args)
        })
        .with_remote(
            RemoteResolver::new(|_| async {
                Err::<PushAck, _>(TidedbError::Remote("server said no".into()))
            })
            .should_retry(false),
        ),
    );
    db.mutate("addRejected", json!({"value": {"title": "doomed"}}))
        .await
        .expect("mutate");
    let (observed, _sub) = collect_cdc(&db);

    db.push().await.expect("push");

    let events = observed.lock().clone();
    assert_eq!(events.len(), 1);
    match &events[0] {
        CdcEvent::Delete { key, value, .. } => {
            assert_eq!(*key, Key::from("k9"));
            assert_eq!(*value, json!({"title": "doomed"}));
        }
        other => panic!("expected inverse DELETE, got {other:?}"),
    }
    assert_eq!(db.pending_mutations_count().unwrap(), 0);
    let value = db
        .batch_read(|tx| tx.query_by_key("todo", &Key::from("k9")))
        .await
        .expect("read");
    assert_eq!(value, None, "optimistic state reverted");
}

#[tokio::test]
async fn pull_with_clear_empties_collection_and_advances_cursor() {
    let db = open_db();
    db.register_mutator(
        "addSynced",
        MutatorDef::local(|ctx, args| {
            ctx.collection("todo")?.insert("k1", args.clone())?;
            Ok(args)
        })
        .with_remote(RemoteResolver::new(|_| async {
            Ok(PushAck {
                server_mutation_id: 5,
            })
        })),
    );
    db.mutate("addSynced", json!({"title": "a"})).await.expect("mutate");
    db.push().await.expect("push");
    assert_eq!(db.pending_mutations_count().unwrap(), 1);

    db.set_puller(|_cursor| async {
        Ok(PullResponse {
            change: BTreeMap::from([("todo".to_string(), vec![PullOperation::Clear])]),
            cursor: Some(Scalar::Text("c2".into())),
            last_processed_mutation_id: Some(5),
        })
    });
    db.pull().await.expect("pull");

    let rows = db
        .batch_read(|tx| tx.query_all("todo"))
        .await
        .expect("read");
    assert!(rows.is_empty(), "collection must be empty, got {rows:?}");
    assert_eq!(db.cursor().unwrap(), Some(Scalar::Text("c2".into())));
    assert_eq!(
        db.pending_mutations_count().unwrap(),
        0,
        "acked mutations garbage-collected"
    );
}

#[tokio::test]
async fn concurrent_subscribers_to_one_option_share_a_snapshot() {
    let db = open_db();
    db.mutate("addTodo", json!({"key": "k1", "value": {"status": "open"}}))
        .await
        .expect("mutate");

    let first: Arc<Mutex<Vec<Vec<tidedb::Row>>>> = Arc::new(Mutex::new(Vec::new()));
    let second: Arc<Mutex<Vec<Vec<tidedb::Row>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink1 = first.clone();
    let sink2 = second.clone();
    let todos = db.collection("todo").unwrap();
    let _a = todos
        .get_all(None)
        .subscribe(move |rows| sink1.lock().push(rows.to_vec()));
    let _b = todos
        .get_all(None)
        .subscribe(move |rows| sink2.lock().push(rows.to_vec()));

    tokio::time::sleep(Duration::from_millis(25)).await;
    let a = first.lock().clone();
    let b = second.lock().clone();
    assert_eq!(a.len(), 1);
    assert_eq!(a, b, "both subscribers see the identical initial snapshot");
    assert_eq!(a[0].len(), 1);
}

#[tokio::test]
async fn pull_gc_never_shows_a_transient_snapshot() {
    let db = open_db();
    db.register_mutator(
        "addSynced",
        MutatorDef::local(|ctx, args| {
            ctx.collection("todo")?
                .insert("k1", args["value"].clone())?;
            Ok(args)
        })
        .with_remote(RemoteResolver::new(|_| async {
            Ok(PushAck {
                server_mutation_id: 1,
            })
        })),
    );
    db.mutate("addSynced", json!({"value": {"title": "a", "status": "open"}}))
        .await
        .expect("mutate");
    db.push().await.expect("push");

    let snapshots: Arc<Mutex<Vec<Vec<tidedb::Row>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = snapshots.clone();
    let _sub = db
        .collection("todo")
        .unwrap()
        .get_all(None)
        .subscribe(move |rows| sink.lock().push(rows.to_vec()));
    tokio::time::sleep(Duration::from_millis(25)).await;

    // The pull acknowledges the mutation and delivers the same document
    // authoritatively.
    db.apply_change(PullResponse {
        change: BTreeMap::from([(
            "todo".to_string(),
            vec![PullOperation::Created {
                key: Key::from("k1"),
                value: json!({"title": "a", "status": "open"}),
            }],
        )]),
        cursor: Some(Scalar::Number(1.0)),
        last_processed_mutation_id: Some(1),
    })
    .await
    .expect("apply");

    let seen = snapshots.lock().clone();
    assert!(!seen.is_empty());
    for snapshot in &seen {
        assert_eq!(
            snapshot.len(),
            1,
            "document visible in every published snapshot: {seen:?}"
        );
        assert_eq!(snapshot[0].key, Key::from("k1"));
    }
    assert_eq!(db.pending_mutations_count().unwrap(), 0);
}

#[tokio::test]
async fn pull_created_over_pending_update_keeps_overlay_on_top() {
    let db = open_db();
    db.apply_change(PullResponse {
        change: BTreeMap::from([(
            "todo".to_string(),
            vec![PullOperation::Created {
                key: Key::from("k"),
                value: json!({"title": "a", "status": "x"}),
            }],
        )]),
        cursor: None,
        last_processed_mutation_id: None,
    })
    .await
    .expect("seed");
    db.mutate("updateTodo", json!({"key": "k", "delta": {"title": "b"}}))
        .await
        .expect("update");

    // Server re-sends the row; the pending delta stays on top of it.
    db.apply_change(PullResponse {
        change: BTreeMap::from([(
            "todo".to_string(),
            vec![PullOperation::Updated {
                key: Key::from("k"),
                value: json!({"title": "a", "status": "y"}),
            }],
        )]),
        cursor: None,
        last_processed_mutation_id: None,
    })
    .await
    .expect("apply");

    let value = db
        .batch_read(|tx| tx.query_by_key("todo", &Key::from("k")))
        .await
        .expect("read");
    assert_eq!(value, Some(json!({"title": "b", "status": "y"})));
}

#[tokio::test]
async fn transient_push_failures_eventually_succeed() {
    let db = open_db();
    let failures_left = Arc::new(AtomicU32::new(2));
    let gate = failures_left.clone();
    db.register_mutator(
        "addFlaky",
        MutatorDef::local(|ctx, args| {
            ctx.collection("todo")?.insert("k1", args.clone())?;
            Ok(args)
        })
        .with_remote(
            RemoteResolver::new(move |_| {
                let gate = gate.clone();
                async move {
                    if gate
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                    {
                        Err(TidedbError::Remote("transient".into()))
                    } else {
                        Ok(PushAck {
                            server_mutation_id: 9,
                        })
                    }
                }
            })
            .should_retry(10u32),
        ),
    );
    db.mutate("addFlaky", json!({"n": 1})).await.expect("mutate");
    db.push().await.expect("push");

    // Still pending (pushed but not yet acked by a pull), value intact.
    assert_eq!(db.pending_mutations_count().unwrap(), 1);
    let value = db
        .batch_read(|tx| tx.query_by_key("todo", &Key::from("k1")))
        .await
        .expect("read");
    assert_eq!(value, Some(json!({"n": 1})));
}

#[tokio::test]
async fn scheduled_pull_runs_while_a_puller_is_configured() {
    let db = TidedbInstance::open(
        TidedbConfig {
            pull_interval_ms: 30,
            ..TidedbConfig::development()
        },
        vec![CollectionSpec::new("todo")],
    )
    .expect("open");
    let pulls = Arc::new(AtomicU32::new(0));
    let counter = pulls.clone();
    db.set_puller(move |_cursor| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(PullResponse::default())
        }
    });
    db.initialize();
    tokio::time::sleep(Duration::from_millis(100)).await;
    db.close();
    assert!(
        pulls.load(Ordering::SeqCst) >= 2,
        "interval pull fired repeatedly"
    );
}
