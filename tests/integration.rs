//! Integration tests for the graph cache.

use crossbeam_channel::Receiver;
use graphcache::{
    CacheConfig, Call, ChannelTransport, DataId, FetchError, FetchMode, FetchOutcome, FetchRequest,
    FetchState, Field, FragmentRegistry, GraphCache, InlineFragment, QueryNode, RecordState, Root,
    Selection, SubscriptionEvent,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn test_cache() -> (GraphCache, Receiver<FetchRequest>) {
    init_tracing();
    let (transport, requests) = ChannelTransport::new();
    (GraphCache::new(transport), requests)
}

fn user_query(fields: &[&str]) -> QueryNode {
    Root::new("node")
        .with_call("id", "1")
        .with_children(fields.iter().map(|f| Field::scalar(*f).into()).collect())
        .into()
}

fn friends_query(first: u64) -> QueryNode {
    Root::new("node")
        .with_call("id", "1")
        .with_children(vec![
            Field::scalar("id").into(),
            Field::connection(
                "friends",
                vec![
                    Field::plural(
                        "edges",
                        vec![
                            Field::scalar("cursor").into(),
                            Field::linked("node", vec![Field::scalar("id").into(), Field::scalar("name").into()])
                                .into(),
                        ],
                    )
                    .into(),
                    Field::linked("pageInfo", vec![Field::scalar("hasNextPage").into()]).into(),
                ],
            )
            .with_call("first", first)
            .into(),
        ])
        .into()
}

fn friends_page(from: u32, to: u32, has_next: bool) -> Value {
    let edges: Vec<Value> = (from..=to)
        .map(|i| {
            json!({
                "cursor": format!("c{}", i),
                "node": {"id": format!("f{}", i), "name": format!("Friend {}", i)}
            })
        })
        .collect();
    json!({"id": "1", "friends": {"edges": edges, "pageInfo": {"hasNextPage": has_next}}})
}

fn friends_field(query: &QueryNode) -> &Field {
    query
        .children()
        .iter()
        .filter_map(QueryNode::as_field)
        .find(|f| f.name == "friends")
        .unwrap()
}

// --- Diffing against the store ---

#[test]
fn test_empty_store_diff_returns_query() {
    let (cache, _requests) = test_cache();
    let query = user_query(&["name"]);
    assert_eq!(cache.diff(&query, &DataId::new("1")).unwrap(), Some(query.clone()));
}

#[test]
fn test_written_payload_closes_diff() {
    let (cache, _requests) = test_cache();
    let query = user_query(&["name"]);
    cache.write_payload(&query, &json!({"id": "1", "name": "Zuck"})).unwrap();
    assert_eq!(cache.diff(&query, &DataId::new("1")).unwrap(), None);

    // Only the new field is missing.
    let wider = user_query(&["name", "birthday"]);
    assert_eq!(
        cache.diff(&wider, &DataId::new("1")).unwrap(),
        Some(user_query(&["birthday"]))
    );
}

#[test]
fn test_diff_then_apply_closes_gap() {
    let (cache, requests) = test_cache();
    cache
        .write_payload(&user_query(&["name"]), &json!({"id": "1", "name": "Zuck"}))
        .unwrap();

    let handle = cache
        .fetch(&user_query(&["name", "birthday"]), FetchMode::CacheFirst)
        .unwrap();
    let request = requests.try_recv().unwrap();
    assert_eq!(request.query, user_query(&["birthday"]));

    cache
        .complete_fetch(request.id, Ok(json!({"id": "1", "birthday": "1984-05-14"})))
        .unwrap();
    assert!(matches!(handle.try_recv().unwrap(), FetchOutcome::Resolved { .. }));
    assert_eq!(
        cache
            .diff(&user_query(&["name", "birthday"]), &DataId::new("1"))
            .unwrap(),
        None
    );

    let data = cache
        .resolve(&user_query(&["name", "birthday"]), &DataId::new("1"))
        .unwrap()
        .unwrap();
    assert_eq!(data.to_json(), json!({"name": "Zuck", "birthday": "1984-05-14"}));
}

#[test]
fn test_fragment_on_other_type_is_skipped() {
    let (cache, _requests) = test_cache();
    let query: QueryNode = Root::new("node")
        .with_call("id", "1")
        .with_children(vec![
            Field::scalar("__typename").into(),
            Field::scalar("name").into(),
            InlineFragment::new("Page", vec![Field::scalar("likers").into()]).into(),
        ])
        .into();
    cache
        .write_payload(&query, &json!({"id": "1", "__typename": "User", "name": "Zuck"}))
        .unwrap();
    assert_eq!(cache.diff(&query, &DataId::new("1")).unwrap(), None);
}

#[test]
fn test_registry_built_query_round_trip() {
    let (cache, _requests) = test_cache();
    let mut registry = FragmentRegistry::new();
    registry
        .define("UserName", "User", vec![Field::scalar("name").into()])
        .unwrap();
    registry
        .define(
            "UserCard",
            "User",
            vec![Selection::spread("UserName"), Field::scalar("photo").into()],
        )
        .unwrap();
    registry.check().unwrap();

    let query = registry
        .build(
            Root::new("node").with_call("id", "1"),
            vec![Field::scalar("__typename").into(), Selection::spread("UserCard")],
        )
        .unwrap();
    cache
        .write_payload(
            &query,
            &json!({"id": "1", "__typename": "User", "name": "Zuck", "photo": "zuck.jpg"}),
        )
        .unwrap();
    assert_eq!(cache.diff(&query, &DataId::new("1")).unwrap(), None);
}

// --- Fetching ---

#[test]
fn test_identical_fetches_send_once() {
    let (cache, requests) = test_cache();
    let a = cache.fetch(&user_query(&["name"]), FetchMode::CacheFirst).unwrap();
    let b = cache.fetch(&user_query(&["name"]), FetchMode::CacheFirst).unwrap();
    assert_eq!(requests.try_iter().count(), 1);
    assert_eq!(cache.fetch_state(b.id), Some(FetchState::Fetched));

    cache
        .complete_fetch(a.id, Ok(json!({"id": "1", "name": "Zuck"})))
        .unwrap();
    let expected = FetchOutcome::Resolved {
        root_id: Some(DataId::new("1")),
    };
    assert_eq!(a.try_recv().unwrap(), expected);
    assert_eq!(b.try_recv().unwrap(), expected);
    assert_eq!(cache.stats().pending_fetches, 0);
}

#[test]
fn test_fetches_with_different_variables_are_sent_separately() {
    let (cache, requests) = test_cache();
    let search = |term: &str| -> QueryNode {
        Root::new("search")
            .with_variable("term", term)
            .with_children(vec![Field::scalar("id").into(), Field::scalar("title").into()])
            .into()
    };

    let cats = cache.fetch(&search("cats"), FetchMode::Refetch).unwrap();
    let dogs = cache.fetch(&search("dogs"), FetchMode::Refetch).unwrap();
    let sent: Vec<FetchRequest> = requests.try_iter().collect();
    let terms: Vec<Value> = sent.iter().map(|r| r.variables["term"].clone()).collect();
    assert_eq!(terms, vec![json!("cats"), json!("dogs")]);
    assert_eq!(cache.fetch_state(cats.id), Some(FetchState::Fetching));
    assert_eq!(cache.fetch_state(dogs.id), Some(FetchState::Fetching));

    // The same variables still share one request.
    let again = cache.fetch(&search("cats"), FetchMode::Refetch).unwrap();
    assert!(requests.try_recv().is_err());
    assert_eq!(cache.fetch_state(again.id), Some(FetchState::Fetched));
}

#[test]
fn test_second_page_waits_for_first_page_cursor() {
    let (cache, requests) = test_cache();
    let first = cache.fetch(&friends_query(10), FetchMode::CacheFirst).unwrap();
    let second = cache.fetch(&friends_query(20), FetchMode::CacheFirst).unwrap();

    // Only the first page goes out; the second needs its end cursor.
    assert_eq!(requests.try_iter().count(), 1);
    assert_eq!(cache.fetch_state(second.id), Some(FetchState::Blocked));

    cache
        .complete_fetch(first.id, Ok(friends_page(1, 10, true)))
        .unwrap();
    assert!(matches!(first.try_recv().unwrap(), FetchOutcome::Resolved { .. }));

    let request = requests.try_recv().unwrap();
    assert_eq!(request.id, second.id);
    let friends = friends_field(&request.query);
    assert_eq!(friends.calls, vec![Call::new("first", 10), Call::new("after", "c10")]);
    assert!(second.try_recv().is_err());

    cache
        .complete_fetch(second.id, Ok(friends_page(11, 20, false)))
        .unwrap();
    assert!(matches!(second.try_recv().unwrap(), FetchOutcome::Resolved { .. }));
    assert_eq!(cache.diff(&friends_query(20), &DataId::new("1")).unwrap(), None);

    let data = cache
        .resolve(&friends_query(20), &DataId::new("1"))
        .unwrap()
        .unwrap();
    let edges = data.get("friends").and_then(|f| f.get("edges")).unwrap();
    assert_eq!(edges.as_list().unwrap().len(), 20);
    assert_eq!(
        edges.as_list().unwrap()[19].get("cursor").and_then(|c| c.as_str()),
        Some("c20")
    );
}

#[test]
fn test_abort_rejects_dependent() {
    let (cache, requests) = test_cache();
    let a = cache.fetch(&user_query(&["name"]), FetchMode::CacheFirst).unwrap();
    let b = cache
        .fetch(&user_query(&["name", "birthday"]), FetchMode::CacheFirst)
        .unwrap();
    assert_eq!(requests.try_iter().count(), 2);

    cache.abort(a.id).unwrap();
    assert_eq!(a.try_recv().unwrap(), FetchOutcome::Rejected(FetchError::Aborted(a.id)));
    assert!(matches!(
        b.try_recv().unwrap(),
        FetchOutcome::Rejected(FetchError::Dependency { dependency, .. }) if dependency == a.id
    ));
    assert_eq!(cache.stats().pending_fetches, 0);

    // A late answer for the aborted fetch is ignored.
    cache
        .complete_fetch(a.id, Ok(json!({"id": "1", "name": "Zuck"})))
        .unwrap();
    assert_eq!(cache.record_state(&DataId::new("1")), RecordState::Unknown);
}

#[test]
fn test_worker_thread_answers_fetches() {
    let (transport, requests) = ChannelTransport::new();
    let cache = Arc::new(GraphCache::new(transport));

    let worker = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            while let Ok(request) = requests.recv_timeout(Duration::from_secs(1)) {
                let payload = json!({"id": "1", "name": "Zuck", "birthday": "1984-05-14"});
                cache.complete_fetch(request.id, Ok(payload)).unwrap();
            }
        })
    };

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let fields: &[&str] = if i % 2 == 0 { &["name"] } else { &["name", "birthday"] };
            cache.fetch(&user_query(fields), FetchMode::CacheFirst).unwrap()
        })
        .collect();
    for handle in &handles {
        let outcome = handle.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, FetchOutcome::Resolved { .. }));
    }
    worker.join().unwrap();

    assert_eq!(
        cache
            .diff(&user_query(&["name", "birthday"]), &DataId::new("1"))
            .unwrap(),
        None
    );
}

// --- Subscriptions ---

#[test]
fn test_update_event_only_on_change() {
    let (cache, _requests) = test_cache();
    let query = user_query(&["name"]);
    let root = DataId::new("1");
    cache.write_payload(&query, &json!({"id": "1", "name": "Zuck"})).unwrap();

    let handle = cache.subscribe(&query, &root).unwrap();
    assert_eq!(handle.initial.as_ref().unwrap().to_json(), json!({"name": "Zuck"}));

    cache.write_payload(&query, &json!({"id": "1", "name": "Mark"})).unwrap();
    match handle.try_recv().unwrap() {
        SubscriptionEvent::Updated { data } => {
            assert_eq!(data.unwrap().to_json(), json!({"name": "Mark"}));
        }
        other => panic!("unexpected event {:?}", other),
    }

    cache.write_payload(&query, &json!({"id": "1", "name": "Mark"})).unwrap();
    assert!(handle.try_recv().is_err());

    // A field outside the query changes the record but not the result.
    cache
        .write_payload(&user_query(&["birthday"]), &json!({"id": "1", "birthday": "1984-05-14"}))
        .unwrap();
    assert!(handle.try_recv().is_err());

    cache.dispose(handle.id).unwrap();
}

#[test]
fn test_slow_subscriber_is_dropped() {
    let (transport, _requests) = ChannelTransport::new();
    let cache = GraphCache::with_config(
        transport,
        CacheConfig {
            subscription_buffer_size: 1,
            ..Default::default()
        },
    );
    let query = user_query(&["name"]);
    let root = DataId::new("1");
    cache.write_payload(&query, &json!({"id": "1", "name": "a"})).unwrap();
    let handle = cache.subscribe(&query, &root).unwrap();

    cache.write_payload(&query, &json!({"id": "1", "name": "b"})).unwrap();
    cache.write_payload(&query, &json!({"id": "1", "name": "c"})).unwrap();

    assert!(matches!(handle.try_recv().unwrap(), SubscriptionEvent::Updated { .. }));
    assert_eq!(cache.stats().subscriptions, 0);
    assert_eq!(cache.reference_count(&root), 0);
}

// --- Garbage collection ---

#[test]
fn test_eviction_after_grace_period() {
    let (transport, _requests) = ChannelTransport::new();
    let grace = Duration::from_secs(30);
    let cache = GraphCache::with_config(
        transport,
        CacheConfig {
            gc_grace_period: grace,
            ..Default::default()
        },
    );
    let query = user_query(&["name"]);
    let root = DataId::new("1");
    cache.write_payload(&query, &json!({"id": "1", "name": "Zuck"})).unwrap();

    let handle = cache.subscribe(&query, &root).unwrap();
    let later = Instant::now() + grace + Duration::from_secs(1);
    assert!(cache.collect_garbage_at(later).unwrap().evicted.is_empty());

    cache.dispose(handle.id).unwrap();
    assert_eq!(cache.record_state(&root), RecordState::Existent);
    assert!(cache.collect_garbage().unwrap().evicted.is_empty());

    let later = Instant::now() + grace + Duration::from_secs(1);
    assert_eq!(cache.collect_garbage_at(later).unwrap().evicted, vec![root.clone()]);
    assert_eq!(cache.record_state(&root), RecordState::Unknown);
    assert_eq!(cache.diff(&query, &root).unwrap(), Some(query.clone()));
}

#[test]
fn test_range_edges_live_as_long_as_connection() {
    let (cache, _requests) = test_cache();
    cache.write_payload(&friends_query(2), &friends_page(1, 2, true)).unwrap();

    let connection = DataId::client(&DataId::new("1"), "friends");
    let edge = DataId::edge(&connection, &DataId::new("f1"));
    assert_eq!(cache.reference_count(&edge), 1);

    cache.retain(&DataId::new("1"));
    let result = cache.collect_garbage_now().unwrap();
    assert!(result.evicted.contains(&connection));
    assert!(result.evicted.contains(&edge));
    assert_eq!(cache.record_state(&DataId::new("1")), RecordState::Existent);
    assert_eq!(cache.record_state(&edge), RecordState::Unknown);
    cache.release(&DataId::new("1")).unwrap();
}

// --- Persistence ---

#[test]
fn test_snapshot_restores_into_fresh_cache() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cache.bin");

    let (cache, _requests) = test_cache();
    cache.write_payload(&friends_query(2), &friends_page(1, 2, false)).unwrap();
    cache.save_snapshot(&path).unwrap();

    let (restored, requests) = test_cache();
    restored.load_snapshot(&path).unwrap();
    assert_eq!(restored.diff(&friends_query(2), &DataId::new("1")).unwrap(), None);

    let handle = restored.fetch(&friends_query(2), FetchMode::CacheFirst).unwrap();
    assert!(requests.try_recv().is_err());
    assert!(matches!(handle.try_recv().unwrap(), FetchOutcome::Resolved { .. }));
}
