//! End-to-end behavioural scenarios, driven through the public API.
//!
//! These run without real networking: the peer table, MQ dispatch core, and
//! script engine are exercised directly; protocol-level flows (group
//! join/relay/full, entangle streams) are covered by the in-crate tests that
//! drive the generic stream handlers over duplex pairs.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use goop_node::config::LuaConfig;
use goop_node::entangle;
use goop_node::limiter::RateLimiter;
use goop_node::mq::MqCore;
use goop_node::peers::{PeerEvent, PeerId, PeerProfile, PeerTable};
use goop_node::ring::Ring;
use goop_node::script::{http, Engine, Identity};

fn caller() -> Identity {
    Identity {
        id: "peer-caller".to_string(),
        label: "caller".to_string(),
    }
}

// ── Scenario: presence TTL ───────────────────────────────────────────

#[test]
fn presence_ttl_offline_then_pruned() {
    let table = PeerTable::new();
    let peer = PeerId::from("peer-p");
    table.upsert(&peer, PeerProfile::default());
    let (_handle, mut rx) = table.subscribe();

    // TTL lapses with no touches: one update flipping the peer offline.
    std::thread::sleep(Duration::from_millis(30));
    let far_past = SystemTime::now() - Duration::from_secs(3600);
    table.prune_stale(SystemTime::now(), far_past);

    match rx.try_recv().expect("expected an update event") {
        PeerEvent::Update(p) => {
            assert!(!p.reachable);
            assert!(p.offline_since.is_some());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(rx.try_recv().is_err(), "exactly one event for the ttl lapse");

    // Grace lapses: one remove event, entry gone.
    table.prune_stale(far_past, SystemTime::now() + Duration::from_millis(1));
    match rx.try_recv().expect("expected a remove event") {
        PeerEvent::Remove(id) => assert_eq!(id, peer),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(table.get(&peer).is_none());
}

// ── Scenario: entangle tie-break ─────────────────────────────────────

#[test]
fn entangle_tie_break_is_asymmetric() {
    let a = PeerId::from("peer-aaaa");
    let b = PeerId::from("peer-bbbb");
    assert!(entangle::initiates(&a, &b), "lower id dials");
    assert!(!entangle::initiates(&b, &a), "higher id waits for the stream");
    // Never both, never neither — a symmetric rule would reset-loop.
    assert_ne!(entangle::initiates(&a, &b), entangle::initiates(&b, &a));
}

// ── Scenario: MQ inbox replay ────────────────────────────────────────

#[tokio::test]
async fn mq_inbox_replay_in_send_order() {
    let core = Arc::new(MqCore::new());
    for n in 0..3 {
        core.dispatch(goop_node::mq::MqMsg {
            from: PeerId::from("peer-p"),
            id: format!("m{n}"),
            seq: n,
            topic: "chat".to_string(),
            payload: serde_json::json!({ "n": n }),
        });
    }
    assert_eq!(core.inbox_len(&PeerId::from("peer-p")), 3);

    let (_handle, mut rx) = core.add_listener();
    for n in 0..3 {
        assert_eq!(rx.try_recv().unwrap().seq, n);
    }
    assert!(rx.try_recv().is_err());
    assert_eq!(core.inbox_len(&PeerId::from("peer-p")), 0);
}

// ── Scenario: script timeout ─────────────────────────────────────────

#[tokio::test]
async fn script_timeout_then_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let lua_dir = dir.path().join("site/lua");
    std::fs::create_dir_all(&lua_dir).unwrap();
    std::fs::write(
        lua_dir.join("spin.lua"),
        "function handle(args)\n  while true do end\nend\n",
    )
    .unwrap();
    std::fs::write(
        lua_dir.join("hello.lua"),
        "function handle(args)\n  return 'hello ' .. args\nend\n",
    )
    .unwrap();

    let cfg = LuaConfig {
        timeout_seconds: 1,
        ..Default::default()
    };
    let engine = Engine::new(
        cfg,
        dir.path(),
        Identity {
            id: "peer-self".to_string(),
            label: "me".to_string(),
        },
        None,
    );

    let start = std::time::Instant::now();
    let err = engine
        .invoke_command(&caller(), "spin", "")
        .await
        .unwrap_err();
    assert!(start.elapsed() <= Duration::from_millis(1500));
    assert!(err.to_string().contains("timed out"), "{err}");

    // The same process serves well-formed commands afterwards.
    let out = engine
        .invoke_command(&caller(), "hello", "again")
        .await
        .unwrap();
    assert_eq!(out.as_deref(), Some("hello again"));
}

// ── Scenario: SSRF block ─────────────────────────────────────────────

#[tokio::test]
async fn ssrf_split_answer_is_blocked() {
    // DNS answering [public, loopback]: the whole answer is poisoned.
    let addrs = vec![
        "203.0.113.5:80".parse().unwrap(),
        "127.0.0.1:80".parse().unwrap(),
    ];
    let err = http::check_addrs(&addrs).unwrap_err();
    assert!(
        err.to_string().contains("private/loopback address blocked"),
        "{err}"
    );

    // And through a data function: no socket, an error result.
    let dir = tempfile::tempdir().unwrap();
    let fn_dir = dir.path().join("site/lua/functions");
    std::fs::create_dir_all(&fn_dir).unwrap();
    std::fs::write(
        fn_dir.join("probe.lua"),
        "function call(request)\n  return goop.http.get('http://127.0.0.1:1/x').body\nend\n",
    )
    .unwrap();
    let engine = Engine::new(
        LuaConfig::default(),
        dir.path(),
        Identity {
            id: "peer-self".to_string(),
            label: "me".to_string(),
        },
        None,
    );
    let err = engine
        .invoke_function(&caller(), "probe", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("private/loopback address blocked"),
        "{err}"
    );
}

// ── Invariants: ring buffer and rate limiter ─────────────────────────

#[test]
fn ring_invariant_holds_for_any_push_sequence() {
    for capacity in [1usize, 3, 8] {
        for pushes in [0usize, 2, 8, 25] {
            let ring = Ring::new(capacity);
            for i in 0..pushes {
                ring.push(i);
            }
            assert_eq!(ring.len(), pushes.min(capacity));
            let expected: Vec<usize> = (pushes.saturating_sub(capacity)..pushes).collect();
            assert_eq!(ring.snapshot(), expected);
        }
    }
}

#[test]
fn limiter_never_admits_beyond_budgets() {
    let limiter = RateLimiter::new(10, 3);
    let mut per_key = 0;
    let mut total = 0;
    for _ in 0..50 {
        if limiter.allow("k1", None) {
            per_key += 1;
        }
    }
    total += per_key;
    assert_eq!(per_key, 3, "per-key budget");

    for key in ["k2", "k3", "k4", "k5"] {
        for _ in 0..10 {
            if limiter.allow(key, None) {
                total += 1;
            }
        }
    }
    assert_eq!(total, 10, "global budget");
}
