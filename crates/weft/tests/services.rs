// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Service call scenarios across two cores in one process.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use weft::{Error, Node, NodeOptions, NodeShared, Result, ServicePublisher};

fn isolated_core() -> Arc<NodeShared> {
    NodeShared::with_ports(0, 0).expect("core construction")
}

fn node_on(core: &Arc<NodeShared>, partition: &str) -> Node {
    Node::with_shared(Arc::clone(core), NodeOptions::new().with_partition(partition))
}

/// The discovery record the collaborator would deliver for a service.
fn srv_record(
    core: &Arc<NodeShared>,
    node: &Node,
    scoped_topic: &str,
    req_type: &str,
    rep_type: &str,
) -> ServicePublisher {
    ServicePublisher {
        topic: scoped_topic.to_string(),
        addr: core.my_replier_address().to_string(),
        socket_id: core.replier_id(),
        p_uuid: core.p_uuid(),
        n_uuid: node.n_uuid(),
        req_type: req_type.to_string(),
        rep_type: rep_type.to_string(),
    }
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn echo_across_cores() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "svc");
    let node_b = node_on(&core_b, "svc");

    node_a.advertise_service("/echo", |req: String| Some(req))?;
    core_b.on_new_srv_connection(srv_record(&core_a, &node_a, "@svc@/echo", "string", "string"));

    let reply: String = node_b.request("/echo", &"ping".to_string(), Duration::from_secs(5))?;
    assert_eq!(reply, "ping");
    Ok(())
}

#[test]
fn request_before_connection_is_flushed_exactly_once() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "svc");
    let node_b = node_on(&core_b, "svc");

    node_a.advertise_service("/late", |req: i64| Some(req + 1))?;

    // Request first: nothing is connected yet, the request parks.
    let future = node_b.request_async::<i64, i64>("/late", &41, Some(Duration::from_secs(5)))?;
    assert_eq!(core_b.counters().requests_sent.load(Ordering::Relaxed), 0);
    assert_eq!(core_b.pending_requests("@svc@/late"), 1);

    // Discovery catches up; the pending request goes out exactly once.
    core_b.on_new_srv_connection(srv_record(&core_a, &node_a, "@svc@/late", "int64", "int64"));

    assert_eq!(future.wait()?, 42);
    assert_eq!(core_b.counters().requests_sent.load(Ordering::Relaxed), 1);
    assert_eq!(core_b.pending_requests("@svc@/late"), 0);
    Ok(())
}

#[test]
fn timeout_without_replier_cleans_the_pending_table() -> Result<()> {
    let core = isolated_core();
    let node = node_on(&core, "svc");

    let started = Instant::now();
    let result: Result<String> =
        node.request("/void", &"ping".to_string(), Duration::from_millis(100));

    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(core.pending_requests("@svc@/void"), 0);
    assert_eq!(core.counters().requests_expired.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn late_reply_after_timeout_is_dropped() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "svc");
    let node_b = node_on(&core_b, "svc");

    // Replier is slower than the caller's patience.
    node_a.advertise_service("/slow", |req: String| {
        std::thread::sleep(Duration::from_millis(400));
        Some(req)
    })?;
    core_b.on_new_srv_connection(srv_record(&core_a, &node_a, "@svc@/slow", "string", "string"));

    let result: Result<String> =
        node_b.request("/slow", &"ping".to_string(), Duration::from_millis(100));
    assert!(matches!(result, Err(Error::Timeout)));

    // The reply still arrives, finds no pending request, and is dropped.
    assert!(
        wait_until(
            || core_b.counters().responses_orphaned.load(Ordering::Relaxed) >= 1,
            Duration::from_secs(5),
        ),
        "late reply was never observed"
    );
    assert_eq!(core_b.pending_requests("@svc@/slow"), 0);
    Ok(())
}

#[test]
fn replier_failure_propagates_as_service_failure() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "svc");
    let node_b = node_on(&core_b, "svc");

    node_a.advertise_service("/picky", |_req: String| None::<String>)?;
    core_b.on_new_srv_connection(srv_record(&core_a, &node_a, "@svc@/picky", "string", "string"));

    let result: Result<String> =
        node_b.request("/picky", &"ping".to_string(), Duration::from_secs(5));
    assert!(matches!(result, Err(Error::ServiceFailure)));
    Ok(())
}

#[test]
fn type_mismatched_service_is_not_invoked() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "svc");
    let node_b = node_on(&core_b, "svc");

    // Replier speaks strings; the caller asks for int64 echo.
    node_a.advertise_service("/echo", |req: String| Some(req))?;
    core_b.on_new_srv_connection(srv_record(&core_a, &node_a, "@svc@/echo", "string", "string"));

    let result: Result<i64> = node_b.request("/echo", &7i64, Duration::from_millis(300));
    assert!(result.is_err());
    Ok(())
}

#[test]
fn concurrent_requests_correlate_correctly() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "svc");
    let node_b = node_on(&core_b, "svc");

    node_a.advertise_service("/double", |req: i64| Some(req * 2))?;
    core_b.on_new_srv_connection(srv_record(&core_a, &node_a, "@svc@/double", "int64", "int64"));

    let futures: Vec<_> = (0..8)
        .map(|i| {
            node_b
                .request_async::<i64, i64>("/double", &i, Some(Duration::from_secs(5)))
                .unwrap()
        })
        .collect();
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(future.wait()?, (i as i64) * 2);
    }
    Ok(())
}

#[test]
fn shutdown_cancels_outstanding_requests() -> Result<()> {
    let core = isolated_core();
    let node = node_on(&core, "svc");

    let future = node.request_async::<String, String>("/void", &"ping".to_string(), None)?;
    drop(node);
    drop(core);

    // Node drop cancels its requests; core drop would otherwise complete
    // them with a shutdown error. Either way the caller unblocks.
    match future.wait() {
        Err(Error::Cancelled) | Err(Error::Shutdown) => Ok(()),
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }
}
