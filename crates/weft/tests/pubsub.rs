// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pub/sub scenarios across two cores in one process.
//!
//! The cores talk over real loopback TCP; discovery events are driven
//! directly through the core's entry points so the tests stay
//! deterministic regardless of multicast availability.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::{Message, MessagePublisher, Node, NodeOptions, NodeShared, Publisher, Result};

fn isolated_core() -> Arc<NodeShared> {
    NodeShared::with_ports(0, 0).expect("core construction")
}

fn node_on(core: &Arc<NodeShared>, partition: &str) -> Node {
    Node::with_shared(Arc::clone(core), NodeOptions::new().with_partition(partition))
}

/// The discovery record the collaborator would deliver for a publisher.
fn record_of<M: Message>(core: &Arc<NodeShared>, node: &Node, publisher: &Publisher<M>) -> MessagePublisher {
    MessagePublisher {
        topic: publisher.topic().to_string(),
        addr: core.my_address().to_string(),
        ctrl_addr: core.my_control_address().to_string(),
        p_uuid: core.p_uuid(),
        n_uuid: node.n_uuid(),
        msg_type: M::TYPE_NAME.to_string(),
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
fn remote_raw_subscriber_gets_exact_payload_and_type() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "itest");
    let node_b = node_on(&core_b, "itest");

    let (tx, rx) = mpsc::channel();
    node_b.subscribe_raw_typed("/chat", "string", move |payload, info| {
        let _ = tx.send((payload.to_vec(), info.msg_type.clone()));
    })?;

    let publisher = node_a.advertise::<String>("/chat")?;
    core_b.on_new_connection(record_of(&core_a, &node_a, &publisher));

    // The subscribe announcement must reach A before publishing pays off.
    assert!(
        wait_until(
            || core_a.has_remote_subscribers(publisher.topic(), "string"),
            Duration::from_secs(5),
        ),
        "publisher never learned about the remote subscriber"
    );

    // Republishing until one copy lands keeps the test independent of the
    // connection handshake pacing; the assertion is on content, not count.
    let deadline = Instant::now() + Duration::from_secs(5);
    let (payload, msg_type) = loop {
        assert!(Instant::now() < deadline, "no message arrived");
        publisher.publish(&"hi".to_string())?;
        if let Ok(received) = rx.recv_timeout(Duration::from_millis(100)) {
            break received;
        }
    };
    assert_eq!(payload, b"hi");
    assert_eq!(msg_type, "string");
    Ok(())
}

#[test]
fn publish_without_subscribers_sends_nothing() -> Result<()> {
    let core = isolated_core();
    let node = node_on(&core, "itest");

    let publisher = node.advertise::<String>("/empty")?;
    assert!(!publisher.has_connections());
    publisher.publish(&"anyone?".to_string())?;

    assert_eq!(
        core.counters().data_messages_sent.load(Ordering::Relaxed),
        0
    );
    Ok(())
}

#[test]
fn local_fanout_hits_every_subscriber_without_socket_writes() -> Result<()> {
    let core = isolated_core();
    let node = node_on(&core, "itest");

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = Arc::clone(&hits);
        node.subscribe_raw("/fan", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
    }

    let publisher = node.advertise::<String>("/fan")?;
    publisher.publish(&"x".to_string())?;

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(
        core.counters().data_messages_sent.load(Ordering::Relaxed),
        0
    );
    Ok(())
}

/// Instrumented message type: counts how often its decoder runs.
struct Num(u32);

static NUM_DECODES: AtomicUsize = AtomicUsize::new(0);

impl Message for Num {
    const TYPE_NAME: &'static str = "num";

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.0.to_le_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        NUM_DECODES.fetch_add(1, Ordering::SeqCst);
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| weft::Error::Deserialization("bad width".into()))?;
        Ok(Num(u32::from_le_bytes(arr)))
    }
}

#[test]
fn typed_fanout_decodes_once_per_type() -> Result<()> {
    let core = isolated_core();
    let node = node_on(&core, "itest");

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let counter = Arc::clone(&hits);
        node.subscribe("/sensor", move |msg: &Num, _| {
            assert_eq!(msg.0, 0xDEAD_BEEF);
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
    }
    let raw_hits = Arc::clone(&hits);
    node.subscribe_raw("/sensor", move |payload, _| {
        assert_eq!(payload, 0xDEAD_BEEFu32.to_le_bytes().as_slice());
        raw_hits.fetch_add(1, Ordering::SeqCst);
    })?;

    let publisher = node.advertise::<Num>("/sensor")?;
    publisher.publish(&Num(0xDEAD_BEEF))?;

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(NUM_DECODES.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn foreign_partition_traffic_never_arrives() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "red");
    let node_b = node_on(&core_b, "blue");

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    node_b.subscribe_raw("/chat", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    })?;

    let publisher = node_a.advertise::<String>("/chat")?;
    // Even a (buggy) discovery delivery cannot bridge partitions: the
    // scoped topic names differ, so B has no handlers for it.
    core_b.on_new_connection(record_of(&core_a, &node_a, &publisher));

    publisher.publish(&"hi".to_string())?;
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!core_a.has_remote_subscribers(publisher.topic(), "string"));
    Ok(())
}

#[test]
fn typed_subscriber_across_cores() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "itest");
    let node_b = node_on(&core_b, "itest");

    let (tx, rx) = mpsc::channel();
    node_b.subscribe("/temps", move |msg: &f64, _| {
        let _ = tx.send(*msg);
    })?;

    let publisher = node_a.advertise::<f64>("/temps")?;
    core_b.on_new_connection(record_of(&core_a, &node_a, &publisher));
    assert!(wait_until(
        || core_a.has_remote_subscribers(publisher.topic(), "float64"),
        Duration::from_secs(5),
    ));

    let deadline = Instant::now() + Duration::from_secs(5);
    let got = loop {
        assert!(Instant::now() < deadline, "no sample arrived");
        publisher.publish(&21.5)?;
        if let Ok(sample) = rx.recv_timeout(Duration::from_millis(100)) {
            break sample;
        }
    };
    assert_eq!(got, 21.5);
    Ok(())
}

#[test]
fn unsubscribe_stops_remote_delivery() -> Result<()> {
    let core_a = isolated_core();
    let core_b = isolated_core();
    let node_a = node_on(&core_a, "itest");
    let node_b = node_on(&core_b, "itest");

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    node_b.subscribe_raw("/feed", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    })?;

    let publisher = node_a.advertise::<String>("/feed")?;
    core_b.on_new_connection(record_of(&core_a, &node_a, &publisher));
    assert!(wait_until(
        || core_a.has_remote_subscribers(publisher.topic(), "string"),
        Duration::from_secs(5),
    ));

    assert!(node_b.unsubscribe("/feed")?);
    assert!(wait_until(
        || !core_a.has_remote_subscribers(publisher.topic(), "string"),
        Duration::from_secs(5),
    ));

    publisher.publish(&"after".to_string())?;
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    Ok(())
}
