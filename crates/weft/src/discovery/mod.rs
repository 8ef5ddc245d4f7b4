// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Brokerless peer discovery over UDP multicast.
//!
//! Each core runs two instances: one for message publishers (port 11317) and
//! one for service publishers (port 11318). A dedicated listener thread
//! receives beacons, keeps a per-process activity table, and fires the
//! connection/disconnection callbacks the core reacts to.
//!
//! Beacon kinds:
//! - `Advertise` / `Unadvertise`: a publisher record appeared or went away
//! - `Discover`: "who publishes this topic?" - owners re-advertise
//! - `Heartbeat`: liveness, sent every second
//! - `Bye`: orderly departure; silence longer than three seconds counts
//!   as one too
//!
//! A core that cannot bind the discovery socket keeps working without it:
//! `advertise`/`discover` report `false` and nothing else changes.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use uuid::Uuid;

use crate::config::{HEARTBEAT_INTERVAL, MULTICAST_GROUP, SILENCE_INTERVAL};
use crate::error::{Error, Result};
use crate::publisher::PublisherRecord;
use crate::storage::TopicStorage;
use crate::transport::codec::{pack_frames, unpack_frames};
use crate::wire::{parse_utf8, parse_uuid};

/// Wire protocol revision of the beacons.
const BEACON_VERSION: u8 = 1;

/// Receive timeout of the listener loop; also paces heartbeat checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Callback fired with the affected publisher record.
pub type DiscoveryCallback<P> = Box<dyn Fn(&P) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeaconKind {
    Advertise = 1,
    Unadvertise = 2,
    Discover = 3,
    Heartbeat = 4,
    Bye = 5,
}

impl BeaconKind {
    fn parse(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(BeaconKind::Advertise),
            2 => Ok(BeaconKind::Unadvertise),
            3 => Ok(BeaconKind::Discover),
            4 => Ok(BeaconKind::Heartbeat),
            5 => Ok(BeaconKind::Bye),
            _ => Err(Error::MalformedFrame("beacon kind")),
        }
    }
}

fn build_beacon(kind: BeaconKind, p_uuid: Uuid, extra: Vec<Vec<u8>>) -> Vec<u8> {
    let mut frames = Vec::with_capacity(3 + extra.len());
    frames.push(vec![BEACON_VERSION]);
    frames.push(vec![kind as u8]);
    frames.push(p_uuid.to_string().into_bytes());
    frames.extend(extra);
    pack_frames(&frames)
}

struct Beacon {
    kind: BeaconKind,
    p_uuid: Uuid,
    extra: Vec<Vec<u8>>,
}

fn parse_beacon(datagram: &[u8]) -> Result<Beacon> {
    let mut frames = unpack_frames(datagram)?;
    if frames.len() < 3 {
        return Err(Error::MalformedFrame("beacon arity"));
    }
    let extra = frames.split_off(3);
    if frames[0] != [BEACON_VERSION] {
        return Err(Error::MalformedFrame("beacon version"));
    }
    if frames[1].len() != 1 {
        return Err(Error::MalformedFrame("beacon kind"));
    }
    Ok(Beacon {
        kind: BeaconKind::parse(frames[1][0])?,
        p_uuid: parse_uuid(&frames[2], "beacon process uuid")?,
        extra,
    })
}

struct DiscState<P> {
    /// Records this process advertised.
    local: TopicStorage<P>,
    /// Records learned from peers.
    remote: TopicStorage<P>,
    /// Last time each peer was heard from.
    activity: HashMap<Uuid, Instant>,
}

struct Inner<P> {
    p_uuid: Uuid,
    port: u16,
    socket: Option<UdpSocket>,
    state: Mutex<DiscState<P>>,
    connection_cb: Mutex<Option<DiscoveryCallback<P>>>,
    disconnection_cb: Mutex<Option<DiscoveryCallback<P>>>,
    exit: AtomicBool,
    malformed: AtomicU64,
}

/// One discovery plane (messages or services).
pub struct Discovery<P> {
    inner: Arc<Inner<P>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PublisherRecord> Discovery<P> {
    /// Open the multicast socket. A bind failure disables this plane
    /// instead of failing the core.
    pub fn new(p_uuid: Uuid, port: u16) -> Self {
        let socket = match open_multicast_socket(port) {
            Ok(socket) => Some(socket),
            Err(e) => {
                log::warn!("discovery on port {} unavailable: {}", port, e);
                None
            }
        };
        Self {
            inner: Arc::new(Inner {
                p_uuid,
                port,
                socket,
                state: Mutex::new(DiscState {
                    local: TopicStorage::new(),
                    remote: TopicStorage::new(),
                    activity: HashMap::new(),
                }),
                connection_cb: Mutex::new(None),
                disconnection_cb: Mutex::new(None),
                exit: AtomicBool::new(false),
                malformed: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.socket.is_some()
    }

    /// Datagrams dropped as unparsable.
    pub fn malformed_count(&self) -> u64 {
        self.inner.malformed.load(Ordering::Relaxed)
    }

    pub fn set_connections_cb(&self, cb: impl Fn(&P) + Send + Sync + 'static) {
        *self.inner.connection_cb.lock() = Some(Box::new(cb));
    }

    pub fn set_disconnections_cb(&self, cb: impl Fn(&P) + Send + Sync + 'static) {
        *self.inner.disconnection_cb.lock() = Some(Box::new(cb));
    }

    /// Spawn the listener thread. No-op when the socket is unavailable or
    /// the thread is already running.
    pub fn start(&self) {
        if !self.is_enabled() {
            return;
        }
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let name = format!("weft-discovery-{}", self.inner.port);
        match std::thread::Builder::new()
            .name(name)
            .spawn(move || inner.run())
        {
            Ok(handle) => *slot = Some(handle),
            Err(e) => log::error!("failed to spawn discovery thread: {}", e),
        }
    }

    /// Record and announce a local publisher.
    pub fn advertise(&self, record: &P) -> bool {
        self.inner.state.lock().local.add_publisher(record.clone());
        if !self.is_enabled() {
            return false;
        }
        self.inner
            .send_beacon(BeaconKind::Advertise, record.to_frames());
        true
    }

    /// Withdraw one local publisher.
    pub fn unadvertise(&self, topic: &str, n_uuid: Uuid) -> bool {
        let record = {
            let mut state = self.inner.state.lock();
            let record = state.local.publisher(topic, self.inner.p_uuid, n_uuid).cloned();
            state.local.del_publisher_by_node(topic, self.inner.p_uuid, n_uuid);
            record
        };
        if !self.is_enabled() {
            return false;
        }
        if let Some(record) = record {
            self.inner
                .send_beacon(BeaconKind::Unadvertise, record.to_frames());
        }
        true
    }

    /// Withdraw everything a node advertised, across topics.
    pub fn unadvertise_node(&self, n_uuid: Uuid) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let mut removed = Vec::new();
            for topic in state.local.topics() {
                if let Some(record) =
                    state.local.publisher(&topic, self.inner.p_uuid, n_uuid).cloned()
                {
                    state.local.del_publisher_by_node(&topic, self.inner.p_uuid, n_uuid);
                    removed.push(record);
                }
            }
            removed
        };
        if !self.is_enabled() {
            return false;
        }
        for record in removed {
            self.inner
                .send_beacon(BeaconKind::Unadvertise, record.to_frames());
        }
        true
    }

    /// Ask the fabric who publishes a topic. Peers answer with `Advertise`
    /// beacons; records already known are replayed into the connection
    /// callback right away.
    pub fn discover(&self, topic: &str) -> bool {
        let known = self.inner.state.lock().remote.publishers(topic);
        if let Some(cb) = self.inner.connection_cb.lock().as_ref() {
            for record in &known {
                cb(record);
            }
        }
        if !self.is_enabled() {
            return false;
        }
        self.inner.send_beacon(
            BeaconKind::Discover,
            vec![topic.as_bytes().to_vec()],
        );
        true
    }

    /// Remote records currently known for a topic.
    pub fn remote_publishers(&self, topic: &str) -> Vec<P> {
        self.inner.state.lock().remote.publishers(topic)
    }

    /// Announce departure and stop the listener thread.
    pub fn shutdown(&self) {
        if !self.inner.exit.swap(true, Ordering::AcqRel) && self.is_enabled() {
            self.inner.send_beacon(BeaconKind::Bye, Vec::new());
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<P> Drop for Discovery<P> {
    fn drop(&mut self) {
        self.inner.exit.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<P: PublisherRecord> Inner<P> {
    fn run(self: Arc<Self>) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let mut buf = [0u8; 64 * 1024];
        let mut last_heartbeat = Instant::now();
        self.send_beacon(BeaconKind::Heartbeat, Vec::new());

        while !self.exit.load(Ordering::Acquire) {
            match socket.recv_from(&mut buf) {
                Ok((n, _src)) => self.handle_datagram(&buf[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => log::warn!("discovery recv failed: {}", e),
            }
            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                self.send_beacon(BeaconKind::Heartbeat, Vec::new());
                last_heartbeat = Instant::now();
            }
            self.check_silences(Instant::now());
        }
    }

    fn send_beacon(&self, kind: BeaconKind, extra: Vec<Vec<u8>>) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let datagram = build_beacon(kind, self.p_uuid, extra);
        let dest = SocketAddr::from((MULTICAST_GROUP, self.port));
        if let Err(e) = socket.send_to(&datagram, dest) {
            log::warn!("discovery send failed: {}", e);
        }
    }

    fn handle_datagram(&self, datagram: &[u8]) {
        let beacon = match parse_beacon(datagram) {
            Ok(beacon) => beacon,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping malformed beacon: {}", e);
                return;
            }
        };
        if beacon.p_uuid == self.p_uuid {
            // Our own multicast loopback.
            return;
        }
        self.state
            .lock()
            .activity
            .insert(beacon.p_uuid, Instant::now());

        match beacon.kind {
            BeaconKind::Advertise => match P::from_frames(&beacon.extra) {
                Ok(record) => {
                    self.state.lock().remote.add_publisher(record.clone());
                    if let Some(cb) = self.connection_cb.lock().as_ref() {
                        cb(&record);
                    }
                }
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("dropping malformed advertise: {}", e);
                }
            },
            BeaconKind::Unadvertise => match P::from_frames(&beacon.extra) {
                Ok(record) => {
                    self.state.lock().remote.del_publisher_by_node(
                        record.topic(),
                        record.p_uuid(),
                        record.n_uuid(),
                    );
                    if let Some(cb) = self.disconnection_cb.lock().as_ref() {
                        cb(&record);
                    }
                }
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("dropping malformed unadvertise: {}", e);
                }
            },
            BeaconKind::Discover => {
                let topic = match beacon.extra.first() {
                    Some(frame) => match parse_utf8(frame, "discover topic") {
                        Ok(topic) => topic,
                        Err(_) => {
                            self.malformed.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    },
                    None => {
                        self.malformed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                };
                let owned = self.state.lock().local.publishers(&topic);
                for record in owned {
                    self.send_beacon(BeaconKind::Advertise, record.to_frames());
                }
            }
            BeaconKind::Heartbeat => {}
            BeaconKind::Bye => self.drop_peer(beacon.p_uuid),
        }
    }

    fn check_silences(&self, now: Instant) {
        let stale: Vec<Uuid> = {
            let state = self.state.lock();
            state
                .activity
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) > SILENCE_INTERVAL)
                .map(|(p, _)| *p)
                .collect()
        };
        for p_uuid in stale {
            log::info!("peer {} silent, dropping its publishers", p_uuid);
            self.drop_peer(p_uuid);
        }
    }

    fn drop_peer(&self, p_uuid: Uuid) {
        let removed = {
            let mut state = self.state.lock();
            state.activity.remove(&p_uuid);
            state.remote.del_publishers_by_process(p_uuid)
        };
        if let Some(cb) = self.disconnection_cb.lock().as_ref() {
            for record in &removed {
                cb(record);
            }
        }
    }
}

fn open_multicast_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    let socket: UdpSocket = socket.into();
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}
