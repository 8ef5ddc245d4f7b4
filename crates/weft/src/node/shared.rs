// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-process transport core.
//!
//! [`NodeShared`] owns every network endpoint of the process, the handler
//! and peer registries, and the reception thread that multiplexes all
//! inbound sockets. User-facing [`crate::Node`] handles are thin wrappers
//! over it.
//!
//! # Threading
//!
//! One `weft-reception` thread is the sole reader of every socket; user
//! threads only enqueue writes (see [`crate::transport::NetPump`]). All
//! registries sit behind a single mutex. Callbacks are never invoked with
//! that mutex held: dispatch snapshots the handler set, releases the lock,
//! then runs the callbacks, which keeps re-entrant calls into the core
//! (subscribe from inside a callback, say) safe. The shutdown flag is its
//! own atomic so signalling exit never contends with the registries.
//!
//! # Lifecycle
//!
//! Construction binds the endpoints and spawns the threads; any bind
//! failure aborts construction. Dropping the last handle stops the
//! reception thread (exit flag, then a waker nudge, then join), shuts down
//! both discovery planes, and completes every pending request with a
//! shutdown error. If the drop happens to run on the reception thread
//! itself (the thread held the last strong handle), the join is skipped
//! and the thread winds down on its own.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::{MSG_DISCOVERY_PORT, POLL_TIMEOUT, SRV_DISCOVERY_PORT};
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::handlers::{
    type_matches, PendingRequest, RawSubscription, Replier, ResponseFuture, Subscription,
};
use crate::identity::{host_addr, new_uuid};
use crate::message::MessageInfo;
use crate::publisher::{MessagePublisher, ServicePublisher};
use crate::storage::{HandlerStorage, TopicStorage};
use crate::transport::{LinkKind, NetCmd, NetEvent, NetHandle, NetPump, SendTarget};
use crate::wire::{ControlOp, ControlUpdate, ServiceRequest, ServiceResponse, TopicData};

/// Reception-path counters. Everything dropped on the floor is counted
/// somewhere here.
#[derive(Debug, Default)]
pub struct Counters {
    /// Handler skipped because its declared type did not match the message.
    pub type_mismatches: AtomicU64,
    /// Payload bytes that failed to decode into the handler's type.
    pub decode_failures: AtomicU64,
    /// Wire messages with the wrong shape.
    pub malformed_messages: AtomicU64,
    /// User callbacks that panicked (isolated, never fatal).
    pub callback_panics: AtomicU64,
    /// Topic messages handed to the fabric for remote subscribers.
    pub data_messages_sent: AtomicU64,
    /// Service request frames sent.
    pub requests_sent: AtomicU64,
    /// Pending requests that hit their deadline.
    pub requests_expired: AtomicU64,
    /// Responses with no pending request (timed out or cancelled callers).
    pub responses_orphaned: AtomicU64,
}

/// Snapshot of the local handlers of one topic.
pub struct HandlerInfo {
    pub local: Vec<Arc<dyn Subscription>>,
    pub raw: Vec<Arc<dyn RawSubscription>>,
    pub have_local: bool,
    pub have_raw: bool,
}

/// [`HandlerInfo`] extended with remote-subscriber presence; what a
/// publisher needs to decide where a message must go.
pub struct SubscriberInfo {
    pub handlers: HandlerInfo,
    pub have_remote: bool,
}

struct SharedState {
    /// Remote publishers we are connected to for pub/sub.
    connections: TopicStorage<MessagePublisher>,
    /// Service publishers we are connected to for request/response; one
    /// link per distinct replier endpoint.
    srv_connections: Vec<ServicePublisher>,
    /// Remote subscribers, learned over the control channel.
    remote_subscribers: TopicStorage<MessagePublisher>,
    /// Ordinary local subscriptions.
    local_subscriptions: HandlerStorage<dyn Subscription>,
    /// Raw local subscriptions, kept apart so delivery can skip the
    /// deserialize/reserialize pair entirely.
    raw_subscriptions: HandlerStorage<dyn RawSubscription>,
    /// Service call repliers.
    repliers: HandlerStorage<dyn Replier>,
    /// Pending service call requests.
    requests: HandlerStorage<PendingRequest>,
}

/// The transport core. One per process in normal use (see
/// [`NodeShared::instance`]); tests create isolated ones freely.
pub struct NodeShared {
    p_uuid: Uuid,
    /// Identity replies are addressed to.
    response_receiver_id: Uuid,
    /// Identity of the replier endpoint.
    replier_id: Uuid,
    my_address: String,
    my_control_address: String,
    my_replier_address: String,
    state: Mutex<SharedState>,
    net: NetHandle,
    exit: Arc<AtomicBool>,
    reception: Mutex<Option<JoinHandle<()>>>,
    msg_discovery: Discovery<MessagePublisher>,
    srv_discovery: Discovery<ServicePublisher>,
    counters: Counters,
}

static INSTANCE: Mutex<Weak<NodeShared>> = Mutex::new(Weak::new());

impl NodeShared {
    /// The process-wide core, created lazily on first use and torn down
    /// when the last handle drops.
    pub fn instance() -> Result<Arc<Self>> {
        let mut slot = INSTANCE.lock();
        if let Some(core) = slot.upgrade() {
            return Ok(core);
        }
        let core = Self::new()?;
        *slot = Arc::downgrade(&core);
        Ok(core)
    }

    /// A standalone core on the standard discovery ports.
    pub fn new() -> Result<Arc<Self>> {
        Self::with_ports(MSG_DISCOVERY_PORT, SRV_DISCOVERY_PORT)
    }

    /// A standalone core with explicit discovery ports. Port 0 keeps the
    /// core functional while making its discovery plane effectively mute;
    /// tests use that for isolation.
    pub fn with_ports(msg_port: u16, srv_port: u16) -> Result<Arc<Self>> {
        let p_uuid = new_uuid();
        let host = host_addr();
        let (pump, net, endpoints) =
            NetPump::bind(host).map_err(|e| Error::InitFailed(e.to_string()))?;
        log::info!(
            "core {} up: data={} control={} replier={}",
            p_uuid,
            endpoints.data,
            endpoints.control,
            endpoints.replier
        );

        let core = Arc::new(Self {
            p_uuid,
            response_receiver_id: new_uuid(),
            replier_id: new_uuid(),
            my_address: endpoints.data,
            my_control_address: endpoints.control,
            my_replier_address: endpoints.replier,
            state: Mutex::new(SharedState {
                connections: TopicStorage::new(),
                srv_connections: Vec::new(),
                remote_subscribers: TopicStorage::new(),
                local_subscriptions: HandlerStorage::new(),
                raw_subscriptions: HandlerStorage::new(),
                repliers: HandlerStorage::new(),
                requests: HandlerStorage::new(),
            }),
            net,
            exit: Arc::new(AtomicBool::new(false)),
            reception: Mutex::new(None),
            msg_discovery: Discovery::new(p_uuid, msg_port),
            srv_discovery: Discovery::new(p_uuid, srv_port),
            counters: Counters::default(),
        });

        let weak = Arc::downgrade(&core);
        core.msg_discovery.set_connections_cb(move |record| {
            if let Some(core) = weak.upgrade() {
                core.on_new_connection(record.clone());
            }
        });
        let weak = Arc::downgrade(&core);
        core.msg_discovery.set_disconnections_cb(move |record| {
            if let Some(core) = weak.upgrade() {
                core.on_new_disconnection(record);
            }
        });
        let weak = Arc::downgrade(&core);
        core.srv_discovery.set_connections_cb(move |record| {
            if let Some(core) = weak.upgrade() {
                core.on_new_srv_connection(record.clone());
            }
        });
        let weak = Arc::downgrade(&core);
        core.srv_discovery.set_disconnections_cb(move |record| {
            if let Some(core) = weak.upgrade() {
                core.on_new_srv_disconnection(record);
            }
        });

        let weak = Arc::downgrade(&core);
        let exit = Arc::clone(&core.exit);
        let handle = std::thread::Builder::new()
            .name("weft-reception".to_string())
            .spawn(move || reception_loop(pump, weak, exit))
            .map_err(|e| Error::InitFailed(e.to_string()))?;
        *core.reception.lock() = Some(handle);

        core.msg_discovery.start();
        core.srv_discovery.start();

        Ok(core)
    }

    pub fn p_uuid(&self) -> Uuid {
        self.p_uuid
    }

    pub fn response_receiver_id(&self) -> Uuid {
        self.response_receiver_id
    }

    pub fn replier_id(&self) -> Uuid {
        self.replier_id
    }

    /// Data endpoint remote subscribers connect to.
    pub fn my_address(&self) -> &str {
        &self.my_address
    }

    /// Control endpoint for subscriber announcements.
    pub fn my_control_address(&self) -> &str {
        &self.my_control_address
    }

    /// Replier endpoint requesters connect to.
    pub fn my_replier_address(&self) -> &str {
        &self.my_replier_address
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    // ========================================================================
    // Publish path
    // ========================================================================

    /// Publish opaque bytes tagged with a type name.
    ///
    /// Local handlers run on the calling thread; remote delivery is
    /// best-effort and never blocks beyond the socket's send buffer. With
    /// no subscribers anywhere this is a successful no-op.
    pub fn publish(&self, topic: &str, data: &[u8], msg_type: &str) -> Result<()> {
        if self.exit.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if topic.is_empty() {
            return Err(Error::InvalidTopic(topic.to_string()));
        }

        let info = self.check_subscriber_info(topic, msg_type);
        if info.handlers.have_local || info.handlers.have_raw {
            self.trigger_subscriber_callbacks(topic, data, msg_type, &info.handlers);
        }
        if info.have_remote {
            let msg = TopicData {
                topic: topic.to_string(),
                sender: self.my_address.clone(),
                payload: data.to_vec(),
                msg_type: msg_type.to_string(),
            };
            self.net.send(NetCmd::Send {
                target: SendTarget::DataFanout,
                frames: msg.to_frames(),
            });
            self.counters.data_messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Local handlers of a topic.
    pub fn check_handler_info(&self, topic: &str) -> HandlerInfo {
        let state = self.state.lock();
        let local = state.local_subscriptions.handlers(topic);
        let raw = state.raw_subscriptions.handlers(topic);
        HandlerInfo {
            have_local: !local.is_empty(),
            have_raw: !raw.is_empty(),
            local,
            raw,
        }
    }

    /// Local handlers plus remote-subscriber presence for a message type.
    pub fn check_subscriber_info(&self, topic: &str, msg_type: &str) -> SubscriberInfo {
        let state = self.state.lock();
        let local = state.local_subscriptions.handlers(topic);
        let raw = state.raw_subscriptions.handlers(topic);
        let have_remote = state
            .remote_subscribers
            .publishers(topic)
            .iter()
            .any(|r| type_matches(&r.msg_type, msg_type));
        SubscriberInfo {
            handlers: HandlerInfo {
                have_local: !local.is_empty(),
                have_raw: !raw.is_empty(),
                local,
                raw,
            },
            have_remote,
        }
    }

    /// Whether a publish on this topic would currently be serialized for
    /// remote subscribers.
    pub fn has_remote_subscribers(&self, topic: &str, msg_type: &str) -> bool {
        self.state
            .lock()
            .remote_subscribers
            .publishers(topic)
            .iter()
            .any(|r| type_matches(&r.msg_type, msg_type))
    }

    /// Run the subscription callbacks for one message.
    ///
    /// Raw handlers get the original bytes. Typed handlers share one decode
    /// per distinct target type; a handler whose declared type does not
    /// match is skipped and counted. Panicking callbacks are isolated.
    pub fn trigger_subscriber_callbacks(
        &self,
        topic: &str,
        data: &[u8],
        msg_type: &str,
        info: &HandlerInfo,
    ) {
        let msg_info = MessageInfo {
            topic: topic.to_string(),
            msg_type: msg_type.to_string(),
        };

        for handler in &info.raw {
            if !type_matches(handler.expected_type(), msg_type) {
                self.counters.type_mismatches.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| handler.deliver(data, &msg_info))).is_err() {
                self.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
                log::warn!("raw subscriber on {} panicked", topic);
            }
        }

        // One decode serves every typed handler expecting this type. Two
        // distinct Rust types behind the same type name fall back to their
        // own decode (the downcast tells them apart).
        let mut decoded: Option<Arc<dyn std::any::Any + Send + Sync>> = None;
        for handler in &info.local {
            if handler.expected_type() != msg_type {
                self.counters.type_mismatches.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let value = match &decoded {
                Some(value) => Arc::clone(value),
                None => match handler.decode(data) {
                    Ok(value) => {
                        decoded = Some(Arc::clone(&value));
                        value
                    }
                    Err(e) => {
                        self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!("cannot decode {} message on {}: {}", msg_type, topic, e);
                        continue;
                    }
                },
            };
            let delivered =
                match catch_unwind(AssertUnwindSafe(|| handler.deliver(&*value, &msg_info))) {
                    Ok(delivered) => delivered,
                    Err(_) => {
                        self.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
                        log::warn!("subscriber on {} panicked", topic);
                        continue;
                    }
                };
            if !delivered {
                match handler.decode(data) {
                    Ok(own) => {
                        if catch_unwind(AssertUnwindSafe(|| handler.deliver(&*own, &msg_info)))
                            .is_err()
                        {
                            self.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!("cannot decode {} message on {}: {}", msg_type, topic, e);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Subscribe path
    // ========================================================================

    /// Register a typed subscription and go looking for its publishers.
    pub fn subscribe(
        &self,
        topic: &str,
        n_uuid: Uuid,
        handler: Arc<dyn Subscription>,
    ) -> Result<()> {
        if self.exit.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let msg_type = handler.expected_type().to_string();
        let connected = {
            let mut state = self.state.lock();
            state
                .local_subscriptions
                .add_handler(topic, n_uuid, handler.handler_uuid(), handler);
            state.connections.publishers(topic)
        };
        self.announce_subscription(topic, n_uuid, &msg_type, ControlOp::Subscribe, &connected);
        self.msg_discovery.discover(topic);
        Ok(())
    }

    /// Register a raw subscription.
    pub fn subscribe_raw(
        &self,
        topic: &str,
        n_uuid: Uuid,
        handler: Arc<dyn RawSubscription>,
    ) -> Result<()> {
        if self.exit.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let msg_type = handler.expected_type().to_string();
        let connected = {
            let mut state = self.state.lock();
            state
                .raw_subscriptions
                .add_handler(topic, n_uuid, handler.handler_uuid(), handler);
            state.connections.publishers(topic)
        };
        self.announce_subscription(topic, n_uuid, &msg_type, ControlOp::Subscribe, &connected);
        self.msg_discovery.discover(topic);
        Ok(())
    }

    /// Remove one handler. Returns whether something was removed.
    pub fn unsubscribe(&self, topic: &str, n_uuid: Uuid, h_uuid: Uuid) -> bool {
        let (removed, node_done, connected) = {
            let mut state = self.state.lock();
            let removed = state.local_subscriptions.remove_handler(topic, n_uuid, h_uuid)
                || state.raw_subscriptions.remove_handler(topic, n_uuid, h_uuid);
            let node_done = !state.local_subscriptions.nodes(topic).contains(&n_uuid)
                && !state.raw_subscriptions.nodes(topic).contains(&n_uuid);
            (removed, node_done, state.connections.publishers(topic))
        };
        if removed && node_done {
            self.announce_subscription(
                topic,
                n_uuid,
                crate::config::WILDCARD_TYPE,
                ControlOp::Unsubscribe,
                &connected,
            );
        }
        removed
    }

    /// Remove every handler a node holds on a topic.
    pub fn unsubscribe_node(&self, topic: &str, n_uuid: Uuid) -> bool {
        let (removed, connected) = {
            let mut state = self.state.lock();
            let removed = state.local_subscriptions.remove_handlers_for_node(topic, n_uuid)
                | state.raw_subscriptions.remove_handlers_for_node(topic, n_uuid);
            (removed, state.connections.publishers(topic))
        };
        if removed {
            self.announce_subscription(
                topic,
                n_uuid,
                crate::config::WILDCARD_TYPE,
                ControlOp::Unsubscribe,
                &connected,
            );
        }
        removed
    }

    fn announce_subscription(
        &self,
        topic: &str,
        n_uuid: Uuid,
        msg_type: &str,
        op: ControlOp,
        publishers: &[MessagePublisher],
    ) {
        let update = ControlUpdate {
            topic: topic.to_string(),
            p_uuid: self.p_uuid,
            n_uuid,
            msg_type: msg_type.to_string(),
            op,
        };
        for record in publishers {
            self.net.send(NetCmd::Send {
                target: SendTarget::Endpoint {
                    kind: LinkKind::CtrlOut,
                    endpoint: record.ctrl_addr.clone(),
                },
                frames: update.to_frames(),
            });
        }
    }

    // ========================================================================
    // Advertise path
    // ========================================================================

    /// Announce a topic publisher. False when discovery is unavailable.
    pub fn advertise(&self, record: MessagePublisher) -> bool {
        self.msg_discovery.advertise(&record)
    }

    pub fn unadvertise(&self, topic: &str, n_uuid: Uuid) -> bool {
        self.msg_discovery.unadvertise(topic, n_uuid)
    }

    /// Register a replier and announce the service.
    pub fn advertise_service(&self, record: ServicePublisher, replier: Arc<dyn Replier>) -> bool {
        self.state.lock().repliers.add_handler(
            &record.topic,
            record.n_uuid,
            replier.handler_uuid(),
            replier,
        );
        self.srv_discovery.advertise(&record)
    }

    pub fn unadvertise_service(&self, topic: &str, n_uuid: Uuid) -> bool {
        self.state.lock().repliers.remove_handlers_for_node(topic, n_uuid);
        self.srv_discovery.unadvertise(topic, n_uuid)
    }

    // ========================================================================
    // Service call path
    // ========================================================================

    /// Issue a service call. The returned future resolves with the reply,
    /// a failure status, a timeout, or a shutdown error.
    ///
    /// A replier living in this process is invoked directly on the calling
    /// thread, error semantics unchanged. Otherwise the request is parked
    /// in the pending table and sent as soon as a matching replier is
    /// connected; discovery is nudged if none is yet.
    pub fn request(
        &self,
        topic: &str,
        n_uuid: Uuid,
        req_type: &str,
        rep_type: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<ResponseFuture> {
        if self.exit.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let local = self.state.lock().repliers.first_handler(topic, |r| {
            r.req_type() == req_type && r.rep_type() == rep_type
        });
        if let Some(replier) = local {
            let (pending, future) =
                PendingRequest::new(topic, n_uuid, req_type, rep_type, Vec::new(), None);
            let result = match catch_unwind(AssertUnwindSafe(|| replier.handle(payload))) {
                Ok(result) => result,
                Err(_) => {
                    self.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
                    Err(Error::ServiceFailure)
                }
            };
            pending.complete(result);
            return Ok(future);
        }

        let deadline = timeout.map(|d| Instant::now() + d);
        let (pending, future) =
            PendingRequest::new(topic, n_uuid, req_type, rep_type, payload.to_vec(), deadline);
        self.state
            .lock()
            .requests
            .add_handler(topic, n_uuid, pending.req_uuid(), Arc::clone(&pending));

        match self.connected_replier(topic, req_type, rep_type) {
            Some(addr) => self.send_request(&addr, &pending),
            None => {
                // Stays pending until a service connection flushes it.
                self.srv_discovery.discover(topic);
            }
        }
        Ok(future)
    }

    /// Pending requests parked for a topic.
    pub fn pending_requests(&self, topic: &str) -> usize {
        self.state.lock().requests.handlers(topic).len()
    }

    /// Flush pending requests that became deliverable.
    pub fn send_pending_remote_reqs(&self, topic: &str, req_type: &str, rep_type: &str) {
        let Some(addr) = self.connected_replier(topic, req_type, rep_type) else {
            return;
        };
        let deliverable: Vec<Arc<PendingRequest>> = self
            .state
            .lock()
            .requests
            .handlers(topic)
            .into_iter()
            .filter(|p| !p.is_sent() && p.req_type() == req_type && p.rep_type() == rep_type)
            .collect();
        for pending in deliverable {
            self.send_request(&addr, &pending);
        }
    }

    /// A connected replier endpoint serving `(topic, req_type, rep_type)`.
    fn connected_replier(&self, topic: &str, req_type: &str, rep_type: &str) -> Option<String> {
        self.state
            .lock()
            .srv_connections
            .iter()
            .find(|r| r.topic == topic && r.req_type == req_type && r.rep_type == rep_type)
            .map(|r| r.addr.clone())
    }

    fn send_request(&self, addr: &str, pending: &PendingRequest) {
        if !pending.try_mark_sent() {
            return;
        }
        let msg = ServiceRequest {
            topic: pending.topic().to_string(),
            reply_to: self.response_receiver_id,
            n_uuid: pending.n_uuid(),
            req_uuid: pending.req_uuid(),
            req_type: pending.req_type().to_string(),
            rep_type: pending.rep_type().to_string(),
            payload: pending.payload().to_vec(),
        };
        self.net.send(NetCmd::Send {
            target: SendTarget::Endpoint {
                kind: LinkKind::ReqOut,
                endpoint: addr.to_string(),
            },
            frames: msg.to_frames(),
        });
        self.counters.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Service publishers currently known for a topic.
    pub fn topic_publishers(&self, topic: &str) -> Vec<ServicePublisher> {
        self.srv_discovery.remote_publishers(topic)
    }

    /// Ask discovery for a service. False when discovery is unavailable.
    pub fn discover_service(&self, topic: &str) -> bool {
        self.srv_discovery.discover(topic)
    }

    // ========================================================================
    // Discovery events
    // ========================================================================

    /// A remote topic publisher appeared.
    pub fn on_new_connection(&self, publisher: MessagePublisher) {
        if publisher.p_uuid == self.p_uuid {
            // In-process publishers are served by direct fanout.
            return;
        }
        {
            let mut state = self.state.lock();
            let interested = state
                .local_subscriptions
                .has_handlers_for_topic(&publisher.topic)
                || state.raw_subscriptions.has_handlers_for_topic(&publisher.topic);
            if !interested {
                return;
            }
            let already = state
                .connections
                .publisher(&publisher.topic, publisher.p_uuid, publisher.n_uuid)
                .is_some();
            state.connections.add_publisher(publisher.clone());
            if already {
                // Announce once per connected transition.
                return;
            }
        }

        log::debug!(
            "connecting to publisher of {} at {}",
            publisher.topic,
            publisher.addr
        );
        self.net.send(NetCmd::Connect {
            kind: LinkKind::SubOut,
            endpoint: publisher.addr.clone(),
        });
        self.net.send(NetCmd::Connect {
            kind: LinkKind::CtrlOut,
            endpoint: publisher.ctrl_addr.clone(),
        });
        self.announce_all_subscribers(&publisher);
    }

    /// Announce every local subscriber of the topic to one publisher.
    fn announce_all_subscribers(&self, publisher: &MessagePublisher) {
        let updates = {
            let state = self.state.lock();
            let mut updates: Vec<(Uuid, String)> = Vec::new();
            for (n_uuid, handler) in state.local_subscriptions.entries(&publisher.topic) {
                updates.push((n_uuid, handler.expected_type().to_string()));
            }
            for (n_uuid, handler) in state.raw_subscriptions.entries(&publisher.topic) {
                updates.push((n_uuid, handler.expected_type().to_string()));
            }
            updates.sort();
            updates.dedup();
            updates
        };
        for (n_uuid, msg_type) in updates {
            let update = ControlUpdate {
                topic: publisher.topic.clone(),
                p_uuid: self.p_uuid,
                n_uuid,
                msg_type,
                op: ControlOp::Subscribe,
            };
            self.net.send(NetCmd::Send {
                target: SendTarget::Endpoint {
                    kind: LinkKind::CtrlOut,
                    endpoint: publisher.ctrl_addr.clone(),
                },
                frames: update.to_frames(),
            });
        }
    }

    /// A remote topic publisher went away.
    pub fn on_new_disconnection(&self, publisher: &MessagePublisher) {
        if publisher.p_uuid == self.p_uuid {
            return;
        }
        let last_use = {
            let mut state = self.state.lock();
            state.connections.del_publisher_by_node(
                &publisher.topic,
                publisher.p_uuid,
                publisher.n_uuid,
            );
            state.remote_subscribers.del_publisher_by_node(
                &publisher.topic,
                publisher.p_uuid,
                publisher.n_uuid,
            );
            !state.connections.has_publisher(&publisher.addr)
        };
        if last_use {
            log::debug!("dropping links to departed publisher at {}", publisher.addr);
            self.net.send(NetCmd::Disconnect {
                endpoint: publisher.addr.clone(),
            });
            self.net.send(NetCmd::Disconnect {
                endpoint: publisher.ctrl_addr.clone(),
            });
        }
    }

    /// A remote service appeared: connect and flush anything waiting.
    pub fn on_new_srv_connection(&self, publisher: ServicePublisher) {
        if publisher.p_uuid == self.p_uuid {
            return;
        }
        let new_link = {
            let mut state = self.state.lock();
            let new_link = !state.srv_connections.iter().any(|r| r.addr == publisher.addr);
            let known = state.srv_connections.iter().any(|r| {
                r.topic == publisher.topic
                    && r.p_uuid == publisher.p_uuid
                    && r.n_uuid == publisher.n_uuid
            });
            if !known {
                state.srv_connections.push(publisher.clone());
            }
            new_link
        };
        if new_link {
            log::debug!(
                "connecting to replier of {} at {}",
                publisher.topic,
                publisher.addr
            );
            self.net.send(NetCmd::Connect {
                kind: LinkKind::ReqOut,
                endpoint: publisher.addr.clone(),
            });
        }
        self.send_pending_remote_reqs(&publisher.topic, &publisher.req_type, &publisher.rep_type);
    }

    /// A remote service went away.
    pub fn on_new_srv_disconnection(&self, publisher: &ServicePublisher) {
        if publisher.p_uuid == self.p_uuid {
            return;
        }
        let last_use = {
            let mut state = self.state.lock();
            state.srv_connections.retain(|r| {
                !(r.topic == publisher.topic
                    && r.p_uuid == publisher.p_uuid
                    && r.n_uuid == publisher.n_uuid)
            });
            !state.srv_connections.iter().any(|r| r.addr == publisher.addr)
        };
        if last_use {
            self.net.send(NetCmd::Disconnect {
                endpoint: publisher.addr.clone(),
            });
        }
    }

    // ========================================================================
    // Reception dispatch
    // ========================================================================

    fn dispatch(&self, event: NetEvent) {
        match event {
            NetEvent::Message {
                kind,
                link,
                peer,
                frames,
            } => match kind {
                LinkKind::SubOut => self.recv_msg_update(&frames),
                LinkKind::ControlIn => self.recv_control_update(&frames, &peer),
                LinkKind::ReplierIn => self.recv_srv_request(link, &frames),
                LinkKind::ReqOut => self.recv_srv_response(&frames),
                LinkKind::DataIn | LinkKind::CtrlOut => {
                    log::debug!("ignoring unexpected message on {} link from {}", kind, peer);
                }
            },
            NetEvent::Disconnected { kind, endpoint } => {
                if kind == LinkKind::ReqOut {
                    self.state
                        .lock()
                        .srv_connections
                        .retain(|r| r.addr != endpoint);
                }
                log::debug!("{} link to {} gone", kind, endpoint);
            }
        }
    }

    /// Topic data arrived from a remote publisher.
    fn recv_msg_update(&self, frames: &[Vec<u8>]) {
        let msg = match TopicData::from_frames(frames) {
            Ok(msg) => msg,
            Err(e) => {
                self.counters.malformed_messages.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping bad topic data: {}", e);
                return;
            }
        };
        let info = self.check_handler_info(&msg.topic);
        if info.have_local || info.have_raw {
            self.trigger_subscriber_callbacks(&msg.topic, &msg.payload, &msg.msg_type, &info);
        }
    }

    /// A remote subscriber announced or withdrew itself.
    fn recv_control_update(&self, frames: &[Vec<u8>], peer: &str) {
        let update = match ControlUpdate::from_frames(frames) {
            Ok(update) => update,
            Err(e) => {
                self.counters.malformed_messages.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping bad control update: {}", e);
                return;
            }
        };
        if update.p_uuid == self.p_uuid {
            return;
        }
        match update.op {
            ControlOp::Subscribe => {
                log::debug!(
                    "remote subscriber on {} ({}) from {}",
                    update.topic,
                    update.msg_type,
                    peer
                );
                self.state.lock().remote_subscribers.add_publisher(MessagePublisher {
                    topic: update.topic,
                    addr: peer.to_string(),
                    ctrl_addr: peer.to_string(),
                    p_uuid: update.p_uuid,
                    n_uuid: update.n_uuid,
                    msg_type: update.msg_type,
                });
            }
            ControlOp::Unsubscribe => {
                self.state.lock().remote_subscribers.del_publisher_by_node(
                    &update.topic,
                    update.p_uuid,
                    update.n_uuid,
                );
            }
        }
    }

    /// A service request arrived; serve it and reply on the same link.
    fn recv_srv_request(&self, link: u64, frames: &[Vec<u8>]) {
        let request = match ServiceRequest::from_frames(frames) {
            Ok(request) => request,
            Err(e) => {
                self.counters.malformed_messages.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping bad service request: {}", e);
                return;
            }
        };
        let replier = self.state.lock().repliers.first_handler(&request.topic, |r| {
            r.req_type() == request.req_type && r.rep_type() == request.rep_type
        });
        let (ok, payload) = match replier {
            Some(replier) => {
                match catch_unwind(AssertUnwindSafe(|| replier.handle(&request.payload))) {
                    Ok(Ok(bytes)) => (true, bytes),
                    Ok(Err(e)) => {
                        log::debug!("replier for {} failed: {}", request.topic, e);
                        (false, Vec::new())
                    }
                    Err(_) => {
                        self.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
                        log::warn!("replier for {} panicked", request.topic);
                        (false, Vec::new())
                    }
                }
            }
            None => {
                log::debug!("no replier for {}", request.topic);
                (false, Vec::new())
            }
        };
        let response = ServiceResponse {
            dest: request.reply_to,
            topic: request.topic,
            n_uuid: request.n_uuid,
            req_uuid: request.req_uuid,
            rep_type: request.rep_type,
            payload,
            ok,
        };
        self.net.send(NetCmd::Send {
            target: SendTarget::Link(link),
            frames: response.to_frames(),
        });
    }

    /// A service response arrived; correlate and complete.
    fn recv_srv_response(&self, frames: &[Vec<u8>]) {
        let response = match ServiceResponse::from_frames(frames) {
            Ok(response) => response,
            Err(e) => {
                self.counters.malformed_messages.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping bad service response: {}", e);
                return;
            }
        };
        if response.dest != self.response_receiver_id {
            self.counters.responses_orphaned.fetch_add(1, Ordering::Relaxed);
            log::debug!("response addressed to {} is not for us", response.dest);
            return;
        }
        let pending = self.state.lock().requests.take_handler(
            &response.topic,
            response.n_uuid,
            response.req_uuid,
        );
        match pending {
            Some(pending) => pending.complete(if response.ok {
                Ok(response.payload)
            } else {
                Err(Error::ServiceFailure)
            }),
            None => {
                // Late reply for a request that timed out or was cancelled.
                self.counters.responses_orphaned.fetch_add(1, Ordering::Relaxed);
                log::debug!("dropping orphan response for {}", response.topic);
            }
        }
    }

    /// Complete and remove every pending request past its deadline.
    fn expire_requests(&self) {
        let now = Instant::now();
        let expired = self.state.lock().requests.drain_matching(|p| p.expired(now));
        for pending in expired {
            self.counters.requests_expired.fetch_add(1, Ordering::Relaxed);
            log::debug!("request {} on {} timed out", pending.req_uuid(), pending.topic());
            pending.complete(Err(Error::Timeout));
        }
    }

    // ========================================================================
    // Facade support
    // ========================================================================

    /// Tear down everything one facade node registered: subscriptions
    /// (with unsubscribe announcements), repliers, advertisements, and its
    /// pending requests (cancelled).
    pub fn remove_node(&self, n_uuid: Uuid) {
        let (sub_topics, cancelled) = {
            let mut state = self.state.lock();
            let mut topics: Vec<String> = state
                .local_subscriptions
                .drain_node(n_uuid)
                .into_iter()
                .map(|(topic, _)| topic)
                .collect();
            topics.extend(
                state
                    .raw_subscriptions
                    .drain_node(n_uuid)
                    .into_iter()
                    .map(|(topic, _)| topic),
            );
            topics.sort();
            topics.dedup();
            state.repliers.drain_node(n_uuid);
            let cancelled = state.requests.drain_node(n_uuid);
            let topics: Vec<(String, Vec<MessagePublisher>)> = topics
                .into_iter()
                .map(|t| {
                    let pubs = state.connections.publishers(&t);
                    (t, pubs)
                })
                .collect();
            (topics, cancelled)
        };
        for (topic, publishers) in &sub_topics {
            self.announce_subscription(
                topic,
                n_uuid,
                crate::config::WILDCARD_TYPE,
                ControlOp::Unsubscribe,
                publishers,
            );
        }
        for (_, pending) in cancelled {
            pending.complete(Err(Error::Cancelled));
        }
        self.msg_discovery.unadvertise_node(n_uuid);
        self.srv_discovery.unadvertise_node(n_uuid);
    }
}

impl Drop for NodeShared {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Release);
        self.net.wake();

        let pending = self.state.lock().requests.drain_all();
        for request in pending {
            request.complete(Err(Error::Shutdown));
        }

        self.msg_discovery.shutdown();
        self.srv_discovery.shutdown();

        if let Some(handle) = self.reception.lock().take() {
            // A drop on the reception thread itself detaches instead.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        log::info!("core {} down", self.p_uuid);
    }
}

/// The reception loop: poll, classify, dispatch, expire. Holds only a weak
/// reference so the core can be dropped while the loop sleeps in poll.
fn reception_loop(mut pump: NetPump, core: Weak<NodeShared>, exit: Arc<AtomicBool>) {
    loop {
        let events = pump.poll_once(POLL_TIMEOUT);
        if exit.load(Ordering::Acquire) {
            break;
        }
        let Some(core) = core.upgrade() else {
            break;
        };
        for event in events {
            core.dispatch(event);
        }
        core.expire_requests();
    }
    log::debug!("reception loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{RawCallbackSubscription, ServiceReplier, TypedSubscription};
    use std::sync::atomic::AtomicUsize;

    fn core() -> Arc<NodeShared> {
        NodeShared::with_ports(0, 0).expect("core construction")
    }

    #[test]
    fn local_roundtrip_preserves_payload_and_type() {
        let core = core();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        core.subscribe_raw(
            "@@/chat",
            new_uuid(),
            Arc::new(RawCallbackSubscription::new("*", move |payload, info| {
                assert_eq!(payload, b"exact bytes");
                assert_eq!(info.msg_type, "custom");
                assert_eq!(info.topic, "@@/chat");
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        core.publish("@@/chat", b"exact bytes", "custom").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_subscribers_is_silent_success() {
        let core = core();
        core.publish("@@/nobody", b"x", "string").unwrap();
        assert_eq!(core.counters().data_messages_sent.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn typed_dispatch_filters_types() {
        let core = core();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        core.subscribe(
            "@@/t",
            new_uuid(),
            Arc::new(TypedSubscription::new(move |_msg: &String, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        core.publish("@@/t", &7i64.to_le_bytes(), "int64").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(core.counters().type_mismatches.load(Ordering::Relaxed), 1);

        core.publish("@@/t", b"hello", "string").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let core = core();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        core.subscribe_raw(
            "@@/t",
            new_uuid(),
            Arc::new(RawCallbackSubscription::new("*", |_, _| {
                panic!("subscriber bug");
            })),
        )
        .unwrap();
        core.subscribe_raw(
            "@@/t",
            new_uuid(),
            Arc::new(RawCallbackSubscription::new("*", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        core.publish("@@/t", b"x", "string").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(core.counters().callback_panics.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let core = core();
        let n_uuid = new_uuid();
        let handler = Arc::new(RawCallbackSubscription::new("*", |_, _| {}));
        let h_uuid = handler.handler_uuid();
        core.subscribe_raw("@@/t", n_uuid, handler).unwrap();

        assert!(core.unsubscribe("@@/t", n_uuid, h_uuid));
        assert!(!core.unsubscribe("@@/t", n_uuid, h_uuid));
    }

    #[test]
    fn local_service_shortcut_preserves_semantics() {
        let core = core();
        let n_uuid = new_uuid();
        let record = ServicePublisher {
            topic: "@@/echo".into(),
            addr: core.my_replier_address().to_string(),
            socket_id: core.replier_id(),
            p_uuid: core.p_uuid(),
            n_uuid,
            req_type: "string".into(),
            rep_type: "string".into(),
        };
        core.advertise_service(
            record,
            Arc::new(ServiceReplier::new(|req: String| {
                if req == "boom" {
                    None
                } else {
                    Some(req)
                }
            })),
        );

        let future = core
            .request("@@/echo", new_uuid(), "string", "string", b"ping", None)
            .unwrap();
        assert_eq!(future.wait().unwrap(), b"ping");

        let future = core
            .request("@@/echo", new_uuid(), "string", "string", b"boom", None)
            .unwrap();
        assert!(matches!(future.wait(), Err(Error::ServiceFailure)));
    }

    #[test]
    fn request_without_replier_times_out_and_clears() {
        let core = core();
        let start = Instant::now();
        let future = core
            .request(
                "@@/void",
                new_uuid(),
                "string",
                "string",
                b"x",
                Some(Duration::from_millis(100)),
            )
            .unwrap();
        assert_eq!(core.pending_requests("@@/void"), 1);

        assert!(matches!(future.wait(), Err(Error::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(core.pending_requests("@@/void"), 0);
        assert_eq!(core.counters().requests_expired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shutdown_completes_pending_and_fails_fast() {
        let core = core();
        let future = core
            .request("@@/void", new_uuid(), "string", "string", b"x", None)
            .unwrap();
        drop(core);
        assert!(matches!(future.wait(), Err(Error::Shutdown)));
    }

    #[test]
    fn remove_node_cancels_its_requests() {
        let core = core();
        let n_uuid = new_uuid();
        let future = core
            .request("@@/void", n_uuid, "string", "string", b"x", None)
            .unwrap();
        core.remove_node(n_uuid);
        assert!(matches!(future.wait(), Err(Error::Cancelled)));
        assert_eq!(core.pending_requests("@@/void"), 0);
    }

    #[test]
    fn instance_is_shared_and_reaped() {
        let a = NodeShared::instance().unwrap();
        let b = NodeShared::instance().unwrap();
        assert_eq!(a.p_uuid(), b.p_uuid());
        let old = a.p_uuid();
        drop(a);
        drop(b);
        let c = NodeShared::instance().unwrap();
        assert_ne!(c.p_uuid(), old);
    }
}
