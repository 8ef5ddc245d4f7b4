// SPDX-License-Identifier: Apache-2.0 OR MIT

//! User-facing handles over the transport core.
//!
//! A [`Node`] is cheap: it owns a node UUID and a partition, and delegates
//! everything to the per-process [`NodeShared`]. Dropping a node (or a
//! [`Publisher`]) deregisters whatever it registered.
//!
//! Topic names are scoped with the partition before they reach the core:
//! `@{partition}@{topic}`. Two nodes in different partitions can never
//! exchange traffic because their scoped names are simply different
//! strings.

mod shared;

pub use shared::{Counters, HandlerInfo, NodeShared, SubscriberInfo};

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{env_partition, WILDCARD_TYPE};
use crate::error::{Error, Result};
use crate::handlers::{
    RawCallbackSubscription, ResponseFuture, ServiceReplier, TypedSubscription,
};
use crate::identity::new_uuid;
use crate::message::{Message, MessageInfo};
use crate::publisher::{MessagePublisher, ServicePublisher};

/// Options applied to a node at construction.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    partition: String,
}

impl NodeOptions {
    /// Partition from `WEFT_PARTITION`, empty when unset.
    pub fn new() -> Self {
        Self {
            partition: env_partition(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle into the fabric: advertise, subscribe, serve, call.
pub struct Node {
    core: Arc<NodeShared>,
    n_uuid: Uuid,
    options: NodeOptions,
}

impl Node {
    /// A node on the process-wide core with default options.
    pub fn new() -> Result<Self> {
        Self::with_options(NodeOptions::default())
    }

    /// A node on the process-wide core.
    pub fn with_options(options: NodeOptions) -> Result<Self> {
        Ok(Self::with_shared(NodeShared::instance()?, options))
    }

    /// A node on an explicit core. Embedders and tests use this to run
    /// several isolated cores in one process.
    pub fn with_shared(core: Arc<NodeShared>, options: NodeOptions) -> Self {
        Self {
            core,
            n_uuid: new_uuid(),
            options,
        }
    }

    pub fn n_uuid(&self) -> Uuid {
        self.n_uuid
    }

    pub fn partition(&self) -> &str {
        &self.options.partition
    }

    /// The core this node delegates to.
    pub fn shared(&self) -> &Arc<NodeShared> {
        &self.core
    }

    /// Partition-scope a user topic name.
    fn scoped(&self, topic: &str) -> Result<String> {
        if topic.is_empty()
            || topic.contains('@')
            || topic.contains(char::is_whitespace)
        {
            return Err(Error::InvalidTopic(topic.to_string()));
        }
        Ok(format!("@{}@{}", self.options.partition, topic))
    }

    /// Advertise a topic and get a typed publisher for it.
    pub fn advertise<M: Message>(&self, topic: &str) -> Result<Publisher<M>> {
        let scoped = self.scoped(topic)?;
        let record = MessagePublisher {
            topic: scoped.clone(),
            addr: self.core.my_address().to_string(),
            ctrl_addr: self.core.my_control_address().to_string(),
            p_uuid: self.core.p_uuid(),
            n_uuid: self.n_uuid,
            msg_type: M::TYPE_NAME.to_string(),
        };
        if !self.core.advertise(record) {
            log::warn!("topic {} advertised without discovery", topic);
        }
        Ok(Publisher {
            core: Arc::clone(&self.core),
            topic: scoped,
            n_uuid: self.n_uuid,
            _marker: PhantomData,
        })
    }

    /// Subscribe with a typed callback.
    pub fn subscribe<M, F>(&self, topic: &str, callback: F) -> Result<()>
    where
        M: Message,
        F: Fn(&M, &MessageInfo) + Send + Sync + 'static,
    {
        let scoped = self.scoped(topic)?;
        self.core
            .subscribe(&scoped, self.n_uuid, Arc::new(TypedSubscription::new(callback)))
    }

    /// Subscribe to the raw bytes of every message on a topic.
    pub fn subscribe_raw<F>(&self, topic: &str, callback: F) -> Result<()>
    where
        F: Fn(&[u8], &MessageInfo) + Send + Sync + 'static,
    {
        self.subscribe_raw_typed(topic, WILDCARD_TYPE, callback)
    }

    /// Subscribe to raw bytes, filtered to one message type.
    pub fn subscribe_raw_typed<F>(
        &self,
        topic: &str,
        msg_type: &str,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&[u8], &MessageInfo) + Send + Sync + 'static,
    {
        let scoped = self.scoped(topic)?;
        self.core.subscribe_raw(
            &scoped,
            self.n_uuid,
            Arc::new(RawCallbackSubscription::new(msg_type, callback)),
        )
    }

    /// Drop every subscription this node holds on a topic.
    pub fn unsubscribe(&self, topic: &str) -> Result<bool> {
        let scoped = self.scoped(topic)?;
        Ok(self.core.unsubscribe_node(&scoped, self.n_uuid))
    }

    /// Serve a service on this node. The callback returns `None` to signal
    /// failure to the caller.
    pub fn advertise_service<Req, Rep, F>(&self, topic: &str, callback: F) -> Result<()>
    where
        Req: Message,
        Rep: Message,
        F: Fn(Req) -> Option<Rep> + Send + Sync + 'static,
    {
        let scoped = self.scoped(topic)?;
        let record = ServicePublisher {
            topic: scoped,
            addr: self.core.my_replier_address().to_string(),
            socket_id: self.core.replier_id(),
            p_uuid: self.core.p_uuid(),
            n_uuid: self.n_uuid,
            req_type: Req::TYPE_NAME.to_string(),
            rep_type: Rep::TYPE_NAME.to_string(),
        };
        if !self
            .core
            .advertise_service(record, Arc::new(ServiceReplier::new(callback)))
        {
            log::warn!("service {} advertised without discovery", topic);
        }
        Ok(())
    }

    /// Withdraw this node's replier for a service.
    pub fn unadvertise_service(&self, topic: &str) -> Result<bool> {
        let scoped = self.scoped(topic)?;
        Ok(self.core.unadvertise_service(&scoped, self.n_uuid))
    }

    /// Call a service and block for the reply.
    pub fn request<Req, Rep>(&self, topic: &str, request: &Req, timeout: Duration) -> Result<Rep>
    where
        Req: Message,
        Rep: Message,
    {
        self.request_async::<Req, Rep>(topic, request, Some(timeout))?
            .wait()
    }

    /// Call a service and get a future for the reply.
    pub fn request_async<Req, Rep>(
        &self,
        topic: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<TypedResponse<Rep>>
    where
        Req: Message,
        Rep: Message,
    {
        let scoped = self.scoped(topic)?;
        let payload = request.encode()?;
        let future = self.core.request(
            &scoped,
            self.n_uuid,
            Req::TYPE_NAME,
            Rep::TYPE_NAME,
            &payload,
            timeout,
        )?;
        Ok(TypedResponse {
            inner: future,
            _marker: PhantomData,
        })
    }

    /// Service publishers known for a topic.
    pub fn service_publishers(&self, topic: &str) -> Result<Vec<ServicePublisher>> {
        let scoped = self.scoped(topic)?;
        Ok(self.core.topic_publishers(&scoped))
    }

    /// Nudge discovery for a service.
    pub fn discover_service(&self, topic: &str) -> Result<bool> {
        let scoped = self.scoped(topic)?;
        Ok(self.core.discover_service(&scoped))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.core.remove_node(self.n_uuid);
    }
}

/// Typed view over a pending reply.
pub struct TypedResponse<Rep> {
    inner: ResponseFuture,
    _marker: PhantomData<fn() -> Rep>,
}

impl<Rep: Message> TypedResponse<Rep> {
    /// Block until the reply arrives or the request resolves otherwise.
    pub fn wait(self) -> Result<Rep> {
        Rep::decode(&self.inner.wait()?)
    }

    /// Block with an explicit upper bound.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Rep> {
        Rep::decode(&self.inner.wait_timeout(timeout)?)
    }
}

/// Typed publisher handle for one advertised topic.
pub struct Publisher<M> {
    core: Arc<NodeShared>,
    topic: String,
    n_uuid: Uuid,
    _marker: PhantomData<fn(&M)>,
}

impl<M: Message> Publisher<M> {
    /// Publish one message. A no-op returning `Ok` when nobody listens.
    pub fn publish(&self, message: &M) -> Result<()> {
        let payload = message.encode()?;
        self.core.publish(&self.topic, &payload, M::TYPE_NAME)
    }

    /// Fully scoped topic this publisher speaks on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether anyone, local or remote, currently listens to this topic.
    pub fn has_connections(&self) -> bool {
        let info = self.core.check_subscriber_info(&self.topic, M::TYPE_NAME);
        info.handlers.have_local || info.handlers.have_raw || info.have_remote
    }
}

impl<M> Drop for Publisher<M> {
    fn drop(&mut self) {
        self.core.unadvertise(&self.topic, self.n_uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn isolated_node(partition: &str) -> Node {
        let core = NodeShared::with_ports(0, 0).unwrap();
        Node::with_shared(core, NodeOptions::new().with_partition(partition))
    }

    #[test]
    fn topics_are_partition_scoped() {
        let node = isolated_node("red");
        assert_eq!(node.scoped("/chat").unwrap(), "@red@/chat");
        assert!(node.scoped("").is_err());
        assert!(node.scoped("bad topic").is_err());
        assert!(node.scoped("@sneaky").is_err());
    }

    #[test]
    fn typed_pubsub_within_a_node() {
        let node = isolated_node("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        node.subscribe("/counter", move |msg: &i64, _info| {
            assert_eq!(*msg, 41);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let publisher = node.advertise::<i64>("/counter").unwrap();
        assert!(publisher.has_connections());
        publisher.publish(&41).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_partitions_never_meet() {
        let core = NodeShared::with_ports(0, 0).unwrap();
        let red = Node::with_shared(Arc::clone(&core), NodeOptions::new().with_partition("red"));
        let blue = Node::with_shared(core, NodeOptions::new().with_partition("blue"));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        blue.subscribe_raw("/chat", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let publisher = red.advertise::<String>("/chat").unwrap();
        publisher.publish(&"hi".to_string()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn node_drop_unsubscribes() {
        let core = NodeShared::with_ports(0, 0).unwrap();
        let keeper = Node::with_shared(Arc::clone(&core), NodeOptions::new().with_partition("t"));
        {
            let goner = Node::with_shared(Arc::clone(&core), NodeOptions::new().with_partition("t"));
            goner
                .subscribe_raw("/gone", |_, _| panic!("handler outlived its node"))
                .unwrap();
        }
        let publisher = keeper.advertise::<String>("/gone").unwrap();
        publisher.publish(&"anyone?".to_string()).unwrap();
    }

    #[test]
    fn service_roundtrip_within_a_process() {
        let node = isolated_node("svc");
        node.advertise_service("/double", |req: i64| Some(req * 2))
            .unwrap();

        let doubled: i64 = node
            .request("/double", &21i64, Duration::from_secs(1))
            .unwrap();
        assert_eq!(doubled, 42);
    }
}
