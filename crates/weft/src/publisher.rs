// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Publisher records: where to reach a publisher and what it speaks.
//!
//! These are the payloads of discovery beacons and the entries of
//! [`crate::storage::TopicStorage`].

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::wire::{parse_utf8, parse_uuid};

/// Common surface of message and service publisher records.
pub trait PublisherRecord: Clone + Send + Sync + 'static {
    /// Fully scoped topic or service name.
    fn topic(&self) -> &str;
    /// Process that owns the publisher.
    fn p_uuid(&self) -> Uuid;
    /// Facade node that owns the publisher.
    fn n_uuid(&self) -> Uuid;
    /// Primary endpoint: data address for messages, replier address for
    /// services.
    fn addr(&self) -> &str;
    /// Serialize for a discovery beacon.
    fn to_frames(&self) -> Vec<Vec<u8>>;
    /// Deserialize from a discovery beacon.
    fn from_frames(frames: &[Vec<u8>]) -> Result<Self>;
}

/// A pub/sub topic publisher.
///
/// Doubles as the remote-subscriber registry entry: a subscriber announces
/// itself with the same shape, addresses filled with its control endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePublisher {
    pub topic: String,
    /// Data endpoint remote subscribers connect to.
    pub addr: String,
    /// Control endpoint where subscriber announcements are received.
    pub ctrl_addr: String,
    pub p_uuid: Uuid,
    pub n_uuid: Uuid,
    pub msg_type: String,
}

impl PublisherRecord for MessagePublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn p_uuid(&self) -> Uuid {
        self.p_uuid
    }

    fn n_uuid(&self) -> Uuid {
        self.n_uuid
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn to_frames(&self) -> Vec<Vec<u8>> {
        vec![
            self.topic.clone().into_bytes(),
            self.addr.clone().into_bytes(),
            self.ctrl_addr.clone().into_bytes(),
            self.p_uuid.to_string().into_bytes(),
            self.n_uuid.to_string().into_bytes(),
            self.msg_type.clone().into_bytes(),
        ]
    }

    fn from_frames(frames: &[Vec<u8>]) -> Result<Self> {
        let [topic, addr, ctrl_addr, p_uuid, n_uuid, msg_type] = frames else {
            return Err(Error::MalformedFrame("message publisher arity"));
        };
        Ok(Self {
            topic: parse_utf8(topic, "topic")?,
            addr: parse_utf8(addr, "data address")?,
            ctrl_addr: parse_utf8(ctrl_addr, "control address")?,
            p_uuid: parse_uuid(p_uuid, "process uuid")?,
            n_uuid: parse_uuid(n_uuid, "node uuid")?,
            msg_type: parse_utf8(msg_type, "msg type")?,
        })
    }
}

/// A service publisher: one replier behind a request/response endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePublisher {
    pub topic: String,
    /// Replier endpoint requesters connect to.
    pub addr: String,
    /// Replier socket identity.
    pub socket_id: Uuid,
    pub p_uuid: Uuid,
    pub n_uuid: Uuid,
    pub req_type: String,
    pub rep_type: String,
}

impl PublisherRecord for ServicePublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn p_uuid(&self) -> Uuid {
        self.p_uuid
    }

    fn n_uuid(&self) -> Uuid {
        self.n_uuid
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn to_frames(&self) -> Vec<Vec<u8>> {
        vec![
            self.topic.clone().into_bytes(),
            self.addr.clone().into_bytes(),
            self.socket_id.to_string().into_bytes(),
            self.p_uuid.to_string().into_bytes(),
            self.n_uuid.to_string().into_bytes(),
            self.req_type.clone().into_bytes(),
            self.rep_type.clone().into_bytes(),
        ]
    }

    fn from_frames(frames: &[Vec<u8>]) -> Result<Self> {
        let [topic, addr, socket_id, p_uuid, n_uuid, req_type, rep_type] = frames else {
            return Err(Error::MalformedFrame("service publisher arity"));
        };
        Ok(Self {
            topic: parse_utf8(topic, "topic")?,
            addr: parse_utf8(addr, "replier address")?,
            socket_id: parse_uuid(socket_id, "socket id")?,
            p_uuid: parse_uuid(p_uuid, "process uuid")?,
            n_uuid: parse_uuid(n_uuid, "node uuid")?,
            req_type: parse_utf8(req_type, "req type")?,
            rep_type: parse_utf8(rep_type, "rep type")?,
        })
    }
}
