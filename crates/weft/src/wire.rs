// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Framed wire messages.
//!
//! Every message on the fabric is a small sequence of byte frames carried
//! inside one length-prefixed blob (see [`crate::transport::codec`]). Which
//! kind of message a blob holds is determined by the socket it arrived on,
//! so the frames themselves carry no discriminator:
//!
//! ```text
//! topic data:       [topic][sender address][payload][msg-type]
//! control update:   [topic][process UUID][node UUID][msg-type][op]
//! service request:  [topic][reply-to id][node UUID][request UUID][req-type][rep-type][payload]
//! service response: [dest id][topic][node UUID][request UUID][rep-type][payload][status]
//! ```
//!
//! Wrong arity or an unparsable field is a malformed message: the caller
//! counts it, logs it, drops it, and keeps going.

use uuid::Uuid;

use crate::error::{Error, Result};

pub(crate) fn parse_utf8(frame: &[u8], what: &'static str) -> Result<String> {
    String::from_utf8(frame.to_vec()).map_err(|_| Error::MalformedFrame(what))
}

pub(crate) fn parse_uuid(frame: &[u8], what: &'static str) -> Result<Uuid> {
    std::str::from_utf8(frame)
        .ok()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(Error::MalformedFrame(what))
}

fn uuid_frame(id: Uuid) -> Vec<u8> {
    id.to_string().into_bytes()
}

/// Direction of a control announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    /// A remote node starts consuming a topic.
    Subscribe,
    /// A remote node stops consuming a topic.
    Unsubscribe,
}

impl ControlOp {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            ControlOp::Subscribe => b"sub",
            ControlOp::Unsubscribe => b"unsub",
        }
    }

    fn parse(frame: &[u8]) -> Result<Self> {
        match frame {
            b"sub" => Ok(ControlOp::Subscribe),
            b"unsub" => Ok(ControlOp::Unsubscribe),
            _ => Err(Error::MalformedFrame("control op")),
        }
    }
}

/// A published message travelling from a publisher to remote subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicData {
    pub topic: String,
    /// Data endpoint of the sending process, for diagnostics.
    pub sender: String,
    pub payload: Vec<u8>,
    pub msg_type: String,
}

impl TopicData {
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        vec![
            self.topic.clone().into_bytes(),
            self.sender.clone().into_bytes(),
            self.payload.clone(),
            self.msg_type.clone().into_bytes(),
        ]
    }

    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self> {
        let [topic, sender, payload, msg_type] = frames else {
            return Err(Error::MalformedFrame("topic data arity"));
        };
        Ok(Self {
            topic: parse_utf8(topic, "topic")?,
            sender: parse_utf8(sender, "sender address")?,
            payload: payload.clone(),
            msg_type: parse_utf8(msg_type, "msg type")?,
        })
    }
}

/// Subscriber presence announcement on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlUpdate {
    pub topic: String,
    pub p_uuid: Uuid,
    pub n_uuid: Uuid,
    pub msg_type: String,
    pub op: ControlOp,
}

impl ControlUpdate {
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        vec![
            self.topic.clone().into_bytes(),
            uuid_frame(self.p_uuid),
            uuid_frame(self.n_uuid),
            self.msg_type.clone().into_bytes(),
            self.op.as_bytes().to_vec(),
        ]
    }

    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self> {
        let [topic, p_uuid, n_uuid, msg_type, op] = frames else {
            return Err(Error::MalformedFrame("control update arity"));
        };
        Ok(Self {
            topic: parse_utf8(topic, "topic")?,
            p_uuid: parse_uuid(p_uuid, "process uuid")?,
            n_uuid: parse_uuid(n_uuid, "node uuid")?,
            msg_type: parse_utf8(msg_type, "msg type")?,
            op: ControlOp::parse(op)?,
        })
    }
}

/// A service call on its way to a replier.
///
/// `reply_to` is the caller's response-receiver identity; the reply comes
/// back on the same byte stream addressed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub topic: String,
    pub reply_to: Uuid,
    pub n_uuid: Uuid,
    pub req_uuid: Uuid,
    pub req_type: String,
    pub rep_type: String,
    pub payload: Vec<u8>,
}

impl ServiceRequest {
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        vec![
            self.topic.clone().into_bytes(),
            uuid_frame(self.reply_to),
            uuid_frame(self.n_uuid),
            uuid_frame(self.req_uuid),
            self.req_type.clone().into_bytes(),
            self.rep_type.clone().into_bytes(),
            self.payload.clone(),
        ]
    }

    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self> {
        let [topic, reply_to, n_uuid, req_uuid, req_type, rep_type, payload] = frames else {
            return Err(Error::MalformedFrame("service request arity"));
        };
        Ok(Self {
            topic: parse_utf8(topic, "topic")?,
            reply_to: parse_uuid(reply_to, "reply-to id")?,
            n_uuid: parse_uuid(n_uuid, "node uuid")?,
            req_uuid: parse_uuid(req_uuid, "request uuid")?,
            req_type: parse_utf8(req_type, "req type")?,
            rep_type: parse_utf8(rep_type, "rep type")?,
            payload: payload.clone(),
        })
    }
}

/// Outcome of a service call, correlated by request UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    /// Response-receiver identity the reply is addressed to.
    pub dest: Uuid,
    pub topic: String,
    pub n_uuid: Uuid,
    pub req_uuid: Uuid,
    pub rep_type: String,
    /// Reply payload; empty on failure.
    pub payload: Vec<u8>,
    pub ok: bool,
}

impl ServiceResponse {
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        vec![
            uuid_frame(self.dest),
            self.topic.clone().into_bytes(),
            uuid_frame(self.n_uuid),
            uuid_frame(self.req_uuid),
            self.rep_type.clone().into_bytes(),
            self.payload.clone(),
            vec![u8::from(self.ok)],
        ]
    }

    pub fn from_frames(frames: &[Vec<u8>]) -> Result<Self> {
        let [dest, topic, n_uuid, req_uuid, rep_type, payload, status] = frames else {
            return Err(Error::MalformedFrame("service response arity"));
        };
        if status.len() != 1 {
            return Err(Error::MalformedFrame("status"));
        }
        Ok(Self {
            dest: parse_uuid(dest, "dest id")?,
            topic: parse_utf8(topic, "topic")?,
            n_uuid: parse_uuid(n_uuid, "node uuid")?,
            req_uuid: parse_uuid(req_uuid, "request uuid")?,
            rep_type: parse_utf8(rep_type, "rep type")?,
            payload: payload.clone(),
            ok: status[0] == 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_data_roundtrip() {
        let msg = TopicData {
            topic: "@@/chat".into(),
            sender: "127.0.0.1:4150".into(),
            payload: b"hi".to_vec(),
            msg_type: "string".into(),
        };
        assert_eq!(TopicData::from_frames(&msg.to_frames()).unwrap(), msg);
    }

    #[test]
    fn topic_data_rejects_wrong_arity() {
        let frames = vec![b"only".to_vec(), b"three".to_vec(), b"frames".to_vec()];
        assert!(matches!(
            TopicData::from_frames(&frames),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn control_update_roundtrip() {
        let msg = ControlUpdate {
            topic: "@@/chat".into(),
            p_uuid: Uuid::new_v4(),
            n_uuid: Uuid::new_v4(),
            msg_type: "string".into(),
            op: ControlOp::Unsubscribe,
        };
        assert_eq!(ControlUpdate::from_frames(&msg.to_frames()).unwrap(), msg);
    }

    #[test]
    fn control_update_rejects_unknown_op() {
        let mut frames = ControlUpdate {
            topic: "t".into(),
            p_uuid: Uuid::new_v4(),
            n_uuid: Uuid::new_v4(),
            msg_type: "string".into(),
            op: ControlOp::Subscribe,
        }
        .to_frames();
        frames[4] = b"resub".to_vec();
        assert!(ControlUpdate::from_frames(&frames).is_err());
    }

    #[test]
    fn service_request_roundtrip() {
        let msg = ServiceRequest {
            topic: "@@/echo".into(),
            reply_to: Uuid::new_v4(),
            n_uuid: Uuid::new_v4(),
            req_uuid: Uuid::new_v4(),
            req_type: "string".into(),
            rep_type: "string".into(),
            payload: b"ping".to_vec(),
        };
        assert_eq!(ServiceRequest::from_frames(&msg.to_frames()).unwrap(), msg);
    }

    #[test]
    fn service_response_roundtrip() {
        let msg = ServiceResponse {
            dest: Uuid::new_v4(),
            topic: "@@/echo".into(),
            n_uuid: Uuid::new_v4(),
            req_uuid: Uuid::new_v4(),
            rep_type: "string".into(),
            payload: Vec::new(),
            ok: false,
        };
        assert_eq!(ServiceResponse::from_frames(&msg.to_frames()).unwrap(), msg);
    }

    #[test]
    fn bad_uuid_is_malformed() {
        let mut frames = ServiceResponse {
            dest: Uuid::new_v4(),
            topic: "t".into(),
            n_uuid: Uuid::new_v4(),
            req_uuid: Uuid::new_v4(),
            rep_type: "string".into(),
            payload: vec![1],
            ok: true,
        }
        .to_frames();
        frames[0] = b"not-a-uuid".to_vec();
        assert!(matches!(
            ServiceResponse::from_frames(&frames),
            Err(Error::MalformedFrame(_))
        ));
    }
}
