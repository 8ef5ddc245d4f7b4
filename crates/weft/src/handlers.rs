// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Handler capabilities: what the core can do with a registered callback.
//!
//! Four roles share the registries in [`crate::storage`]:
//! - typed subscriptions decode the payload, then run a user callback;
//! - raw subscriptions receive the original bytes untouched;
//! - repliers serve one service each;
//! - pending requests hold a one-shot completion slot until the matching
//!   response, a timeout, or cancellation resolves them.
//!
//! Typed dispatch is split into `decode` and `deliver` so the core can
//! deserialize once per distinct message type and fan the decoded value out
//! to every handler expecting it.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::WILDCARD_TYPE;
use crate::error::{Error, Result};
use crate::identity::new_uuid;
use crate::message::{Message, MessageInfo};

/// Whether a handler registered for `expected` accepts a message of
/// type `actual`.
pub fn type_matches(expected: &str, actual: &str) -> bool {
    expected == WILDCARD_TYPE || expected == actual
}

// ============================================================================
// Subscriptions
// ============================================================================

/// A typed local subscription.
pub trait Subscription: Send + Sync {
    fn handler_uuid(&self) -> Uuid;
    /// Message type this subscription was registered for.
    fn expected_type(&self) -> &str;
    /// Deserialize wire bytes into the concrete message, type-erased so one
    /// decode can serve every handler of the same type.
    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>>;
    /// Run the callback. Returns false when the value is not of the type
    /// this handler expects.
    fn deliver(&self, msg: &(dyn Any + Send + Sync), info: &MessageInfo) -> bool;
}

/// Closure-backed typed subscription.
pub struct TypedSubscription<M, F> {
    uuid: Uuid,
    callback: F,
    _marker: PhantomData<fn(&M)>,
}

impl<M, F> TypedSubscription<M, F>
where
    M: Message,
    F: Fn(&M, &MessageInfo) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self {
            uuid: new_uuid(),
            callback,
            _marker: PhantomData,
        }
    }
}

impl<M, F> Subscription for TypedSubscription<M, F>
where
    M: Message,
    F: Fn(&M, &MessageInfo) + Send + Sync,
{
    fn handler_uuid(&self) -> Uuid {
        self.uuid
    }

    fn expected_type(&self) -> &str {
        M::TYPE_NAME
    }

    fn decode(&self, bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
        Ok(Arc::new(M::decode(bytes)?))
    }

    fn deliver(&self, msg: &(dyn Any + Send + Sync), info: &MessageInfo) -> bool {
        match msg.downcast_ref::<M>() {
            Some(concrete) => {
                (self.callback)(concrete, info);
                true
            }
            None => false,
        }
    }
}

/// A raw local subscription: sees the bytes exactly as they travelled.
pub trait RawSubscription: Send + Sync {
    fn handler_uuid(&self) -> Uuid;
    /// Declared message type, [`WILDCARD_TYPE`] to accept everything.
    fn expected_type(&self) -> &str;
    fn deliver(&self, payload: &[u8], info: &MessageInfo);
}

/// Closure-backed raw subscription.
pub struct RawCallbackSubscription<F> {
    uuid: Uuid,
    msg_type: String,
    callback: F,
}

impl<F> RawCallbackSubscription<F>
where
    F: Fn(&[u8], &MessageInfo) + Send + Sync,
{
    pub fn new(msg_type: impl Into<String>, callback: F) -> Self {
        Self {
            uuid: new_uuid(),
            msg_type: msg_type.into(),
            callback,
        }
    }
}

impl<F> RawSubscription for RawCallbackSubscription<F>
where
    F: Fn(&[u8], &MessageInfo) + Send + Sync,
{
    fn handler_uuid(&self) -> Uuid {
        self.uuid
    }

    fn expected_type(&self) -> &str {
        &self.msg_type
    }

    fn deliver(&self, payload: &[u8], info: &MessageInfo) {
        (self.callback)(payload, info);
    }
}

// ============================================================================
// Service side
// ============================================================================

/// A service replier. Invoked synchronously on the reception thread.
pub trait Replier: Send + Sync {
    fn handler_uuid(&self) -> Uuid;
    fn req_type(&self) -> &str;
    fn rep_type(&self) -> &str;
    /// Serve one request: decode, run, encode. An `Err` becomes a failure
    /// status on the wire.
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>>;
}

/// Closure-backed replier. The callback returns `None` to signal failure.
pub struct ServiceReplier<Req, Rep, F> {
    uuid: Uuid,
    callback: F,
    _marker: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep, F> ServiceReplier<Req, Rep, F>
where
    Req: Message,
    Rep: Message,
    F: Fn(Req) -> Option<Rep> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self {
            uuid: new_uuid(),
            callback,
            _marker: PhantomData,
        }
    }
}

impl<Req, Rep, F> Replier for ServiceReplier<Req, Rep, F>
where
    Req: Message,
    Rep: Message,
    F: Fn(Req) -> Option<Rep> + Send + Sync,
{
    fn handler_uuid(&self) -> Uuid {
        self.uuid
    }

    fn req_type(&self) -> &str {
        Req::TYPE_NAME
    }

    fn rep_type(&self) -> &str {
        Rep::TYPE_NAME
    }

    fn handle(&self, request: &[u8]) -> Result<Vec<u8>> {
        let req = Req::decode(request)?;
        match (self.callback)(req) {
            Some(rep) => rep.encode(),
            None => Err(Error::ServiceFailure),
        }
    }
}

// ============================================================================
// Pending requests
// ============================================================================

/// A service call waiting for its response.
///
/// The request UUID doubles as the correlation key on the wire. The
/// completion slot is one-shot: whoever resolves the request first (response,
/// deadline, cancellation, shutdown) wins, later attempts are no-ops.
pub struct PendingRequest {
    req_uuid: Uuid,
    n_uuid: Uuid,
    topic: String,
    req_type: String,
    rep_type: String,
    payload: Vec<u8>,
    deadline: Option<Instant>,
    sent: AtomicBool,
    slot: Mutex<Option<Sender<Result<Vec<u8>>>>>,
}

impl PendingRequest {
    /// Create the request and the future its caller will wait on.
    pub fn new(
        topic: impl Into<String>,
        n_uuid: Uuid,
        req_type: impl Into<String>,
        rep_type: impl Into<String>,
        payload: Vec<u8>,
        deadline: Option<Instant>,
    ) -> (Arc<Self>, ResponseFuture) {
        let (tx, rx) = bounded(1);
        let pending = Arc::new(Self {
            req_uuid: new_uuid(),
            n_uuid,
            topic: topic.into(),
            req_type: req_type.into(),
            rep_type: rep_type.into(),
            payload,
            deadline,
            sent: AtomicBool::new(false),
            slot: Mutex::new(Some(tx)),
        });
        (pending, ResponseFuture { rx })
    }

    pub fn req_uuid(&self) -> Uuid {
        self.req_uuid
    }

    pub fn n_uuid(&self) -> Uuid {
        self.n_uuid
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn req_type(&self) -> &str {
        &self.req_type
    }

    pub fn rep_type(&self) -> &str {
        &self.rep_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the request frame already went out.
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// Claim the send. Only the first caller gets `true`, so a request is
    /// never put on the wire twice even when a flush races the issuer.
    pub fn try_mark_sent(&self) -> bool {
        !self.sent.swap(true, Ordering::AcqRel)
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Resolve the request. Only the first call delivers.
    pub fn complete(&self, result: Result<Vec<u8>>) {
        if let Some(tx) = self.slot.lock().take() {
            // The caller may have dropped the future; nothing to do then.
            let _ = tx.send(result);
        }
    }
}

/// Caller's side of a pending request.
pub struct ResponseFuture {
    rx: Receiver<Result<Vec<u8>>>,
}

impl ResponseFuture {
    /// Block until the request resolves.
    pub fn wait(self) -> Result<Vec<u8>> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Block with an upper bound independent of the request deadline.
    pub fn wait_timeout(self, timeout: std::time::Duration) -> Result<Vec<u8>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => Err(Error::Cancelled),
        }
    }

    /// Non-blocking check.
    pub fn try_wait(&self) -> Option<Result<Vec<u8>>> {
        self.rx.try_recv().ok()
    }
}
