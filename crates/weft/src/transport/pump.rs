// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The socket multiplexer behind the reception loop.
//!
//! [`NetPump`] owns every socket of a core: the three listeners (data,
//! control, replier), all accepted and dialed links, and a waker. It is
//! driven from exactly one thread via [`NetPump::poll_once`]; that thread is
//! the only reader of any socket. Other threads talk to it through a
//! [`NetHandle`]: commands go over a channel and the waker interrupts the
//! poll, so a send issued mid-poll is picked up without waiting out the
//! timeout.
//!
//! ```text
//!  user threads                    reception thread
//!  ------------                    ----------------
//!  NetHandle::send(cmd) ---+       loop {
//!                          |         poll(<=250ms)
//!                     [channel]      drain commands   <--+
//!                          |         accept/read/write   |
//!                          +--wake-------------------->--+
//!                                  }
//! ```

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use super::codec::{encode_message, unpack_frames};
use super::link::{Link, LinkKind, LinkState};

const DATA_LISTENER: Token = Token(0);
const CONTROL_LISTENER: Token = Token(1);
const REPLIER_LISTENER: Token = Token(2);
const WAKER_TOKEN: Token = Token(3);
const LINK_TOKEN_START: usize = 4;

const MAX_EVENTS: usize = 128;

/// Where a message should go.
#[derive(Debug)]
pub enum SendTarget {
    /// Every link accepted on the data listener (publish fan-out).
    DataFanout,
    /// The outbound link of the given kind dialed to `endpoint`.
    Endpoint {
        kind: LinkKind,
        endpoint: String,
    },
    /// A specific link, identified by the id a [`NetEvent::Message`] carried.
    /// Used to reply on the stream a request arrived on.
    Link(u64),
}

/// Commands accepted from user threads.
#[derive(Debug)]
pub enum NetCmd {
    Connect { kind: LinkKind, endpoint: String },
    Send { target: SendTarget, frames: Vec<Vec<u8>> },
    Disconnect { endpoint: String },
}

/// What the poll surfaced, handed to the reception loop for classification.
#[derive(Debug)]
pub enum NetEvent {
    /// One complete wire message.
    Message {
        kind: LinkKind,
        /// Stable id of the link, valid until it disconnects.
        link: u64,
        /// Peer address, for diagnostics.
        peer: String,
        frames: Vec<Vec<u8>>,
    },
    /// A link died (peer closed, connect failed, I/O error).
    Disconnected { kind: LinkKind, endpoint: String },
}

/// Bound endpoint addresses of a core.
#[derive(Debug, Clone)]
pub struct BoundEndpoints {
    pub data: String,
    pub control: String,
    pub replier: String,
}

/// Cloneable sender half: enqueue a command and interrupt the poll.
#[derive(Clone)]
pub struct NetHandle {
    tx: Sender<NetCmd>,
    waker: Arc<Waker>,
}

impl NetHandle {
    pub fn send(&self, cmd: NetCmd) {
        if self.tx.send(cmd).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Interrupt the poll without a command (shutdown signalling).
    pub fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// The socket multiplexer. Single-threaded by contract.
pub struct NetPump {
    poll: Poll,
    events: Events,
    data_listener: TcpListener,
    control_listener: TcpListener,
    replier_listener: TcpListener,
    links: HashMap<Token, Link>,
    outbound: HashMap<(LinkKind, String), Token>,
    next_token: usize,
    cmd_rx: Receiver<NetCmd>,
    malformed: u64,
}

impl NetPump {
    /// Bind the three listeners on ephemeral ports and wire up the command
    /// channel. Failure here is fatal for the whole core.
    pub fn bind(host: IpAddr) -> io::Result<(Self, NetHandle, BoundEndpoints)> {
        let poll = Poll::new()?;

        let mut data_listener = TcpListener::bind(SocketAddr::new(host, 0))?;
        let mut control_listener = TcpListener::bind(SocketAddr::new(host, 0))?;
        let mut replier_listener = TcpListener::bind(SocketAddr::new(host, 0))?;

        poll.registry()
            .register(&mut data_listener, DATA_LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut control_listener, CONTROL_LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut replier_listener, REPLIER_LISTENER, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, cmd_rx) = unbounded();

        let endpoints = BoundEndpoints {
            data: data_listener.local_addr()?.to_string(),
            control: control_listener.local_addr()?.to_string(),
            replier: replier_listener.local_addr()?.to_string(),
        };

        let pump = Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            data_listener,
            control_listener,
            replier_listener,
            links: HashMap::new(),
            outbound: HashMap::new(),
            next_token: LINK_TOKEN_START,
            cmd_rx,
            malformed: 0,
        };
        let handle = NetHandle { tx, waker };

        Ok((pump, handle, endpoints))
    }

    /// Messages dropped because their frame packing was unparsable.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    /// One reception-loop iteration: poll with a bounded timeout, drain
    /// commands, service ready sockets. Returns everything that needs
    /// classification.
    pub fn poll_once(&mut self, timeout: Duration) -> Vec<NetEvent> {
        let mut out = Vec::new();

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::error!("poll failed: {}", e);
            }
            return out;
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        // Commands are drained every iteration, not only on a waker event:
        // a command enqueued while the poll was already returning would
        // otherwise wait a full timeout.
        self.handle_commands(&mut out);

        for (token, readable, writable) in ready {
            match token {
                DATA_LISTENER => self.accept(LinkKind::DataIn),
                CONTROL_LISTENER => self.accept(LinkKind::ControlIn),
                REPLIER_LISTENER => self.accept(LinkKind::ReplierIn),
                WAKER_TOKEN => {}
                token => {
                    if writable {
                        self.link_writable(token, &mut out);
                    }
                    if readable {
                        self.link_readable(token, &mut out);
                    }
                }
            }
        }

        out
    }

    fn handle_commands(&mut self, out: &mut Vec<NetEvent>) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(NetCmd::Connect { kind, endpoint }) => self.do_connect(kind, endpoint, out),
                Ok(NetCmd::Send { target, frames }) => self.do_send(target, &frames, out),
                Ok(NetCmd::Disconnect { endpoint }) => self.do_disconnect(&endpoint),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn accept(&mut self, kind: LinkKind) {
        loop {
            let listener = match kind {
                LinkKind::DataIn => &self.data_listener,
                LinkKind::ControlIn => &self.control_listener,
                LinkKind::ReplierIn => &self.replier_listener,
                _ => return,
            };
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("failed to register {} link from {}: {}", kind, peer, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    log::debug!("accepted {} link from {}", kind, peer);
                    self.links
                        .insert(token, Link::new(kind, stream, peer.to_string(), LinkState::Connected));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed on {} listener: {}", kind, e);
                    break;
                }
            }
        }
    }

    fn do_connect(&mut self, kind: LinkKind, endpoint: String, out: &mut Vec<NetEvent>) {
        let key = (kind, endpoint.clone());
        if self.outbound.contains_key(&key) {
            return;
        }
        let addr: SocketAddr = match endpoint.parse() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("cannot dial {} as {}: {}", endpoint, kind, e);
                out.push(NetEvent::Disconnected { kind, endpoint });
                return;
            }
        };
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                let token = Token(self.next_token);
                self.next_token += 1;
                if let Err(e) = self.poll.registry().register(
                    &mut stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    log::warn!("failed to register {} link to {}: {}", kind, endpoint, e);
                    out.push(NetEvent::Disconnected { kind, endpoint });
                    return;
                }
                let _ = stream.set_nodelay(true);
                log::debug!("dialing {} as {}", endpoint, kind);
                self.links.insert(
                    token,
                    Link::new(kind, stream, endpoint.clone(), LinkState::Connecting),
                );
                self.outbound.insert(key, token);
            }
            Err(e) => {
                log::warn!("connect to {} failed: {}", endpoint, e);
                out.push(NetEvent::Disconnected { kind, endpoint });
            }
        }
    }

    fn do_send(&mut self, target: SendTarget, frames: &[Vec<u8>], out: &mut Vec<NetEvent>) {
        let encoded = encode_message(frames);
        match target {
            SendTarget::DataFanout => {
                let targets: Vec<Token> = self
                    .links
                    .iter()
                    .filter(|(_, l)| l.kind == LinkKind::DataIn)
                    .map(|(t, _)| *t)
                    .collect();
                for token in targets {
                    self.queue_and_flush(token, &encoded, out);
                }
            }
            SendTarget::Endpoint { kind, endpoint } => {
                match self.outbound.get(&(kind, endpoint.clone())).copied() {
                    Some(token) => self.queue_and_flush(token, &encoded, out),
                    None => log::warn!("no {} link to {}, message dropped", kind, endpoint),
                }
            }
            SendTarget::Link(id) => {
                let token = Token(id as usize);
                if self.links.contains_key(&token) {
                    self.queue_and_flush(token, &encoded, out);
                } else {
                    log::warn!("link {} is gone, message dropped", id);
                }
            }
        }
    }

    fn do_disconnect(&mut self, endpoint: &str) {
        let targets: Vec<Token> = self
            .links
            .iter()
            .filter(|(_, l)| l.kind.is_outbound() && l.endpoint == endpoint)
            .map(|(t, _)| *t)
            .collect();
        for token in targets {
            // Requested by the core, so no Disconnected event back.
            self.remove_link(token);
        }
    }

    fn queue_and_flush(&mut self, token: Token, encoded: &[u8], out: &mut Vec<NetEvent>) {
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        link.queue(encoded);
        if let Err(e) = link.flush() {
            self.close_link(token, &e.to_string(), out);
        }
    }

    fn link_writable(&mut self, token: Token, out: &mut Vec<NetEvent>) {
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        if link.state == LinkState::Connecting {
            match link.stream.take_error() {
                Ok(Some(e)) => {
                    self.close_link(token, &format!("connect failed: {}", e), out);
                    return;
                }
                Err(e) => {
                    self.close_link(token, &format!("connect error: {}", e), out);
                    return;
                }
                Ok(None) => match link.stream.peer_addr() {
                    Ok(_) => {
                        link.state = LinkState::Connected;
                        log::debug!("{} link to {} established", link.kind, link.endpoint);
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                    Err(e) => {
                        self.close_link(token, &format!("connect error: {}", e), out);
                        return;
                    }
                },
            }
        }
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        if let Err(e) = link.flush() {
            self.close_link(token, &e.to_string(), out);
        }
    }

    fn link_readable(&mut self, token: Token, out: &mut Vec<NetEvent>) {
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        let kind = link.kind;
        let peer = link.endpoint.clone();
        let mut payloads = Vec::new();
        let read_result = link.read_messages(&mut payloads);

        for payload in payloads {
            match unpack_frames(&payload) {
                Ok(frames) => out.push(NetEvent::Message {
                    kind,
                    link: token.0 as u64,
                    peer: peer.clone(),
                    frames,
                }),
                Err(e) => {
                    self.malformed += 1;
                    log::warn!("dropping malformed message from {}: {}", peer, e);
                }
            }
        }

        if let Err(e) = read_result {
            let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
                "closed by peer".to_string()
            } else {
                e.to_string()
            };
            self.close_link(token, &reason, out);
        }
    }

    fn close_link(&mut self, token: Token, reason: &str, out: &mut Vec<NetEvent>) {
        if let Some((kind, endpoint)) = self.remove_link(token) {
            log::debug!("{} link to {} closed: {}", kind, endpoint, reason);
            out.push(NetEvent::Disconnected { kind, endpoint });
        }
    }

    fn remove_link(&mut self, token: Token) -> Option<(LinkKind, String)> {
        let mut link = self.links.remove(&token)?;
        let _ = self.poll.registry().deregister(&mut link.stream);
        if link.kind.is_outbound() {
            self.outbound.remove(&(link.kind, link.endpoint.clone()));
        }
        Some((link.kind, link.endpoint))
    }
}
