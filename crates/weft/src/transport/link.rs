// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-connection state for the byte-stream fabric.

use std::io::{self, Write};

use mio::net::TcpStream;

use super::codec::WireCodec;

/// Role of a link, fixed at creation.
///
/// Inbound roles are accepted on one of the three listeners; outbound roles
/// are connections this core initiated. The role decides how inbound frames
/// are classified, so the wire needs no message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Accepted on the data listener: a remote subscriber, publish fan-out
    /// target.
    DataIn,
    /// Accepted on the control listener: carries subscriber announcements.
    ControlIn,
    /// Accepted on the replier listener: carries service requests, replies
    /// go back on the same stream.
    ReplierIn,
    /// Connected to a remote publisher's data endpoint: carries topic data.
    SubOut,
    /// Connected to a remote publisher's control endpoint: we announce
    /// ourselves there.
    CtrlOut,
    /// Connected to a remote replier endpoint: requests out, responses in.
    ReqOut,
}

impl LinkKind {
    pub fn is_outbound(self) -> bool {
        matches!(self, LinkKind::SubOut | LinkKind::CtrlOut | LinkKind::ReqOut)
    }
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkKind::DataIn => "data-in",
            LinkKind::ControlIn => "control-in",
            LinkKind::ReplierIn => "replier-in",
            LinkKind::SubOut => "sub-out",
            LinkKind::CtrlOut => "control-out",
            LinkKind::ReqOut => "requester-out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Non-blocking connect still in flight; queued data flushes once the
    /// handshake completes.
    Connecting,
    Connected,
}

/// Result of draining a send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Queue empty.
    Done,
    /// Socket buffer full, retry on the next writable event.
    Blocked,
}

/// One TCP connection plus its framing and send state.
pub struct Link {
    pub kind: LinkKind,
    pub stream: TcpStream,
    /// Outbound: the endpoint we dialed. Inbound: the peer's address.
    pub endpoint: String,
    pub state: LinkState,
    codec: WireCodec,
    send_queue: Vec<u8>,
    send_offset: usize,
}

impl Link {
    pub fn new(kind: LinkKind, stream: TcpStream, endpoint: String, state: LinkState) -> Self {
        Self {
            kind,
            stream,
            endpoint,
            state,
            codec: WireCodec::default(),
            send_queue: Vec::new(),
            send_offset: 0,
        }
    }

    /// Queue an already-encoded message. Actual writing happens in
    /// [`Link::flush`] on the reception thread.
    pub fn queue(&mut self, encoded: &[u8]) {
        self.send_queue.extend_from_slice(encoded);
    }

    pub fn has_queued(&self) -> bool {
        self.send_offset < self.send_queue.len()
    }

    /// Write as much of the queue as the socket accepts.
    pub fn flush(&mut self) -> io::Result<FlushOutcome> {
        if self.state != LinkState::Connected {
            return Ok(FlushOutcome::Blocked);
        }
        while self.send_offset < self.send_queue.len() {
            match self.stream.write(&self.send_queue[self.send_offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.send_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushOutcome::Blocked);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.send_queue.clear();
        self.send_offset = 0;
        Ok(FlushOutcome::Done)
    }

    /// Drain every complete message currently readable on the socket.
    pub fn read_messages(&mut self, out: &mut Vec<Vec<u8>>) -> io::Result<()> {
        loop {
            match self.codec.decode(&mut self.stream) {
                Ok(Some(payload)) => out.push(payload),
                Ok(None) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::codec::{encode_message, unpack_frames};
    use std::io::Read;
    use std::net::TcpListener as StdListener;

    fn pair() -> (TcpStream, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn queue_and_flush_reaches_peer() {
        let (server, mut client) = pair();
        let mut link = Link::new(
            LinkKind::DataIn,
            server,
            "peer".into(),
            LinkState::Connected,
        );

        let encoded = encode_message(&[b"/t".to_vec(), b"hi".to_vec()]);
        link.queue(&encoded);
        assert!(link.has_queued());
        assert_eq!(link.flush().unwrap(), FlushOutcome::Done);
        assert!(!link.has_queued());

        let mut received = vec![0u8; encoded.len()];
        client.read_exact(&mut received).unwrap();
        assert_eq!(received, encoded);
    }

    #[test]
    fn read_messages_decodes_stream() {
        let (server, mut client) = pair();
        let mut link = Link::new(
            LinkKind::SubOut,
            server,
            "peer".into(),
            LinkState::Connected,
        );

        use std::io::Write as _;
        client
            .write_all(&encode_message(&[b"a".to_vec()]))
            .unwrap();
        client
            .write_all(&encode_message(&[b"b".to_vec(), b"c".to_vec()]))
            .unwrap();
        client.flush().unwrap();

        // Non-blocking socket: data may not be visible immediately.
        let mut messages = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while messages.len() < 2 && std::time::Instant::now() < deadline {
            link.read_messages(&mut messages).unwrap();
            std::thread::yield_now();
        }

        assert_eq!(messages.len(), 2);
        assert_eq!(unpack_frames(&messages[0]).unwrap(), vec![b"a".to_vec()]);
        assert_eq!(
            unpack_frames(&messages[1]).unwrap(),
            vec![b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn flush_waits_for_connection() {
        let (server, _client) = pair();
        let mut link = Link::new(
            LinkKind::ReqOut,
            server,
            "peer".into(),
            LinkState::Connecting,
        );
        link.queue(&encode_message(&[b"queued".to_vec()]));
        assert_eq!(link.flush().unwrap(), FlushOutcome::Blocked);
        assert!(link.has_queued());
    }
}
