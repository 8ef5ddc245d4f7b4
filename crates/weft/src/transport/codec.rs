// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Length-prefix framing for the byte-stream links.
//!
//! TCP has no message boundaries, so every wire message travels as:
//!
//! ```text
//! +----------------+---------------------------------------+
//! | Length (4B BE) | frame count (1B) | [len (4B BE) frame]* |
//! +----------------+---------------------------------------+
//! ```
//!
//! The outer length covers the packed frames. The codec keeps partial-read
//! state so it can be driven by a non-blocking socket: call [`WireCodec::decode`]
//! whenever the link is readable, until it reports `Ok(None)`.

use std::io::{self, Read};

use crate::config::MAX_WIRE_MESSAGE_SIZE;
use crate::error::{Error, Result};

/// Outer header size.
const LEN_HEADER: usize = 4;

/// Incremental reader state.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    Length { bytes_read: usize },
    Body { expected: usize, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::Length { bytes_read: 0 }
    }
}

/// Incremental decoder for one link.
#[derive(Debug)]
pub struct WireCodec {
    state: ReadState,
    buffer: Vec<u8>,
    max_size: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(MAX_WIRE_MESSAGE_SIZE)
    }
}

impl WireCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; LEN_HEADER],
            max_size,
        }
    }

    /// Try to pull one complete message off the reader.
    ///
    /// - `Ok(Some(payload))`: a packed frame sequence, feed to [`unpack_frames`]
    /// - `Ok(None)`: the socket has no more data right now
    /// - `Err(_)`: the link is broken or the peer sent garbage
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::Length { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..LEN_HEADER]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < LEN_HEADER {
                                self.state = ReadState::Length { bytes_read: total };
                                continue;
                            }
                            let len = u32::from_be_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;
                            if len > self.max_size {
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("message too large: {} bytes", len),
                                ));
                            }
                            self.buffer.resize(len.max(1), 0);
                            self.state = ReadState::Body {
                                expected: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::Length { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                ReadState::Body {
                    expected,
                    bytes_read,
                } => {
                    if expected == 0 {
                        self.reset();
                        return Ok(Some(Vec::new()));
                    }
                    match reader.read(&mut self.buffer[bytes_read..expected]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "incomplete message body",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected {
                                self.state = ReadState::Body {
                                    expected,
                                    bytes_read: total,
                                };
                                continue;
                            }
                            let message = self.buffer[..expected].to_vec();
                            self.reset();
                            return Ok(Some(message));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::Body {
                                expected,
                                bytes_read,
                            };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.resize(LEN_HEADER, 0);
        self.state = ReadState::default();
    }
}

/// Pack frames into one payload: count byte, then length-prefixed frames.
pub fn pack_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    debug_assert!(frames.len() <= u8::MAX as usize);
    let total: usize = 1 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(total);
    buf.push(frames.len() as u8);
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }
    buf
}

/// Unpack a payload produced by [`pack_frames`].
pub fn unpack_frames(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    let Some((&count, mut rest)) = payload.split_first() else {
        return Err(Error::MalformedFrame("empty message"));
    };
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(Error::MalformedFrame("truncated frame length"));
        }
        let (len_bytes, tail) = rest.split_at(4);
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        if tail.len() < len {
            return Err(Error::MalformedFrame("truncated frame body"));
        }
        let (frame, tail) = tail.split_at(len);
        frames.push(frame.to_vec());
        rest = tail;
    }
    if !rest.is_empty() {
        return Err(Error::MalformedFrame("trailing bytes"));
    }
    Ok(frames)
}

/// Pack frames and prepend the outer length header, ready to queue on a link.
pub fn encode_message(frames: &[Vec<u8>]) -> Vec<u8> {
    let payload = pack_frames(frames);
    let mut buf = Vec::with_capacity(LEN_HEADER + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    buf
}
