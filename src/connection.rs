//! Per-connection state
//!
//! One `ConnectionState` per accepted server-side socket, plus the
//! non-blocking read drain shared by the server and the client.

use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;

use crate::buffer::OutboundQueue;

/// Read chunk size
pub const READ_CHUNK: usize = 1024;

/// Result of draining a readable source
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Source would block; everything available was read
    Open,
    /// Zero-length read: the peer shut down its side
    Closed,
}

/// Read until the source would block or reports end of stream
///
/// Bytes are appended to `buf`. An I/O error is returned as-is; whatever was
/// read before it stays in `buf`.
pub fn drain_into<R: Read>(source: &mut R, buf: &mut Vec<u8>) -> io::Result<ReadOutcome> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut chunk) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Server-side connection record
///
/// Starts unauthenticated and becomes authenticated at most once.
#[derive(Debug)]
pub struct ConnectionState {
    /// Remote address, for logging
    pub addr: SocketAddr,
    /// Bytes read but not yet consumed
    pub inbound: Vec<u8>,
    /// Bytes waiting to be written
    pub outbound: OutboundQueue,
    /// Name the peer authenticated as
    username: Option<String>,
}

impl ConnectionState {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            inbound: Vec::new(),
            outbound: OutboundQueue::new(),
            username: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// Mark the connection authenticated
    ///
    /// Must only be called on an unauthenticated connection.
    pub fn authenticate(&mut self, username: &str) {
        debug_assert!(
            !self.is_authenticated(),
            "{} authenticated twice",
            self.addr
        );
        self.username = Some(username.to_string());
    }

    /// Display name for logs
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("unauthenticated")
    }

    /// Hand over everything read so far
    pub fn take_inbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.inbound)
    }
}
