//! Terminal helpers
//!
//! Terminal input wrapped as a pollable, readable source, plus the blocking
//! prompts used before the client loop starts. Prompts and the event loop
//! read through the same `RawInput`, so nothing typed ahead is lost between
//! them.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Chunk size for blocking prompt reads
const PROMPT_CHUNK: usize = 256;

/// Print `question` to `out` and read one line from `input` (blocking)
///
/// The trailing newline is removed. Bytes after the newline stay in
/// `input` for the event loop.
pub fn ask<W: Write>(out: &mut W, question: &str, input: &mut RawInput) -> io::Result<String> {
    write!(out, "{question}")?;
    out.flush()?;

    let line = input.read_line()?;
    Ok(String::from_utf8_lossy(&line)
        .trim_end_matches(['\r', '\n'])
        .to_string())
}

/// Write the `[<username>] ` prompt
pub fn prompt<W: Write>(out: &mut W, username: &str) -> io::Result<()> {
    write!(out, "[{username}] ")?;
    out.flush()
}

/// Unbuffered terminal input usable as a `mio` source
///
/// The descriptor stays blocking (it is shared with the parent shell).
/// `read` first checks readiness with a zero-timeout `poll(2)` and reports
/// `WouldBlock` when nothing is pending, so a drain loop collects every
/// line a TTY has queued without ever blocking.
#[derive(Debug)]
pub struct RawInput {
    file: File,
    /// Bytes read by a prompt but not yet handed out
    carry: Vec<u8>,
}

impl RawInput {
    /// Duplicate of the process stdin descriptor
    pub fn stdin() -> io::Result<Self> {
        Ok(Self::from_fd(io::stdin().as_fd().try_clone_to_owned()?))
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
            carry: Vec::new(),
        }
    }

    /// True if a read would not block (data or end of stream pending)
    fn is_ready(&self) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        Ok(poll(&mut fds, PollTimeout::ZERO)? > 0)
    }

    /// Blocking read up to and including the next newline
    ///
    /// At end of stream whatever is left is returned, possibly empty.
    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut chunk = [0u8; PROMPT_CHUNK];
        loop {
            if let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
                return Ok(self.carry.drain(..=pos).collect());
            }
            match self.file.read(&mut chunk) {
                Ok(0) => return Ok(std::mem::take(&mut self.carry)),
                Ok(n) => self.carry.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Read for RawInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.carry.is_empty() {
            let n = buf.len().min(self.carry.len());
            buf[..n].copy_from_slice(&self.carry[..n]);
            self.carry.drain(..n);
            return Ok(n);
        }
        if !self.is_ready()? {
            return Err(ErrorKind::WouldBlock.into());
        }
        self.file.read(buf)
    }
}

impl Source for RawInput {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{drain_into, ReadOutcome};
    use std::os::unix::net::{UnixDatagram, UnixStream};

    #[test]
    fn test_prompt_format() {
        let mut out = Vec::new();
        prompt(&mut out, "alice").unwrap();
        assert_eq!(out, b"[alice] ");
    }

    #[test]
    fn test_drain_collects_every_queued_line() {
        // Datagrams hand out one line per read, like a canonical-mode TTY
        let (tty, keyboard) = UnixDatagram::pair().unwrap();
        keyboard.send(b"one\n").unwrap();
        keyboard.send(b"two\n").unwrap();
        keyboard.send(b"three\n").unwrap();

        let mut input = RawInput::from_fd(OwnedFd::from(tty));
        let mut buf = Vec::new();
        assert_eq!(drain_into(&mut input, &mut buf).unwrap(), ReadOutcome::Open);
        assert_eq!(buf, b"one\ntwo\nthree\n");
    }

    #[test]
    fn test_read_without_input_would_block() {
        let (tty, _keyboard) = UnixStream::pair().unwrap();
        let mut input = RawInput::from_fd(OwnedFd::from(tty));

        let err = input.read(&mut [0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_ask_keeps_typed_ahead_bytes() {
        let (tty, mut keyboard) = UnixStream::pair().unwrap();
        keyboard.write_all(b"alice\npassword1\nahead\n").unwrap();

        let mut input = RawInput::from_fd(OwnedFd::from(tty));
        let mut out = Vec::new();
        assert_eq!(ask(&mut out, "Enter your username: ", &mut input).unwrap(), "alice");
        assert_eq!(ask(&mut out, "Enter your password: ", &mut input).unwrap(), "password1");
        assert_eq!(out, b"Enter your username: Enter your password: ");

        let mut rest = Vec::new();
        drain_into(&mut input, &mut rest).unwrap();
        assert_eq!(rest, b"ahead\n");
    }

    #[test]
    fn test_ask_at_end_of_input() {
        let (tty, mut keyboard) = UnixStream::pair().unwrap();
        keyboard.write_all(b"bob").unwrap();
        drop(keyboard);

        let mut input = RawInput::from_fd(OwnedFd::from(tty));
        assert_eq!(ask(&mut Vec::<u8>::new(), "? ", &mut input).unwrap(), "bob");
        assert!(input.carry.is_empty());
        assert_eq!(input.read(&mut [0u8; 16]).unwrap(), 0);
    }
}
