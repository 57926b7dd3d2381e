//! Outbound byte queue
//!
//! Ordered backlog of bytes waiting for a writable socket. Bytes are only
//! removed from the front after the writer reports accepting them.

use std::io::{self, ErrorKind, Write};

use tracing::trace;

/// What a flush attempt achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Queue is empty
    Drained,
    /// Writer stopped accepting; the remainder waits for the next write-ready event
    Pending,
}

/// FIFO queue of outbound bytes
#[derive(Debug, Default, Clone)]
pub struct OutboundQueue {
    buf: Vec<u8>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue pre-loaded with `bytes`
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self { buf: bytes }
    }

    /// Append bytes to the back of the queue
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Queued bytes, front first
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Write as much as the writer accepts
    ///
    /// Stops at `WouldBlock` or when the queue is empty. Any other error is
    /// returned; bytes already accepted are removed before returning it.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<Flush> {
        let mut sent = 0;
        let result = loop {
            if sent == self.buf.len() {
                break Ok(Flush::Drained);
            }
            match writer.write(&self.buf[sent..]) {
                Ok(0) => break Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    sent += n;
                    trace!(len = n, remaining = self.buf.len() - sent, "Wrote to socket");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(Flush::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };

        self.buf.drain(..sent);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that accepts at most `chunk` bytes per call and
    /// `budget` bytes per "write-ready event"
    struct ThrottledWriter {
        out: Vec<u8>,
        chunk: usize,
        budget: usize,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_flush_drains_everything() {
        let mut queue = OutboundQueue::with_bytes(b"hello".to_vec());
        let mut writer = ThrottledWriter {
            out: Vec::new(),
            chunk: 2,
            budget: usize::MAX,
        };

        assert_eq!(queue.flush_to(&mut writer).unwrap(), Flush::Drained);
        assert!(queue.is_empty());
        assert_eq!(writer.out, b"hello");
    }

    #[test]
    fn test_partial_write_keeps_fifo_remainder() {
        let mut queue = OutboundQueue::new();
        queue.push(b"first ");
        queue.push(b"second ");
        queue.push(b"third");
        let mut writer = ThrottledWriter {
            out: Vec::new(),
            chunk: 4,
            budget: 7,
        };

        assert_eq!(queue.flush_to(&mut writer).unwrap(), Flush::Pending);
        assert_eq!(queue.as_bytes(), b"econd third");

        // Bytes pushed while blocked go behind the remainder
        queue.push(b"!");

        while !queue.is_empty() {
            writer.budget = 3;
            queue.flush_to(&mut writer).unwrap();
        }
        assert_eq!(writer.out, b"first second third!");
    }

    #[test]
    fn test_error_keeps_unsent_bytes() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = OutboundQueue::with_bytes(b"data".to_vec());
        let err = queue.flush_to(&mut Broken).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_empty_queue_is_drained() {
        let mut queue = OutboundQueue::new();
        assert_eq!(queue.flush_to(&mut Vec::<u8>::new()).unwrap(), Flush::Drained);
    }
}
