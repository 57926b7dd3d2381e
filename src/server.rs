//! Server loop
//!
//! Single-threaded, readiness-driven relay. One `mio::Poll` watches the
//! listener and every accepted connection; each connection walks
//! `unauthenticated -> authenticated -> closed` (or straight to closed when
//! the handshake fails).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{drain_into, ConnectionState, ReadOutcome};
use crate::credentials::CredentialStore;
use crate::error::{AppError, CloseReason};
use crate::protocol;
use crate::router;
use crate::shutdown::ShutdownHandle;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const EVENTS_CAPACITY: usize = 256;

/// Poll interval while the accept backlog is stalled on a resource error
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// An accepted socket and its state
#[derive(Debug)]
struct Peer {
    stream: TcpStream,
    state: ConnectionState,
}

/// Registry entry
///
/// The listener carries no connection state.
#[derive(Debug)]
enum Slot {
    Listening(TcpListener),
    Connection(Peer),
}

/// The relay server
///
/// Owns the multiplexer, the registry and the credential store; every
/// handler borrows them through `&mut self`.
pub struct Server {
    poll: Poll,
    slots: HashMap<Token, Slot>,
    credentials: CredentialStore,
    max_outbound_bytes: Option<usize>,
    local_addr: SocketAddr,
    next_token: usize,
    /// Set when `accept` failed with connections still queued. The listener
    /// is edge-triggered, so nothing would wake us for that backlog again.
    accept_retry: bool,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind the listening socket and register it for read-readiness
    pub fn bind(addr: SocketAddr, config: ServerConfig) -> Result<Self, AppError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let shutdown = ShutdownHandle::new(poll.registry(), WAKER)?;

        info!("Listening on {}", local_addr);

        let mut slots = HashMap::new();
        slots.insert(LISTENER, Slot::Listening(listener));

        Ok(Self {
            poll,
            slots,
            credentials: config.credentials,
            max_outbound_bytes: config.max_outbound_bytes,
            local_addr,
            next_token: FIRST_CONNECTION,
            accept_retry: false,
            shutdown,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops `run` from another thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Number of live connections, authenticated or not
    pub fn connection_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Connection(_)))
            .count()
    }

    /// Run until shutdown is requested
    ///
    /// Every connection and the listener are closed before returning.
    pub fn run(&mut self) -> Result<(), AppError> {
        let result = self.event_loop();
        self.close_all();
        result
    }

    /// Wait up to `timeout` for readiness and handle one batch of events
    ///
    /// `run` repeats this until shutdown; callers that drive the loop
    /// themselves (tests, embedding) can step it directly.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<(), AppError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        self.turn(&mut events, timeout)
    }

    fn event_loop(&mut self) -> Result<(), AppError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.shutdown.is_requested() {
            self.turn(&mut events, None)?;
        }

        info!("Caught interrupt, exiting");
        Ok(())
    }

    fn turn(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<(), AppError> {
        let timeout = match (self.accept_retry, timeout) {
            (true, Some(t)) => Some(t.min(ACCEPT_RETRY)),
            (true, None) => Some(ACCEPT_RETRY),
            (false, t) => t,
        };

        if let Err(e) = self.poll.poll(events, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        if self.accept_retry {
            self.accept_connections();
        }
        for event in events.iter() {
            match event.token() {
                WAKER => debug!("Woken by shutdown handle"),
                LISTENER => self.accept_connections(),
                token => self.service_connection(token, event),
            }
        }
        Ok(())
    }

    /// Accept every pending connection
    fn accept_connections(&mut self) {
        let Some(Slot::Listening(listener)) = self.slots.get_mut(&LISTENER) else {
            return;
        };

        let mut accepted = Vec::new();
        let mut stalled = false;
        loop {
            match listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if skips_one_connection(&e) => {
                    warn!("Transient accept error: {}", e);
                    continue;
                }
                Err(e) => {
                    // e.g. EMFILE: the backlog stays queued until descriptors free up
                    if !self.accept_retry {
                        error!(
                            "Failed to accept connection, retrying every {:?}: {}",
                            ACCEPT_RETRY, e
                        );
                    }
                    stalled = true;
                    break;
                }
            }
        }
        if self.accept_retry && !stalled {
            info!("Accepting connections again");
        }
        self.accept_retry = stalled;

        for (mut stream, addr) in accepted {
            let token = Token(self.next_token);
            self.next_token += 1;

            if let Err(e) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!("Failed to register connection from {}: {}", addr, e);
                continue;
            }

            info!("Accepted connection from {}", addr);
            self.slots.insert(
                token,
                Slot::Connection(Peer {
                    stream,
                    state: ConnectionState::new(addr),
                }),
            );
        }

        debug!("Total connections: {}", self.connection_count());
    }

    /// Handle one readiness event for a connection
    fn service_connection(&mut self, token: Token, event: &Event) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            if let Err(reason) = self.handle_readable(token) {
                self.close_connection(token, reason);
                return;
            }
        }

        if event.is_writable() {
            if let Err(reason) = self.handle_writable(token) {
                self.close_connection(token, reason);
            }
        }
    }

    fn handle_readable(&mut self, token: Token) -> Result<(), CloseReason> {
        let Some(Slot::Connection(peer)) = self.slots.get_mut(&token) else {
            return Ok(());
        };

        let outcome = drain_into(&mut peer.stream, &mut peer.state.inbound)?;
        let payload = peer.state.take_inbound();

        if !peer.state.is_authenticated() {
            if !payload.is_empty() {
                let username = protocol::authenticate(&payload, &self.credentials)?;
                peer.state.authenticate(username);
                info!("{} authenticated as {}", peer.state.addr, username);
            }
        } else if !payload.is_empty() {
            debug!(
                "Received {} bytes from {} ({})",
                payload.len(),
                peer.state.addr,
                peer.state.display_name()
            );
            self.broadcast(token, &payload);
        }

        match outcome {
            ReadOutcome::Open => Ok(()),
            ReadOutcome::Closed => Err(CloseReason::PeerClosed),
        }
    }

    fn handle_writable(&mut self, token: Token) -> Result<(), CloseReason> {
        let Some(Slot::Connection(peer)) = self.slots.get_mut(&token) else {
            return Ok(());
        };
        if peer.state.outbound.is_empty() {
            return Ok(());
        }

        let queued = peer.state.outbound.len();
        let flush = peer.state.outbound.flush_to(&mut peer.stream)?;
        debug!(
            "Sent {} of {} queued bytes to {} ({:?})",
            queued - peer.state.outbound.len(),
            queued,
            peer.state.addr,
            flush
        );
        Ok(())
    }

    /// Fan `payload` out and arm every receiver for write-readiness
    fn broadcast(&mut self, sender: Token, payload: &[u8]) {
        let peers = self.slots.iter_mut().filter_map(|(token, slot)| match slot {
            Slot::Connection(peer) => Some((*token, &mut peer.state)),
            Slot::Listening(_) => None,
        });
        let delivered = router::fan_out(peers, sender, payload);

        for token in delivered {
            if let Err(reason) = self.arm_writable(token) {
                self.close_connection(token, reason);
            }
        }
    }

    /// Re-register for read+write so queued bytes get a fresh write-ready event
    fn arm_writable(&mut self, token: Token) -> Result<(), CloseReason> {
        let Some(Slot::Connection(peer)) = self.slots.get_mut(&token) else {
            return Ok(());
        };

        let backlog = peer.state.outbound.len();
        if self.max_outbound_bytes.is_some_and(|limit| backlog > limit) {
            return Err(CloseReason::Overflow(backlog));
        }

        self.poll.registry().reregister(
            &mut peer.stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        Ok(())
    }

    /// Unregister and drop a connection; queued outbound bytes are discarded
    fn close_connection(&mut self, token: Token, reason: CloseReason) {
        let Some(Slot::Connection(mut peer)) = self.slots.remove(&token) else {
            return;
        };

        match &reason {
            CloseReason::PeerClosed => info!(
                "{} ({}) disconnected",
                peer.state.addr,
                peer.state.display_name()
            ),
            CloseReason::Handshake(e) => {
                warn!("Handshake from {} rejected ({:?}): {}", peer.state.addr, e.kind(), e)
            }
            CloseReason::Transport(_) | CloseReason::Overflow(_) => {
                warn!("Dropping {}: {}", peer.state.addr, reason)
            }
        }

        if !peer.state.outbound.is_empty() {
            debug!(
                "Discarding {} undelivered bytes for {}",
                peer.state.outbound.len(),
                peer.state.addr
            );
        }

        if let Err(e) = self.poll.registry().deregister(&mut peer.stream) {
            debug!("Failed to deregister {}: {}", peer.state.addr, e);
        }
        info!("Closing connection to {}", peer.state.addr);
    }

    /// Close the listener and every connection
    fn close_all(&mut self) {
        let mut closed = 0;
        for (_, slot) in self.slots.drain() {
            match slot {
                Slot::Listening(mut listener) => {
                    let _ = self.poll.registry().deregister(&mut listener);
                }
                Slot::Connection(mut peer) => {
                    let _ = self.poll.registry().deregister(&mut peer.stream);
                    closed += 1;
                }
            }
        }
        info!("Server stopped, closed {} connections", closed);
    }
}

/// Accept failures that only cost the one connection being accepted
fn skips_one_connection(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::io::{self, Read, Write};
    use std::net::TcpStream as StdStream;
    use std::thread;

    fn start() -> (SocketAddr, ShutdownHandle, thread::JoinHandle<Result<(), AppError>>) {
        let mut server =
            Server::bind("127.0.0.1:0".parse().unwrap(), ServerConfig::default()).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let join = thread::spawn(move || server.run());
        (addr, handle, join)
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let server =
            Server::bind("127.0.0.1:0".parse().unwrap(), ServerConfig::default()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_shutdown_stops_run() {
        let (addr, handle, join) = start();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"auth,alice,password1").unwrap();
        thread::sleep(Duration::from_millis(100));

        handle.trigger().unwrap();
        join.join().unwrap().unwrap();

        // Every connection is closed on shutdown
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    fn bind() -> Server {
        let config = ServerConfig {
            credentials: CredentialStore::new([
                ("alice", "password1"),
                ("bob", "password2"),
                ("carol", "password3"),
            ]),
            max_outbound_bytes: None,
        };
        Server::bind("127.0.0.1:0".parse().unwrap(), config).unwrap()
    }

    /// Step the loop until `done` holds
    fn pump_until(server: &mut Server, done: impl Fn(&Server) -> bool) {
        for _ in 0..100 {
            if done(&*server) {
                return;
            }
            server.poll_once(Some(Duration::from_millis(20))).unwrap();
        }
        panic!("server never reached the expected state");
    }

    fn authenticated(server: &Server) -> usize {
        server
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Connection(peer) if peer.state.is_authenticated()))
            .count()
    }

    fn backlog(server: &Server) -> usize {
        server
            .slots
            .values()
            .map(|slot| match slot {
                Slot::Connection(peer) => peer.state.outbound.len(),
                Slot::Listening(_) => 0,
            })
            .sum()
    }

    /// Connect and authenticate, stepping the loop until the server agrees
    fn login(server: &mut Server, user: &str, password: &str) -> StdStream {
        let before = authenticated(server);
        let mut stream = StdStream::connect(server.local_addr()).unwrap();
        stream
            .write_all(format!("auth,{user},{password}").as_bytes())
            .unwrap();
        pump_until(server, |s| authenticated(s) == before + 1);
        stream.set_nonblocking(true).unwrap();
        stream
    }

    /// Step the loop until `len` bytes arrived on `reader`
    fn pump_read(server: &mut Server, reader: &mut StdStream, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        for _ in 0..100 {
            server.poll_once(Some(Duration::from_millis(20))).unwrap();
            match reader.read(&mut buf) {
                Ok(0) => panic!("connection closed by server"),
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {e}"),
            }
            if received.len() >= len {
                return received;
            }
        }
        panic!("only {} of {} bytes arrived", received.len(), len);
    }

    #[test]
    fn test_disconnect_before_handshake() {
        let mut server = bind();
        let mut alice = login(&mut server, "alice", "password1");
        let mut bob = login(&mut server, "bob", "password2");

        let stranger = StdStream::connect(server.local_addr()).unwrap();
        pump_until(&mut server, |s| s.connection_count() == 3);
        drop(stranger);
        pump_until(&mut server, |s| s.connection_count() == 2);
        assert_eq!(authenticated(&server), 2);

        alice.write_all(b"still here\n").unwrap();
        assert_eq!(pump_read(&mut server, &mut bob, 11), b"still here\n");
    }

    #[test]
    fn test_reset_authenticated_peer() {
        let mut server = bind();
        let mut alice = login(&mut server, "alice", "password1");
        let bob = login(&mut server, "bob", "password2");
        let mut carol = login(&mut server, "carol", "password3");

        alice.write_all(b"first\n").unwrap();
        assert_eq!(pump_read(&mut server, &mut carol, 6), b"first\n");
        pump_until(&mut server, |s| backlog(s) == 0);

        // Closing with unread bytes makes the kernel answer with RST
        drop(bob);
        pump_until(&mut server, |s| s.connection_count() == 2);

        alice.write_all(b"second\n").unwrap();
        assert_eq!(pump_read(&mut server, &mut carol, 7), b"second\n");
        assert_eq!(server.connection_count(), 2);
    }

    #[test]
    fn test_stalled_backlog_is_retried() {
        let mut server = bind();
        let _client = StdStream::connect(server.local_addr()).unwrap();

        // Consume the listener's readiness edge without accepting, as a
        // failed accept would
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        server
            .poll
            .poll(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert!(events.iter().any(|event| event.token() == LISTENER));
        server.accept_retry = true;

        // No new edge arrives; the retry timeout alone picks the backlog up
        server.poll_once(None).unwrap();
        assert_eq!(server.connection_count(), 1);
        assert!(!server.accept_retry);
    }

    #[test]
    fn test_accept_error_classification() {
        assert!(skips_one_connection(&io::Error::from(ErrorKind::ConnectionAborted)));
        assert!(skips_one_connection(&io::Error::from(ErrorKind::ConnectionReset)));
        assert!(!skips_one_connection(&io::Error::from(Errno::EMFILE)));
        assert!(!skips_one_connection(&io::Error::from(Errno::ENFILE)));
    }
}
