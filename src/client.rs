//! Client loop
//!
//! Multiplexes one network connection and one terminal input on a private
//! `mio::Poll`. The handshake record is queued before the loop starts, each
//! terminal line is sent as `[<username>] <line>`, and whatever the server
//! relays is printed verbatim.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::event::{Event, Source};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::buffer::OutboundQueue;
use crate::connection::{drain_into, ReadOutcome};
use crate::error::{AppError, CloseReason};
use crate::protocol;
use crate::shutdown::ShutdownHandle;
use crate::terminal;

const NETWORK: Token = Token(0);
const TERMINAL: Token = Token(1);
const WAKER: Token = Token(2);
const EVENTS_CAPACITY: usize = 16;

/// How long one wait may block before the shutdown flag is checked again
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Registered descriptor
#[derive(Debug)]
enum Endpoint<I> {
    /// Connection to the relay server
    Network {
        stream: TcpStream,
        outbound: OutboundQueue,
        connected: bool,
    },
    /// Terminal input; `pending` holds a partial line
    Terminal { input: I, pending: Vec<u8> },
}

/// Chat client
///
/// `I` is the terminal input (stdin in production), `O` where relayed
/// messages and prompts are written (stdout in production).
pub struct Client<I, O> {
    poll: Poll,
    endpoints: HashMap<Token, Endpoint<I>>,
    username: String,
    output: O,
    shutdown: ShutdownHandle,
}

impl<I, O> Client<I, O>
where
    I: Source + Read,
    O: Write,
{
    /// Start a non-blocking connect and register both descriptors
    ///
    /// The network queue is pre-loaded with `auth,<username>,<password>`.
    /// If the terminal cannot be polled the client runs receive-only.
    pub fn connect(
        addr: SocketAddr,
        username: &str,
        password: &str,
        mut input: I,
        output: O,
    ) -> Result<Self, AppError> {
        let poll = Poll::new()?;

        info!("Starting connection to {}", addr);
        let mut stream = TcpStream::connect(addr)?;
        poll.registry()
            .register(&mut stream, NETWORK, Interest::READABLE | Interest::WRITABLE)?;

        let mut endpoints = HashMap::new();
        endpoints.insert(
            NETWORK,
            Endpoint::Network {
                stream,
                outbound: OutboundQueue::with_bytes(protocol::auth_record(username, password)),
                connected: false,
            },
        );

        match poll.registry().register(&mut input, TERMINAL, Interest::READABLE) {
            Ok(()) => {
                endpoints.insert(
                    TERMINAL,
                    Endpoint::Terminal {
                        input,
                        pending: Vec::new(),
                    },
                );
            }
            Err(e) => warn!("Terminal input cannot be polled, running receive-only: {}", e),
        }

        let shutdown = ShutdownHandle::new(poll.registry(), WAKER)?;

        Ok(Self {
            poll,
            endpoints,
            username: username.to_string(),
            output,
            shutdown,
        })
    }

    /// Handle that stops `run` from another thread
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn into_output(self) -> O {
        self.output
    }

    /// Run until the server connection is gone or shutdown is requested
    pub fn run(&mut self) -> Result<(), AppError> {
        self.prompt()?;
        // Input consumed ahead of registration (typed during the prompts)
        // produces no readiness edge
        self.service_terminal()?;
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while self.endpoints.contains_key(&NETWORK) {
            if self.shutdown.is_requested() {
                info!("Caught interrupt, exiting");
                break;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    NETWORK => self.service_network(event)?,
                    TERMINAL => self.service_terminal()?,
                    _ => {}
                }
            }
        }

        self.close_all();
        Ok(())
    }

    fn service_network(&mut self, event: &Event) -> Result<(), AppError> {
        // Connect completion (or failure) shows up as write-readiness or an
        // error, so handle it before reading
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            self.network_writable()?;
        }
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.network_readable()?;
        }
        Ok(())
    }

    fn network_writable(&mut self) -> Result<(), AppError> {
        let Some(Endpoint::Network {
            stream,
            outbound,
            connected,
        }) = self.endpoints.get_mut(&NETWORK)
        else {
            return Ok(());
        };

        if !*connected {
            match stream.take_error() {
                Ok(None) => {}
                Ok(Some(e)) | Err(e) => return self.close_network(CloseReason::Transport(e)),
            }
            match stream.peer_addr() {
                Ok(addr) => {
                    *connected = true;
                    info!("Connected to {}", addr);
                }
                Err(e) if e.kind() == ErrorKind::NotConnected => return Ok(()),
                Err(e) => return self.close_network(CloseReason::Transport(e)),
            }
        }

        if outbound.is_empty() {
            return Ok(());
        }
        match outbound.flush_to(stream) {
            Ok(flush) => {
                debug!("Flushed to server ({:?}, {} bytes left)", flush, outbound.len());
                Ok(())
            }
            Err(e) => self.close_network(CloseReason::Transport(e)),
        }
    }

    fn network_readable(&mut self) -> Result<(), AppError> {
        let Some(Endpoint::Network {
            stream, connected, ..
        }) = self.endpoints.get_mut(&NETWORK)
        else {
            return Ok(());
        };
        if !*connected {
            return Ok(());
        }

        let mut received = Vec::new();
        let outcome = drain_into(stream, &mut received);

        if !received.is_empty() {
            debug!("Received {} bytes from server", received.len());
            self.output.write_all(b"\n")?;
            self.output.write_all(&received)?;
            self.prompt()?;
        }

        match outcome {
            Ok(ReadOutcome::Open) => Ok(()),
            Ok(ReadOutcome::Closed) => self.close_network(CloseReason::PeerClosed),
            Err(e) => self.close_network(CloseReason::Transport(e)),
        }
    }

    fn service_terminal(&mut self) -> Result<(), AppError> {
        let Some(Endpoint::Terminal { input, pending }) = self.endpoints.get_mut(&TERMINAL)
        else {
            return Ok(());
        };

        let outcome = drain_into(input, pending);
        let mut lines = Vec::new();
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            lines.push(pending.drain(..=pos).collect::<Vec<u8>>());
        }

        let finished = match outcome {
            Ok(ReadOutcome::Open) => false,
            Ok(ReadOutcome::Closed) => true,
            Err(e) => {
                warn!("Terminal read failed: {}", e);
                true
            }
        };

        if finished {
            if !pending.is_empty() {
                lines.push(std::mem::take(pending));
            }
            if let Some(Endpoint::Terminal { mut input, .. }) = self.endpoints.remove(&TERMINAL) {
                let _ = input.deregister(self.poll.registry());
            }
            info!("Terminal input closed");
        }

        if lines.is_empty() {
            return Ok(());
        }
        for line in &lines {
            self.send(line);
        }
        self.prompt()
    }

    /// Queue one terminal line for the server
    fn send(&mut self, line: &[u8]) {
        let Some(Endpoint::Network {
            stream, outbound, ..
        }) = self.endpoints.get_mut(&NETWORK)
        else {
            debug!("No server connection, dropping {} bytes", line.len());
            return;
        };

        outbound.push(&protocol::chat_line(&self.username, line));
        if let Err(e) = self.poll.registry().reregister(
            stream,
            NETWORK,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("Failed to arm server connection for writing: {}", e);
        }
    }

    fn close_network(&mut self, reason: CloseReason) -> Result<(), AppError> {
        let Some(Endpoint::Network {
            mut stream,
            outbound,
            ..
        }) = self.endpoints.remove(&NETWORK)
        else {
            return Ok(());
        };

        match &reason {
            CloseReason::PeerClosed => info!("Server closed the connection"),
            _ => warn!("Lost server connection: {}", reason),
        }
        if !outbound.is_empty() {
            debug!("Discarding {} unsent bytes", outbound.len());
        }
        let _ = self.poll.registry().deregister(&mut stream);

        writeln!(self.output, "\nServer has closed the connection.")?;
        self.output.flush()?;
        Ok(())
    }

    fn close_all(&mut self) {
        for (_, endpoint) in self.endpoints.drain() {
            let _ = match endpoint {
                Endpoint::Network { mut stream, .. } => self.poll.registry().deregister(&mut stream),
                Endpoint::Terminal { mut input, .. } => input.deregister(self.poll.registry()),
            };
        }
    }

    fn prompt(&mut self) -> Result<(), AppError> {
        terminal::prompt(&mut self.output, &self.username)?;
        Ok(())
    }
}
