//! Multiplexed Chat Relay Library
//!
//! A single-threaded TCP chat relay driven by `mio` readiness events.
//!
//! # Features
//! - One event loop, no threads, no locks
//! - `auth,<username>,<password>` handshake checked against a credential store
//! - Raw byte broadcast to every other authenticated connection
//! - Per-connection outbound queues drained on write-readiness
//! - Interactive client multiplexing stdin and the server connection
//!
//! # Architecture
//! - `Server` owns the `mio::Poll`, the registry of listener/connection slots
//!   and the credential store
//! - `router::fan_out` appends a payload to every other authenticated peer's
//!   outbound queue; the next write-ready event drains it
//! - `Client` owns its own `mio::Poll` with a network endpoint and a terminal
//!   endpoint
//!
//! # Example
//! ```no_run
//! use chat_relay::{Server, ServerConfig};
//!
//! fn main() -> Result<(), chat_relay::AppError> {
//!     let addr = chat_relay::resolve_addr("127.0.0.1", 9000)?;
//!     let mut server = Server::bind(addr, ServerConfig::default())?;
//!     server.run()
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod protocol;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod terminal;

// Re-export main types for convenience
pub use buffer::{Flush, OutboundQueue};
pub use client::Client;
pub use config::{resolve_addr, ServerConfig};
pub use connection::ConnectionState;
pub use credentials::CredentialStore;
pub use error::{AppError, CloseReason, HandshakeError, HandshakeFailure};
pub use server::Server;
pub use shutdown::ShutdownHandle;
