//! Error types for the chat relay
//!
//! Defines process-level errors and per-connection handshake errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// These abort the server or client loop. Per-connection failures never
/// surface here; they close the affected connection instead.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Host/port did not resolve to any socket address
    #[error("Could not resolve address: {0}")]
    AddressResolution(String),

    /// Bad command line
    #[error("Usage: {0} <server/client> <host> <port>")]
    Usage(String),
}

/// Category of a failed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// Record has the wrong shape
    Protocol,
    /// Record is well formed but the credentials are rejected
    Auth,
}

/// Handshake errors
///
/// Any of these closes the connection with no reply and no retry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Payload is not valid UTF-8
    #[error("Handshake record is not valid UTF-8")]
    NotUtf8,

    /// Wrong field count or missing `auth` literal
    #[error("Invalid auth header")]
    Malformed,

    /// Username not present in the credential store
    #[error("User {0} does not exist")]
    UnknownUser(String),

    /// Password does not match the stored one
    #[error("Invalid password for user {0}")]
    BadPassword(String),
}

impl HandshakeError {
    pub fn kind(&self) -> HandshakeFailure {
        match self {
            HandshakeError::NotUtf8 | HandshakeError::Malformed => HandshakeFailure::Protocol,
            HandshakeError::UnknownUser(_) | HandshakeError::BadPassword(_) => {
                HandshakeFailure::Auth
            }
        }
    }
}

/// Why a connection was closed
///
/// Logged when a descriptor is unregistered; never escapes the event loop.
#[derive(Debug, Error)]
pub enum CloseReason {
    /// Zero-length read: orderly shutdown by the peer
    #[error("peer closed the connection")]
    PeerClosed,

    /// Handshake rejected
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Any other read/write failure, handled like `PeerClosed`
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Outbound backlog grew past the configured cap
    #[error("outbound backlog of {0} bytes exceeds limit")]
    Overflow(usize),
}
