//! Wire protocol helpers
//!
//! The only structured record on the wire is the handshake:
//! `auth,<username>,<password>`. Everything after it is raw bytes,
//! relayed without framing.

use crate::credentials::CredentialStore;
use crate::error::HandshakeError;

/// Literal first field of the handshake record
pub const AUTH_LITERAL: &str = "auth";

/// Parsed handshake record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRecord<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

impl<'a> AuthRecord<'a> {
    /// Parse a handshake payload
    ///
    /// Trailing whitespace is stripped, then the text must split on `,`
    /// into exactly three fields, the first being `auth`.
    pub fn parse(payload: &'a [u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(payload).map_err(|_| HandshakeError::NotUtf8)?;
        let fields: Vec<&str> = text.trim_end().split(',').collect();

        match fields.as_slice() {
            &[literal, username, password] if literal == AUTH_LITERAL => Ok(Self {
                username,
                password,
            }),
            _ => Err(HandshakeError::Malformed),
        }
    }
}

/// Parse a handshake payload and check it against the store
///
/// Returns the authenticated username on success.
pub fn authenticate<'a>(
    payload: &'a [u8],
    credentials: &CredentialStore,
) -> Result<&'a str, HandshakeError> {
    let record = AuthRecord::parse(payload)?;
    credentials.verify(record.username, record.password)?;
    Ok(record.username)
}

/// Encode the handshake record sent by the client
pub fn auth_record(username: &str, password: &str) -> Vec<u8> {
    format!("{AUTH_LITERAL},{username},{password}").into_bytes()
}

/// Prefix one terminal line with the sender's name: `[<username>] <line>`
pub fn chat_line(username: &str, line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(username.len() + 3 + line.len());
    out.push(b'[');
    out.extend_from_slice(username.as_bytes());
    out.extend_from_slice(b"] ");
    out.extend_from_slice(line);
    out
}
