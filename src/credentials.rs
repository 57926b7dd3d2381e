//! Credential store
//!
//! Static username -> password table consulted during the handshake.
//! Lookups use exact, case-sensitive string equality.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::HandshakeError;

/// Username -> password mapping, fixed at process start
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    /// Build a store from `(username, password)` pairs
    pub fn new<I, U, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            users: entries
                .into_iter()
                .map(|(u, p)| (u.into(), p.into()))
                .collect(),
        }
    }

    /// Check a username/password pair
    pub fn verify(&self, username: &str, password: &str) -> Result<(), HandshakeError> {
        match self.users.get(username) {
            None => Err(HandshakeError::UnknownUser(username.to_string())),
            Some(stored) if stored == password => Ok(()),
            Some(_) => Err(HandshakeError::BadPassword(username.to_string())),
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new([("alice", "password1"), ("bob", "password2")])
    }
}
