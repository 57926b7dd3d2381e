//! Broadcast router
//!
//! Fans one sender's bytes out to every other authenticated connection by
//! appending to their outbound queues. Performs no I/O.

use mio::Token;
use tracing::trace;

use crate::connection::ConnectionState;

/// Queue `payload` on every authenticated peer except `sender`
///
/// Returns the tokens of the peers that received the payload, so the caller
/// can arm them for write-readiness.
pub fn fan_out<'a, I>(peers: I, sender: Token, payload: &[u8]) -> Vec<Token>
where
    I: IntoIterator<Item = (Token, &'a mut ConnectionState)>,
{
    let mut delivered = Vec::new();

    for (token, state) in peers {
        if token == sender || !state.is_authenticated() {
            continue;
        }
        state.outbound.push(payload);
        trace!(
            to = %state.addr,
            len = payload.len(),
            backlog = state.outbound.len(),
            "Queued broadcast"
        );
        delivered.push(token);
    }

    delivered
}
