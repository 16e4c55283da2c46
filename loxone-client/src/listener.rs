//! Listener seams of the session core.
//!
//! Listeners are borrowed collaborators: register them before traffic
//! starts and the session snapshots the collections on every walk, so a
//! late registration never races an in-flight delivery.

use loxone_types::LoxoneMessage;
use loxone_types::command::{Command, ResponseKind};

use crate::codec::{TextEvent, ValueEvent};

/// The outcome of one response listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The listener did not care about the message.
    Ignored,
    /// The listener handled the message; others may still see it.
    Accepted,
    /// The listener handled the message exclusively; the walk stops.
    Consumed,
}

impl Disposition {
    /// Folds two outcomes: `Consumed` absorbs, `Accepted` dominates
    /// `Ignored`.
    pub(crate) fn fold(self, other: Disposition) -> Disposition {
        match (self, other) {
            (Disposition::Consumed, _) | (_, Disposition::Consumed) => Disposition::Consumed,
            (Disposition::Accepted, _) | (_, Disposition::Accepted) => Disposition::Accepted,
            _ => Disposition::Ignored,
        }
    }
}

/// Receives command responses, keyed by the response category each
/// command declares.
pub trait CommandResponseListener: Send + Sync {
    /// `true` for every response category this listener wants to see.
    fn accepts(&self, kind: ResponseKind) -> bool;

    /// Handles one response to `command`.
    fn on_command(&self, command: &Command, message: &LoxoneMessage) -> Disposition;
}

/// Receives demultiplexed binary events.
pub trait LoxoneEventListener: Send + Sync {
    /// A value update arrived.
    fn on_value_event(&self, _event: &ValueEvent) {}

    /// A text update arrived.
    fn on_text_event(&self, _event: &TextEvent) {}
}

/// Observes the socket lifecycle.
pub trait LoxoneWebSocketListener: Send + Sync {
    /// The connection opened.
    fn opened(&self) {}

    /// The connection was closed by this side.
    fn local_closed(&self, _code: u16) {}

    /// The connection was closed by the miniserver.
    fn remote_closed(&self, _code: u16) {}
}

/// Observes the authentication sequence.
pub trait AuthListener: Send + Sync {
    /// The token handshake finished; plain commands may flow.
    fn auth_completed(&self);

    /// The visualisation handshake finished; secured commands may flow.
    fn visu_auth_completed(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumed_absorbs() {
        assert_eq!(
            Disposition::Accepted.fold(Disposition::Consumed),
            Disposition::Consumed
        );
        assert_eq!(
            Disposition::Consumed.fold(Disposition::Ignored),
            Disposition::Consumed
        );
    }

    #[test]
    fn accepted_dominates_ignored() {
        assert_eq!(
            Disposition::Ignored.fold(Disposition::Accepted),
            Disposition::Accepted
        );
        assert_eq!(
            Disposition::Ignored.fold(Disposition::Ignored),
            Disposition::Ignored
        );
    }
}
