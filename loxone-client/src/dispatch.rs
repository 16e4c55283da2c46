//! Routing of parsed responses and events to registered listeners.
//!
//! Listener collections are snapshotted on every walk so a registration
//! arriving mid-delivery is picked up on the next frame instead of
//! racing the current one.

use std::sync::Arc;

use parking_lot::RwLock;

use loxone_types::LoxoneMessage;
use loxone_types::command::Command;

use crate::codec::{self, FrameKind, MessageHeader};
use crate::listener::{
    CommandResponseListener, Disposition, LoxoneEventListener, LoxoneWebSocketListener,
};

#[derive(Default)]
pub(crate) struct Dispatcher {
    command_listeners: RwLock<Vec<Arc<dyn CommandResponseListener>>>,
    event_listeners: RwLock<Vec<Arc<dyn LoxoneEventListener>>>,
    ws_listeners: RwLock<Vec<Arc<dyn LoxoneWebSocketListener>>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_command_listener(&self, listener: Arc<dyn CommandResponseListener>) {
        self.command_listeners.write().push(listener);
    }

    pub(crate) fn register_event_listener(&self, listener: Arc<dyn LoxoneEventListener>) {
        self.event_listeners.write().push(listener);
    }

    pub(crate) fn register_ws_listener(&self, listener: Arc<dyn LoxoneWebSocketListener>) {
        self.ws_listeners.write().push(listener);
    }

    /// Walks the response listeners in registration order, folding their
    /// dispositions. `Consumed` short-circuits; a final `Ignored` is
    /// logged since somebody submitted the command.
    pub(crate) fn process_command(&self, command: &Command, message: &LoxoneMessage) {
        let listeners = self.command_listeners.read().clone();
        let mut outcome = Disposition::Ignored;
        for listener in &listeners {
            if !listener.accepts(command.kind()) {
                continue;
            }
            match listener.on_command(command, message) {
                Disposition::Consumed => {
                    outcome = Disposition::Consumed;
                    break;
                }
                disposition => outcome = outcome.fold(disposition),
            }
        }
        if outcome == Disposition::Ignored {
            tracing::warn!(
                command = command.command(),
                "no listener handled the response"
            );
        }
    }

    /// Demultiplexes a binary payload to the event listeners.
    ///
    /// Only value and text event tables are delivered; the remaining
    /// kinds carry nothing the session core consumes.
    pub(crate) fn process_events(&self, header: &MessageHeader, payload: &[u8]) {
        match header.kind {
            FrameKind::EventValue => match codec::parse_value_events(payload) {
                Ok(events) => {
                    let listeners = self.event_listeners.read().clone();
                    for event in &events {
                        for listener in &listeners {
                            listener.on_value_event(event);
                        }
                    }
                }
                Err(err) => tracing::warn!("dropping malformed value event table: {err}"),
            },
            FrameKind::EventText => match codec::parse_text_events(payload) {
                Ok(events) => {
                    let listeners = self.event_listeners.read().clone();
                    for event in &events {
                        for listener in &listeners {
                            listener.on_text_event(event);
                        }
                    }
                }
                Err(err) => tracing::warn!("dropping malformed text event table: {err}"),
            },
            kind => {
                tracing::trace!(?kind, len = payload.len(), "discarding unconsumed frame");
            }
        }
    }

    pub(crate) fn notify_opened(&self) {
        for listener in self.ws_listeners.read().clone() {
            listener.opened();
        }
    }

    pub(crate) fn notify_closed(&self, code: u16, remote: bool) {
        for listener in self.ws_listeners.read().clone() {
            if remote {
                listener.remote_closed(code);
            } else {
                listener.local_closed(code);
            }
        }
    }
}
