//! The FIFO of in-flight commands.
//!
//! The miniserver answers text commands strictly in submission order, so
//! correlation is a queue: every sender enqueues before it writes to the
//! wire, and the inbound pump pops exactly one command per response
//! frame. Commands that expect no response (the keep-alive) are never
//! enqueued.

use std::collections::VecDeque;

use parking_lot::Mutex;

use loxone_types::command::Command;

#[derive(Default)]
pub(crate) struct CommandRegistry {
    queue: Mutex<VecDeque<Command>>,
}

impl CommandRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues the command iff it expects a response.
    pub(crate) fn submit(&self, command: &Command) {
        if command.expects_response() {
            tracing::trace!(command = command.command(), "enqueueing in-flight command");
            self.queue.lock().push_back(command.clone());
        }
    }

    /// The command the next inbound response answers.
    pub(crate) fn pop(&self) -> Option<Command> {
        self.queue.lock().pop_front()
    }

    /// Clears all in-flight commands; no correlation survives a closed
    /// socket.
    pub(crate) fn drain(&self) {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            tracing::debug!(dropped, "dropped in-flight commands on close");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_submission_order() {
        let registry = CommandRegistry::new();
        registry.submit(&Command::get_key("admin"));
        registry.submit(&Command::io_control("a", "on"));
        assert_eq!(registry.pop().unwrap().command(), "jdev/sys/getkey2/admin");
        assert_eq!(registry.pop().unwrap().command(), "jdev/sps/io/a/on");
        assert!(registry.pop().is_none());
    }

    #[test]
    fn keep_alive_is_never_enqueued() {
        let registry = CommandRegistry::new();
        registry.submit(&Command::keep_alive());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn drain_clears_everything() {
        let registry = CommandRegistry::new();
        registry.submit(&Command::io_control("a", "on"));
        registry.submit(&Command::io_control("b", "off"));
        registry.drain();
        assert_eq!(registry.len(), 0);
        assert!(registry.pop().is_none());
    }
}
