//! Outbound message queue shared between producers and the writer thread.
//!
//! The queue itself is plain data; the connection wraps it in a `Mutex` and
//! pairs it with a `Condvar` so the writer can sleep while it is idle.

use std::collections::VecDeque;
use std::sync::Arc;

/// Immutable payload; shared so one relayed item can sit in many queues.
pub type Message = Arc<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Always drained before anything in `Secondary`.
    Primary,
    Secondary,
}

/// A message handed to the writer, plus whether the initial throttle delay
/// applies to this send cycle.
#[derive(Debug)]
pub struct Dequeued {
    pub message: Message,
    pub throttle: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    primary: VecDeque<Message>,
    secondary: VecDeque<Message>,
    waiting_size: usize,
    initial_throttle: bool,
    wake: bool,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self {
            primary: VecDeque::new(),
            secondary: VecDeque::new(),
            waiting_size: 0,
            initial_throttle: true,
            wake: false,
        }
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: Priority, message: Message) {
        self.waiting_size += message.len();
        match priority {
            Priority::Primary => self.primary.push_back(message),
            Priority::Secondary => self.secondary.push_back(message),
        }
    }

    /// True while the writer has nothing to do and should keep waiting.
    pub fn is_idle(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty() && !self.wake
    }

    /// Raise the wake signal. It carries no payload and is never cleared:
    /// once raised the writer is shutting down.
    pub fn wake(&mut self) {
        self.wake = true;
    }

    pub fn pop(&mut self) -> Option<Dequeued> {
        let message = match self.primary.pop_front() {
            Some(m) => m,
            None => self.secondary.pop_front()?,
        };
        self.waiting_size -= message.len();

        let throttle = if self.waiting_size == 0 {
            // Backlog fully drained once: throttling is over for good.
            self.initial_throttle = false;
            false
        } else {
            self.initial_throttle
        };
        Some(Dequeued { message, throttle })
    }

    pub fn clear(&mut self) {
        self.primary.clear();
        self.secondary.clear();
        self.waiting_size = 0;
    }

    pub fn waiting_size(&self) -> usize {
        self.waiting_size
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_throttling(&self) -> bool {
        self.initial_throttle
    }
}
