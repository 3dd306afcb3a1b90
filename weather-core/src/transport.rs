//! The companion channel as seen from the device.

use std::collections::VecDeque;

use thiserror::Error;

use crate::message::{Message, Outbox};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("outbox is busy")]
    Busy,
    #[error("companion is not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
}

/// Why the transport discarded an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BufferOverflow,
    Busy,
    Other(i32),
}

/// Something the transport delivered to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Received(Message),
    Dropped(DropReason),
}

/// Asynchronous, bounded message channel to the companion.
///
/// Implementations only move messages. Delivery of inbound traffic happens
/// when the owner of the session calls `WeatherSession::handle_inbound`,
/// typically with what `poll_inbound` returned.
pub trait Transport {
    /// Ask for buffers of at least these sizes and start listening.
    fn open(&mut self, inbox_size: usize, outbox_size: usize);

    /// Stop listening; inbound traffic after this is discarded.
    fn close(&mut self);

    /// Whether the companion is currently reachable.
    fn is_connected(&self) -> bool;

    /// Start a new outbound message.
    fn begin_outbox(&mut self) -> Result<Outbox, TransportError>;

    /// Hand a finished message to the channel. Returns once it is queued.
    fn send(&mut self, outbox: Outbox) -> Result<(), TransportError>;

    /// Next inbound event, if any. Never blocks.
    fn poll_inbound(&mut self) -> Option<Inbound>;
}

/// A transport that keeps everything in memory.
///
/// Used as a loopback in tests and for host-side simulations.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    pub connected: bool,
    pub fail_open_outbox: bool,
    pub fail_send: bool,
    listening: bool,
    outbox_size: usize,
    inbox_size: usize,
    sent: Vec<Message>,
    inbound: VecDeque<Inbound>,
}

impl MemoryTransport {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn buffer_sizes(&self) -> (usize, usize) {
        (self.inbox_size, self.outbox_size)
    }

    pub fn sent(&self) -> &[Message] {
        &self.sent
    }

    /// Queue a message from the companion. Messages that exceed the inbox
    /// are turned into a drop notification.
    pub fn push_inbound(&mut self, message: Message) {
        if !self.listening {
            return;
        }
        if message.size() > self.inbox_size {
            self.inbound.push_back(Inbound::Dropped(DropReason::BufferOverflow));
        } else {
            self.inbound.push_back(Inbound::Received(message));
        }
    }

    pub fn push_dropped(&mut self, reason: DropReason) {
        if self.listening {
            self.inbound.push_back(Inbound::Dropped(reason));
        }
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, inbox_size: usize, outbox_size: usize) {
        self.inbox_size = self.inbox_size.max(inbox_size);
        self.outbox_size = self.outbox_size.max(outbox_size);
        self.listening = true;
    }

    fn close(&mut self) {
        self.listening = false;
        self.inbound.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn begin_outbox(&mut self) -> Result<Outbox, TransportError> {
        if self.fail_open_outbox {
            return Err(TransportError::Busy);
        }
        Ok(Outbox::with_capacity(self.outbox_size))
    }

    fn send(&mut self, outbox: Outbox) -> Result<(), TransportError> {
        if self.fail_send {
            return Err(TransportError::Send("injected failure".into()));
        }
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.sent.push(outbox.into_message());
        Ok(())
    }

    fn poll_inbound(&mut self) -> Option<Inbound> {
        self.inbound.pop_front()
    }
}
