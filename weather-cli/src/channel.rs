//! Transport backed by tokio channels, linking a session to a companion task.

use tokio::sync::mpsc;

use weather_core::{
    Inbound, Message, Outbox, Transport, TransportError,
    message::{INBOX_SIZE, OUTBOX_SIZE},
    transport::DropReason,
};

/// Device side of the link.
#[derive(Debug)]
pub struct ChannelTransport {
    connected: bool,
    listening: bool,
    inbox_size: usize,
    outbox_size: usize,
    requests: mpsc::UnboundedSender<Message>,
    replies: mpsc::UnboundedReceiver<Inbound>,
}

/// Companion side of the link.
#[derive(Debug)]
pub struct CompanionLink {
    pub requests: mpsc::UnboundedReceiver<Message>,
    pub replies: mpsc::UnboundedSender<Inbound>,
}

impl ChannelTransport {
    pub fn pair(connected: bool) -> (Self, CompanionLink) {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (rep_tx, rep_rx) = mpsc::unbounded_channel();
        let transport = Self {
            connected,
            listening: false,
            inbox_size: INBOX_SIZE,
            outbox_size: OUTBOX_SIZE,
            requests: req_tx,
            replies: rep_rx,
        };
        let link = CompanionLink {
            requests: req_rx,
            replies: rep_tx,
        };
        (transport, link)
    }

    /// Waits for the next inbound event. `None` once the companion is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        let inbound = self.replies.recv().await?;
        Some(self.admit(inbound))
    }

    /// Applies inbox sizing: anything that does not fit is reported as dropped.
    fn admit(&self, inbound: Inbound) -> Inbound {
        match inbound {
            Inbound::Received(message) if message.size() > self.inbox_size => {
                Inbound::Dropped(DropReason::BufferOverflow)
            }
            other => other,
        }
    }
}

impl Transport for ChannelTransport {
    fn open(&mut self, inbox_size: usize, outbox_size: usize) {
        self.inbox_size = inbox_size;
        self.outbox_size = outbox_size;
        self.listening = true;
    }

    fn close(&mut self) {
        self.listening = false;
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.requests.is_closed()
    }

    fn begin_outbox(&mut self) -> Result<Outbox, TransportError> {
        Ok(Outbox::with_capacity(self.outbox_size))
    }

    fn send(&mut self, outbox: Outbox) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.requests
            .send(outbox.into_message())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn poll_inbound(&mut self) -> Option<Inbound> {
        if !self.listening {
            return None;
        }
        let inbound = self.replies.try_recv().ok()?;
        Some(self.admit(inbound))
    }
}
