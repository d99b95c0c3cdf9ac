use async_trait::async_trait;
use tokio::sync::mpsc;

use murmur_common::TransportError;

use crate::backend::SignalingTransport;
use crate::protocol::Envelope;

/// Outbound envelopes go to an in-process channel; whoever holds the
/// receiver plays the role of the chat server.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SignalingTransport for ChannelTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx
            .send(envelope)
            .map_err(|_| TransportError::ChannelClosed)
    }
}
