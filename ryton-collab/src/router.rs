//! Text messages over Open data channels.
//!
//! Outbound text goes straight to the peer's channel; inbound text arrives
//! from the data-channel callbacks and is stamped into [`Message`]s by a
//! single forwarder task, so per-peer arrival order is kept.

use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{ConnectionManager, InboundText};
use crate::identity::PeerKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub peer: PeerKey,
    pub text: String,
    pub direction: Direction,
    pub timestamp: SystemTime,
}

impl Message {
    fn new(peer: PeerKey, text: String, direction: Direction) -> Self {
        Self {
            peer,
            text,
            direction,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no open connection to {0}")]
    NotOpen(PeerKey),
    #[error("send to {peer} failed: {reason}")]
    Channel { peer: PeerKey, reason: String },
}

pub struct MessageRouter {
    connections: ConnectionManager,
    forwarder: JoinHandle<()>,
    message_rx: Option<mpsc::UnboundedReceiver<Message>>,
}

impl MessageRouter {
    pub fn new(connections: ConnectionManager, mut inbound: mpsc::UnboundedReceiver<InboundText>) -> Self {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(InboundText { peer, text }) = inbound.recv().await {
                log::debug!("Message from {peer} ({} bytes)", text.len());
                if message_tx.send(Message::new(peer, text, Direction::Received)).is_err() {
                    break;
                }
            }
        });
        Self {
            connections,
            forwarder,
            message_rx: Some(message_rx),
        }
    }

    /// Take the received-message stream (can only be called once).
    pub fn take_message_rx(&mut self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.message_rx.take()
    }

    /// Send `text` to `peer`. `false` when there is no Open channel or the
    /// channel refused it.
    pub async fn send(&self, peer: PeerKey, text: &str) -> bool {
        match self.send_message(peer, text).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("{e}");
                false
            }
        }
    }

    pub async fn send_message(&self, peer: PeerKey, text: impl Into<String>) -> Result<Message, RouterError> {
        let channel = self
            .connections
            .open_channel(&peer)
            .await
            .ok_or(RouterError::NotOpen(peer))?;
        let text = text.into();
        channel
            .send_text(text.clone())
            .await
            .map_err(|e| RouterError::Channel {
                peer,
                reason: e.to_string(),
            })?;
        Ok(Message::new(peer, text, Direction::Sent))
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
