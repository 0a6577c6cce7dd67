//! Duplex channel to the remote conversational audio service.
//!
//! A [`Connector`] performs the handshake and hands back a [`Transport`] for
//! outbound frames. Everything inbound, lifecycle included, arrives as
//! [`TransportEvent`]s on the channel the controller passed to `connect`, so
//! the session loop is the single place that reacts to the network.

pub mod wire;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{buffering::chunk::EncodedChunk, error::Result, session::SessionConfig};

pub use ws::{WsConnector, WsTransport};

/// One decoded item of an inbound wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Agent speech, still encoded.
    Audio(EncodedChunk),
    /// The user started talking over the agent.
    Interrupted,
    /// Transcript text, passed through to the caller.
    Transcript(String),
    /// The agent finished its turn.
    TurnComplete,
}

/// Lifecycle and payload events delivered to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake complete; inbound messages follow.
    Open,
    Message(InboundMessage),
    /// Remote or local close, with the close reason when one was given.
    Close(Option<String>),
    Error(String),
}

/// Sender half handed to connectors.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Outbound half of an open connection.
///
/// `send` is called from the capture thread and must never block on I/O.
pub trait Transport: Send + Sync {
    /// Queue one captured frame for delivery.
    ///
    /// # Errors
    /// `LiveError::Transport` once the connection is closed.
    fn send(&self, chunk: EncodedChunk) -> Result<()>;

    /// Close the connection. Later calls are no-ops.
    fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and complete the session handshake.
    ///
    /// On success the connector has already queued [`TransportEvent::Open`]
    /// on `events`, ahead of any inbound message.
    ///
    /// # Errors
    /// `LiveError::Connection` when the endpoint is unreachable or the
    /// handshake does not complete.
    async fn connect(&self, config: &SessionConfig, events: EventSender) -> Result<Arc<dyn Transport>>;
}
