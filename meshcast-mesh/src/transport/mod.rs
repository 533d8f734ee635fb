//! Relay channel abstraction
//!
//! The relay endpoint only asks for a negotiated channel and then reacts to the
//! channel's state transitions and payloads. Negotiation details stay behind
//! [`ConnectionFactory`], implemented over WebRTC for production and over
//! in-process queues for tests.

pub mod memory;
pub mod webrtc;

use async_trait::async_trait;
use bytes::Bytes;
use meshcast_core::{ConnectionState, PeerId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::{IceCandidate, SessionDescription};

pub use self::memory::{MemoryConnectionFactory, MemoryNetwork};
pub use self::webrtc::WebRtcConnectionFactory;

/// Label of the data channel carrying chunk frames
pub const DATA_CHANNEL_LABEL: &str = "stream";

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("No pending connection with {0}")]
    UnknownConnection(PeerId),
    #[error("Not connected")]
    NotConnected,
}

impl From<TransportError> for meshcast_core::Error {
    fn from(err: TransportError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Which side of the overlay edge the local node is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkDirection {
    /// We receive from the remote peer (we sent the offer)
    Upstream,
    /// We relay to the remote peer (we answered its offer)
    Downstream,
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => f.write_str("upstream"),
            Self::Downstream => f.write_str("downstream"),
        }
    }
}

/// Identity of one negotiated channel
///
/// A new channel to the same peer gets a new id, so callbacks from a channel
/// that was already replaced can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    State(ConnectionState),
    Message(Bytes),
    IceCandidate(IceCandidate),
}

/// Callback from a channel, tagged with the link it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub peer: PeerId,
    pub direction: LinkDirection,
    pub link: LinkId,
    pub kind: ChannelEventKind,
}

pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;

/// Cumulative counters of one channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Current round-trip time, when the transport measured one
    pub rtt_ms: Option<f64>,
}

#[async_trait]
pub trait RelayChannel: Send + Sync {
    fn link_id(&self) -> LinkId;

    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// `None` when the transport cannot report statistics right now
    async fn stats(&self) -> Option<ChannelStats>;

    async fn close(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a channel towards `remote` and produce the offer to signal
    async fn open_outbound(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: ChannelEventSender,
    ) -> Result<(Arc<dyn RelayChannel>, SessionDescription), TransportError>;

    /// Accept an offer from `remote` and produce the answer to signal
    async fn accept_inbound(
        &self,
        local: &PeerId,
        remote: &PeerId,
        offer: &SessionDescription,
        events: ChannelEventSender,
    ) -> Result<(Arc<dyn RelayChannel>, SessionDescription), TransportError>;

    /// Complete an outbound connection with the remote answer
    async fn apply_answer(
        &self,
        local: &PeerId,
        remote: &PeerId,
        answer: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(
        &self,
        local: &PeerId,
        remote: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), TransportError>;

    /// Forget negotiation state kept for a link
    async fn release(&self, local: &PeerId, remote: &PeerId, direction: LinkDirection);
}
