//! Signaling gateway
//!
//! Exchanges offers, answers and ICE candidates between peers and reports room
//! presence. Every inbound notification arrives as a [`SignalingEvent`] on a
//! single receiver taken once by the dispatcher.

pub mod message;
pub mod mock;
pub mod websocket;

use async_trait::async_trait;
use meshcast_core::{PeerId, Result};
use tokio::sync::mpsc;

pub use message::{
    AdvertisedStats, IceCandidate, PeerInfo, SdpType, SessionDescription, SignalingErrorKind,
    SignalingEvent, WireMessage,
};
pub use mock::{MockSignaling, MockSignalingConfig};
pub use websocket::{WebSocketSignaling, WebSocketSignalingConfig};

#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Send a raw wire message
    async fn send(&self, message: WireMessage) -> Result<()>;

    async fn send_offer(
        &self,
        from: &PeerId,
        to: &PeerId,
        offer: SessionDescription,
    ) -> Result<()> {
        self.send(WireMessage::Offer {
            from_peer_id: from.clone(),
            to_peer_id: to.clone(),
            room_id: None,
            offer,
        })
        .await
    }

    async fn send_answer(
        &self,
        from: &PeerId,
        to: &PeerId,
        answer: SessionDescription,
    ) -> Result<()> {
        self.send(WireMessage::Answer {
            from_peer_id: from.clone(),
            to_peer_id: to.clone(),
            room_id: None,
            answer,
        })
        .await
    }

    async fn send_ice_candidate(
        &self,
        from: &PeerId,
        to: &PeerId,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.send(WireMessage::IceCandidate {
            from_peer_id: from.clone(),
            to_peer_id: to.clone(),
            room_id: None,
            candidate,
        })
        .await
    }

    /// Advertise refreshed presence info for `peer_id` to the room
    async fn send_peer_update(&self, peer_id: &PeerId, info: PeerInfo) -> Result<()> {
        self.send(WireMessage::PeerUpdate {
            peer_id: peer_id.clone(),
            peer_info: info,
        })
        .await
    }

    /// Take the inbound event receiver (can only be called once)
    fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>>;

    async fn close(&self);
}
