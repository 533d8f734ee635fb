//! WebRTC transport
//!
//! One `RTCPeerConnection` per overlay edge carrying a single unordered,
//! unreliable data channel. Candidates arriving before the remote description
//! are queued and applied once it is set.

use async_trait::async_trait;
use bytes::Bytes;
use meshcast_core::{ConnectionState, PeerId};
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use super::{
    ChannelEvent, ChannelEventKind, ChannelEventSender, ChannelStats, ConnectionFactory,
    LinkDirection, LinkId, RelayChannel, TransportError, DATA_CHANNEL_LABEL,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

type LinkKey = (PeerId, PeerId, LinkDirection);

const fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
            Some(ConnectionState::Connecting)
        }
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
            Some(ConnectionState::Disconnected)
        }
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn connection_failed(err: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectionFailed(err.to_string())
}

fn negotiation(err: impl std::fmt::Display) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

pub struct WebRtcChannel {
    link: LinkId,
    pc: Arc<RTCPeerConnection>,
    /// Set immediately for outbound links, on `on_data_channel` for inbound
    dc: SyncRwLock<Option<Arc<RTCDataChannel>>>,
}

#[async_trait]
impl RelayChannel for WebRtcChannel {
    fn link_id(&self) -> LinkId {
        self.link
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let dc = self.dc.read().clone().ok_or(TransportError::NotConnected)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotConnected);
        }
        dc.send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.dc
            .read()
            .as_ref()
            .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    async fn stats(&self) -> Option<ChannelStats> {
        let report = self.pc.get_stats().await;
        let mut stats = ChannelStats::default();
        let mut seen_transport = false;

        for entry in report.reports.values() {
            match entry {
                StatsReportType::Transport(transport) => {
                    seen_transport = true;
                    stats.bytes_sent += transport.bytes_sent as u64;
                    stats.bytes_received += transport.bytes_received as u64;
                }
                StatsReportType::CandidatePair(pair)
                    if pair.nominated && pair.current_round_trip_time > 0.0 =>
                {
                    stats.rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                }
                _ => {}
            }
        }

        seen_transport.then_some(stats)
    }

    async fn close(&self) {
        let dc = self.dc.write().take();
        if let Some(dc) = dc {
            let _ = dc.close().await;
        }
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "Error closing peer connection");
        }
    }
}

struct Link {
    channel: Arc<WebRtcChannel>,
    remote_description_set: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

/// Production connection factory backed by webrtc-rs
pub struct WebRtcConnectionFactory {
    ice_servers: Vec<String>,
    links: RwLock<HashMap<LinkKey, Link>>,
}

impl WebRtcConnectionFactory {
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            links: RwLock::new(HashMap::new()),
        }
    }

    async fn create_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(connection_failed)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(connection_failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(connection_failed)
    }

    fn attach_handlers(
        pc: &Arc<RTCPeerConnection>,
        link: LinkId,
        remote: &PeerId,
        direction: LinkDirection,
        events: &ChannelEventSender,
    ) {
        let peer = remote.clone();
        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let peer = peer.clone();
            let tx = tx.clone();
            Box::pin(async move {
                info!(peer = %peer, direction = %direction, state = ?state, "Peer connection state");
                if let Some(state) = map_state(state) {
                    let _ = tx.send(ChannelEvent {
                        peer,
                        direction,
                        link,
                        kind: ChannelEventKind::State(state),
                    });
                }
            })
        }));

        let peer = remote.clone();
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let peer = peer.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let Some(init) = candidate.and_then(|c| c.to_json().ok()) else {
                    return;
                };
                let _ = tx.send(ChannelEvent {
                    peer,
                    direction,
                    link,
                    kind: ChannelEventKind::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                });
            })
        }));
    }

    fn attach_data_channel(
        dc: &Arc<RTCDataChannel>,
        link: LinkId,
        remote: &PeerId,
        direction: LinkDirection,
        events: &ChannelEventSender,
    ) {
        let peer = remote.clone();
        let tx = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = tx.send(ChannelEvent {
                peer: peer.clone(),
                direction,
                link,
                kind: ChannelEventKind::Message(msg.data),
            });
            Box::pin(async {})
        }));
    }

    async fn flush_candidates(&self, key: &LinkKey) -> Result<(), TransportError> {
        let (channel, candidates) = {
            let mut links = self.links.write().await;
            let Some(link) = links.get_mut(key) else {
                return Err(TransportError::UnknownConnection(key.1.clone()));
            };
            link.remote_description_set = true;
            (
                Arc::clone(&link.channel),
                std::mem::take(&mut link.pending_candidates),
            )
        };
        for candidate in candidates {
            if let Err(e) = channel.pc.add_ice_candidate(candidate).await {
                warn!(peer = %key.1, error = %e, "Failed to apply queued ICE candidate");
            }
        }
        Ok(())
    }

    fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(negotiation)
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn open_outbound(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: ChannelEventSender,
    ) -> Result<(Arc<dyn RelayChannel>, SessionDescription), TransportError> {
        let link = LinkId::next();
        let pc = self.create_connection().await?;
        Self::attach_handlers(&pc, link, remote, LinkDirection::Upstream, &events);

        let dc_init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(dc_init))
            .await
            .map_err(connection_failed)?;
        Self::attach_data_channel(&dc, link, remote, LinkDirection::Upstream, &events);

        let offer = pc.create_offer(None).await.map_err(negotiation)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;

        let channel = Arc::new(WebRtcChannel {
            link,
            pc,
            dc: SyncRwLock::new(Some(dc)),
        });
        self.links.write().await.insert(
            (local.clone(), remote.clone(), LinkDirection::Upstream),
            Link {
                channel: Arc::clone(&channel),
                remote_description_set: false,
                pending_candidates: Vec::new(),
            },
        );

        Ok((channel, SessionDescription::offer(offer.sdp)))
    }

    async fn accept_inbound(
        &self,
        local: &PeerId,
        remote: &PeerId,
        offer: &SessionDescription,
        events: ChannelEventSender,
    ) -> Result<(Arc<dyn RelayChannel>, SessionDescription), TransportError> {
        let link = LinkId::next();
        let pc = self.create_connection().await?;
        Self::attach_handlers(&pc, link, remote, LinkDirection::Downstream, &events);

        let channel = Arc::new(WebRtcChannel {
            link,
            pc: Arc::clone(&pc),
            dc: SyncRwLock::new(None),
        });
        let key = (local.clone(), remote.clone(), LinkDirection::Downstream);
        self.links.write().await.insert(
            key.clone(),
            Link {
                channel: Arc::clone(&channel),
                remote_description_set: false,
                pending_candidates: Vec::new(),
            },
        );

        // The handler must be in place before the remote description lands
        let holder = Arc::downgrade(&channel);
        let peer = remote.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let holder = holder.clone();
            let peer = peer.clone();
            let events = events.clone();
            Box::pin(async move {
                debug!(peer = %peer, label = dc.label(), "Received data channel");
                Self::attach_data_channel(&dc, link, &peer, LinkDirection::Downstream, &events);
                if let Some(channel) = holder.upgrade() {
                    *channel.dc.write() = Some(dc);
                }
            })
        }));

        pc.set_remote_description(Self::to_rtc(offer)?)
            .await
            .map_err(negotiation)?;
        self.flush_candidates(&key).await?;

        let answer = pc.create_answer(None).await.map_err(negotiation)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;

        Ok((channel, SessionDescription::answer(answer.sdp)))
    }

    async fn apply_answer(
        &self,
        local: &PeerId,
        remote: &PeerId,
        answer: &SessionDescription,
    ) -> Result<(), TransportError> {
        let key = (local.clone(), remote.clone(), LinkDirection::Upstream);
        let channel = self
            .links
            .read()
            .await
            .get(&key)
            .map(|link| Arc::clone(&link.channel))
            .ok_or_else(|| TransportError::UnknownConnection(remote.clone()))?;

        channel
            .pc
            .set_remote_description(Self::to_rtc(answer)?)
            .await
            .map_err(negotiation)?;
        self.flush_candidates(&key).await
    }

    async fn add_ice_candidate(
        &self,
        local: &PeerId,
        remote: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        let channel = {
            let mut links = self.links.write().await;
            let key = [LinkDirection::Upstream, LinkDirection::Downstream]
                .into_iter()
                .map(|direction| (local.clone(), remote.clone(), direction))
                .find(|key| links.contains_key(key))
                .ok_or_else(|| TransportError::UnknownConnection(remote.clone()))?;
            let link = links
                .get_mut(&key)
                .ok_or_else(|| TransportError::UnknownConnection(remote.clone()))?;

            if !link.remote_description_set {
                link.pending_candidates.push(init);
                return Ok(());
            }
            Arc::clone(&link.channel)
        };

        channel
            .pc
            .add_ice_candidate(init)
            .await
            .map_err(negotiation)
    }

    async fn release(&self, local: &PeerId, remote: &PeerId, direction: LinkDirection) {
        self.links
            .write()
            .await
            .remove(&(local.clone(), remote.clone(), direction));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connecting),
            Some(ConnectionState::Connecting)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Closed),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_unknown_links_are_rejected() {
        let factory = WebRtcConnectionFactory::new(vec![]);
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));
        let err = factory
            .apply_answer(&a, &b, &SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownConnection(ref p) if *p == b));

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        assert!(factory.add_ice_candidate(&a, &b, candidate).await.is_err());
    }

    #[tokio::test]
    async fn test_candidates_queue_until_answer() {
        let factory = WebRtcConnectionFactory::new(vec![]);
        let (a, b) = (PeerId::from("a"), PeerId::from("b"));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let (channel, offer) = factory.open_outbound(&a, &b, tx).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(!channel.is_open());

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        factory.add_ice_candidate(&a, &b, candidate).await.unwrap();
        let key = (a.clone(), b.clone(), LinkDirection::Upstream);
        assert_eq!(
            factory.links.read().await.get(&key).unwrap().pending_candidates.len(),
            1
        );

        channel.close().await;
        factory.release(&a, &b, LinkDirection::Upstream).await;
        assert!(factory.links.read().await.is_empty());
    }
}
