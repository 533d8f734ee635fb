//! Signaling wire messages and the inbound event type

use meshcast_core::{ConnectionState, GeoLocation, PeerId, PeerRecord, RoomId};
use serde::{Deserialize, Serialize};

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Health figures a peer advertises about itself on join and on every update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisedStats {
    pub connection_state: ConnectionState,
    pub upload_kbps: f64,
    pub download_kbps: f64,
    pub latency_ms: f64,
    pub relay_count: u32,
}

impl From<&PeerRecord> for AdvertisedStats {
    fn from(record: &PeerRecord) -> Self {
        Self {
            connection_state: record.state,
            upload_kbps: record.upload_kbps,
            download_kbps: record.download_kbps,
            latency_ms: record.latency_ms,
            relay_count: record.relay_count,
        }
    }
}

impl AdvertisedStats {
    /// Copy the advertised figures into the record kept for a remote peer
    pub fn apply_to(&self, record: &mut PeerRecord) {
        record.state = self.connection_state;
        record.upload_kbps = self.upload_kbps;
        record.download_kbps = self.download_kbps;
        record.latency_ms = self.latency_ms;
        record.relay_count = self.relay_count;
    }
}

/// Presence information attached to `join`, `peer-join` and `peer-update`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_source: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<AdvertisedStats>,
}

/// JSON messages exchanged with the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: RoomId,
        peer_id: PeerId,
        #[serde(default)]
        peer_info: PeerInfo,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        from_peer_id: PeerId,
        to_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        offer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        from_peer_id: PeerId,
        to_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        answer: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from_peer_id: PeerId,
        to_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoin {
        peer_id: PeerId,
        #[serde(default)]
        peer_info: PeerInfo,
    },
    /// Refreshed presence info; sent by a peer and relayed to the room
    #[serde(rename_all = "camelCase")]
    PeerUpdate {
        peer_id: PeerId,
        #[serde(default)]
        peer_info: PeerInfo,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeave { peer_id: PeerId },
}

impl WireMessage {
    /// Inbound event carried by this message; `join` is outbound only
    #[must_use]
    pub fn into_event(self) -> Option<SignalingEvent> {
        match self {
            Self::Join { .. } => None,
            Self::Offer {
                from_peer_id,
                to_peer_id,
                offer,
                ..
            } => Some(SignalingEvent::Offer {
                from: from_peer_id,
                to: to_peer_id,
                offer,
            }),
            Self::Answer {
                from_peer_id,
                to_peer_id,
                answer,
                ..
            } => Some(SignalingEvent::Answer {
                from: from_peer_id,
                to: to_peer_id,
                answer,
            }),
            Self::IceCandidate {
                from_peer_id,
                to_peer_id,
                candidate,
                ..
            } => Some(SignalingEvent::IceCandidate {
                from: from_peer_id,
                to: to_peer_id,
                candidate,
            }),
            Self::PeerJoin { peer_id, peer_info } => Some(SignalingEvent::PeerJoin {
                peer_id,
                info: peer_info,
            }),
            Self::PeerUpdate { peer_id, peer_info } => Some(SignalingEvent::PeerUpdate {
                peer_id,
                info: peer_info,
            }),
            Self::PeerLeave { peer_id } => Some(SignalingEvent::PeerLeave { peer_id }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingErrorKind {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Everything a signaling gateway reports, consumed from a single receiver
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Offer {
        from: PeerId,
        to: PeerId,
        offer: SessionDescription,
    },
    Answer {
        from: PeerId,
        to: PeerId,
        answer: SessionDescription,
    },
    IceCandidate {
        from: PeerId,
        to: PeerId,
        candidate: IceCandidate,
    },
    PeerJoin {
        peer_id: PeerId,
        info: PeerInfo,
    },
    PeerUpdate {
        peer_id: PeerId,
        info: PeerInfo,
    },
    PeerLeave {
        peer_id: PeerId,
    },
    Connected,
    Disconnected,
    Error(SignalingErrorKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_shape() {
        let msg = WireMessage::Offer {
            from_peer_id: PeerId::from("a"),
            to_peer_id: PeerId::from("b"),
            room_id: None,
            offer: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["fromPeerId"], "a");
        assert_eq!(value["toPeerId"], "b");
        assert_eq!(value["offer"]["type"], "offer");
        assert!(value.get("roomId").is_none());
    }

    #[test]
    fn test_join_carries_room_and_info() {
        let msg = WireMessage::Join {
            room_id: RoomId::from("room"),
            peer_id: PeerId::from("me"),
            peer_info: PeerInfo {
                location: Some(GeoLocation::new(1.0, 2.0)),
                ..PeerInfo::default()
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"join""#));
        assert!(json.contains(r#""roomId":"room""#));
        assert!(json.contains(r#""peerInfo":{"location""#));
        assert!(msg.into_event().is_none());
    }

    #[test]
    fn test_parse_server_messages() {
        let raw = r#"{"type":"ice-candidate","fromPeerId":"x","toPeerId":"y",
            "candidate":{"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let event = serde_json::from_str::<WireMessage>(raw)
            .unwrap()
            .into_event()
            .unwrap();
        match event {
            SignalingEvent::IceCandidate { from, candidate, .. } => {
                assert_eq!(from.as_str(), "x");
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let raw = r#"{"type":"peer-update","peerId":"r","peerInfo":{"stats":{
            "connectionState":"connected","uploadKbps":900.0,"downloadKbps":1200.0,
            "latencyMs":35.0,"relayCount":2}}}"#;
        match serde_json::from_str::<WireMessage>(raw).unwrap().into_event().unwrap() {
            SignalingEvent::PeerUpdate { peer_id, info } => {
                assert_eq!(peer_id.as_str(), "r");
                let mut record = PeerRecord::new(peer_id, None);
                info.stats.unwrap().apply_to(&mut record);
                assert_eq!(record.state, ConnectionState::Connected);
                assert_eq!(record.relay_count, 2);
                assert!((record.upload_kbps - 900.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let raw = r#"{"type":"peer-join","peerId":"z"}"#;
        let event = serde_json::from_str::<WireMessage>(raw)
            .unwrap()
            .into_event()
            .unwrap();
        assert_eq!(
            event,
            SignalingEvent::PeerJoin {
                peer_id: PeerId::from("z"),
                info: PeerInfo::default(),
            }
        );
    }
}
