//! Mesh side of meshcast
//!
//! Relay endpoints exchange chunks over negotiated channels, the topology
//! controller decides who feeds whom, signaling carries negotiation and room
//! presence, and [`MeshSession`] ties one local participant to all of it.

pub mod relay;
pub mod session;
pub mod signaling;
pub mod snapshot;
pub mod topology;
pub mod transport;

pub use relay::{LinkFailure, PeerNode, RelayConfig, RelayPolicy};
pub use session::{MeshSession, SessionEvent};
pub use signaling::{
    MockSignaling, MockSignalingConfig, PeerInfo, SignalingEvent, SignalingGateway,
    WebSocketSignaling, WebSocketSignalingConfig, WireMessage,
};
pub use snapshot::TopologySnapshot;
pub use topology::{MeshTopology, MonitorHandle, OverlayGraph, Rewire};
pub use transport::{
    ConnectionFactory, LinkDirection, LinkId, MemoryConnectionFactory, MemoryNetwork, RelayChannel,
    TransportError, WebRtcConnectionFactory,
};
