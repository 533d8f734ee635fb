//! Shared building blocks for the meshcast overlay
//!
//! Identifiers, peer health records, geographic scoring helpers, quality
//! presets, configuration and logging used by every other meshcast crate.

pub mod config;
pub mod error;
pub mod logging;
pub mod quality;
pub mod types;

pub use config::{
    BottleneckConfig, Config, FrameFormat, LoggingConfig, MeshConfig, RelayPolicy,
    SignalingConfig, StreamConfig,
};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use quality::{CaptureEstimate, StreamQuality, VideoConstraints};
pub use types::{distance_between, ConnectionState, GeoLocation, PeerId, PeerRecord, RoomId};
