//! In-process signaling double
//!
//! Simulates the timing of a real signaling server: the connection comes up
//! after a delay, a remote viewer can be made to join, and offers can be
//! answered automatically. In loopback mode every directed message is handed
//! straight back as an inbound event, which lets one process host a whole mesh.

use async_trait::async_trait;
use meshcast_core::{Error, GeoLocation, PeerId, Result};
use parking_lot::Mutex;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::message::{PeerInfo, SessionDescription, SignalingEvent, WireMessage};
use super::SignalingGateway;

pub const MOCK_ANSWER_SDP: &str = "mock-sdp-answer";

#[derive(Debug, Clone)]
pub struct MockSignalingConfig {
    pub connect_delay: Duration,
    /// Answer every offer with [`MOCK_ANSWER_SDP`] after this delay
    pub auto_answer: Option<Duration>,
    /// Announce a random remote peer this long after connecting
    pub simulated_join: Option<Duration>,
    /// Re-emit directed messages as inbound events
    pub loopback: bool,
}

impl Default for MockSignalingConfig {
    fn default() -> Self {
        Self {
            connect_delay: Duration::from_secs(1),
            auto_answer: Some(Duration::from_millis(500)),
            simulated_join: Some(Duration::from_secs(3)),
            loopback: false,
        }
    }
}

impl MockSignalingConfig {
    /// Immediate, silent loopback used to run several nodes in one process
    #[must_use]
    pub const fn loopback() -> Self {
        Self {
            connect_delay: Duration::ZERO,
            auto_answer: None,
            simulated_join: None,
            loopback: true,
        }
    }
}

pub struct MockSignaling {
    config: MockSignalingConfig,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    sent: Mutex<Vec<WireMessage>>,
    closed: AtomicBool,
}

impl MockSignaling {
    pub fn new(config: MockSignalingConfig) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let signaling = Arc::new(Self {
            config,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let tx = signaling.event_tx.clone();
        let connect_delay = signaling.config.connect_delay;
        let simulated_join = signaling.config.simulated_join;
        tokio::spawn(async move {
            tokio::time::sleep(connect_delay).await;
            if tx.send(SignalingEvent::Connected).is_err() {
                return;
            }
            if let Some(delay) = simulated_join {
                tokio::time::sleep(delay).await;
                let peer_id = PeerId::generate();
                let info = PeerInfo {
                    location: Some(random_location(&peer_id)),
                    ..PeerInfo::default()
                };
                debug!(peer_id = %peer_id, "Simulated peer join");
                let _ = tx.send(SignalingEvent::PeerJoin { peer_id, info });
            }
        });

        signaling
    }

    /// Everything sent through this gateway, in order
    #[must_use]
    pub fn sent_messages(&self) -> Vec<WireMessage> {
        self.sent.lock().clone()
    }

    /// Inject an arbitrary inbound event
    pub fn inject(&self, event: SignalingEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn simulate_peer_join(&self, peer_id: PeerId, info: PeerInfo) {
        self.inject(SignalingEvent::PeerJoin { peer_id, info });
    }

    pub fn simulate_peer_leave(&self, peer_id: PeerId) {
        self.inject(SignalingEvent::PeerLeave { peer_id });
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SignalingGateway for MockSignaling {
    async fn send(&self, message: WireMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Signaling("mock signaling closed".to_string()));
        }
        self.sent.lock().push(message.clone());

        if let (Some(delay), WireMessage::Offer {
            from_peer_id,
            to_peer_id,
            ..
        }) = (self.config.auto_answer, &message)
        {
            let tx = self.event_tx.clone();
            let event = SignalingEvent::Answer {
                from: to_peer_id.clone(),
                to: from_peer_id.clone(),
                answer: SessionDescription::answer(MOCK_ANSWER_SDP),
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(event);
            });
        }

        if self.config.loopback {
            if let Some(event) = message.into_event() {
                let _ = self.event_tx.send(event);
            }
        }

        Ok(())
    }

    fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.event_rx.lock().take()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.event_tx.send(SignalingEvent::Disconnected);
        }
    }
}

/// Somewhere around Seoul, derived from the peer id
fn random_location(peer_id: &PeerId) -> GeoLocation {
    let mut hasher = std::collections::hash_map::RandomState::new().build_hasher();
    peer_id.hash(&mut hasher);
    let bits = hasher.finish();
    #[allow(clippy::cast_precision_loss)]
    let (a, b) = ((bits & 0xffff) as f64 / 65535.0, ((bits >> 16) & 0xffff) as f64 / 65535.0);
    GeoLocation::new(a.mul_add(0.1, 37.5), b.mul_add(0.1, 127.0))
}
