//! Session orchestration
//!
//! [`MeshSession`] ties one local participant to the mesh: it routes signaling
//! events into the topology controller and runs either the broadcasting side
//! (producer publishing through the local node) or the viewing side (local node
//! feeding a chunk consumer).

use bytes::Bytes;
use futures::Stream;
use meshcast_core::{
    CaptureEstimate, Config, Error, GeoLocation, PeerId, Result, StreamQuality, VideoConstraints,
};
use meshcast_stream::{
    ChunkConsumer, ChunkProducer, ChunkSink, PlaybackSink, ProducerConfig, StreamChunk,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::signaling::{SignalingEvent, SignalingGateway};
use crate::snapshot::TopologySnapshot;
use crate::topology::{MeshTopology, MonitorHandle};
use crate::transport::ConnectionFactory;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connect,
    Disconnect,
    StreamStart { source: PeerId },
    ViewStart { upstreams: Vec<PeerId> },
    StreamStop,
    QualityChange {
        quality: StreamQuality,
        constraints: VideoConstraints,
    },
    NetworkStats(TopologySnapshot),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Idle,
    Broadcaster,
    Viewer,
}

pub struct MeshSession {
    config: Config,
    peer_id: PeerId,
    signaling: Arc<dyn SignalingGateway>,
    topology: Arc<MeshTopology>,
    events: broadcast::Sender<SessionEvent>,
    role: Mutex<Role>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<MonitorHandle>>,
    producer: Mutex<Option<Arc<ChunkProducer>>>,
    consumer: Mutex<Option<Arc<ChunkConsumer>>>,
    stopped: AtomicBool,
}

impl MeshSession {
    /// Create a session; a `peer-xxxxxxx` id is generated when none is given
    pub fn new(
        config: Config,
        peer_id: Option<PeerId>,
        signaling: Arc<dyn SignalingGateway>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Arc<Self> {
        let peer_id = peer_id.unwrap_or_else(PeerId::generate);
        let topology = MeshTopology::new(&config, factory, Arc::clone(&signaling));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            config,
            peer_id,
            signaling,
            topology,
            events,
            role: Mutex::new(Role::Idle),
            dispatcher: Mutex::new(None),
            monitor: Mutex::new(None),
            producer: Mutex::new(None),
            consumer: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub const fn topology(&self) -> &Arc<MeshTopology> {
        &self.topology
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Connection("session already stopped".to_string()));
        }
        Ok(())
    }

    /// Start dispatching signaling events into the topology
    pub fn start(&self) -> Result<()> {
        self.ensure_running()?;
        let mut rx = self
            .signaling
            .take_event_receiver()
            .ok_or_else(|| Error::Signaling("event receiver already taken".to_string()))?;

        let topology = Arc::clone(&self.topology);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let session_event = match &event {
                    SignalingEvent::Connected => Some(SessionEvent::Connect),
                    SignalingEvent::Disconnected => Some(SessionEvent::Disconnect),
                    SignalingEvent::Error(kind) => Some(SessionEvent::Error(kind.to_string())),
                    _ => None,
                };
                if let Some(session_event) = session_event {
                    let _ = events.send(session_event);
                }
                topology.handle_signaling_event(event).await;
            }
            debug!("Signaling event stream ended");
        });

        *self.dispatcher.lock() = Some(handle);
        info!(peer_id = %self.peer_id, "Session started");
        Ok(())
    }

    fn start_monitor(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            let period = Duration::from_secs(self.config.mesh.monitoring_interval_secs);
            *monitor = Some(self.topology.monitor(period));
        }
    }

    /// Broadcast `capture` as the source of the room
    pub fn start_streaming<S>(&self, capture: S) -> Result<Arc<ChunkProducer>>
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        self.ensure_running()?;
        let node = self.topology.add_peer(self.peer_id.clone(), None);
        node.start_publishing();
        self.topology.set_source_node(self.peer_id.clone());

        let producer = ChunkProducer::new(
            self.peer_id.clone(),
            capture,
            ProducerConfig::from(&self.config.stream),
        );
        producer.add_listener(Arc::new(move |chunk: &StreamChunk| -> anyhow::Result<()> {
            node.publish(chunk);
            Ok(())
        }));
        producer.start_chunking();

        *self.producer.lock() = Some(Arc::clone(&producer));
        *self.role.lock() = Role::Broadcaster;
        self.start_monitor();

        info!(peer_id = %self.peer_id, "Streaming started");
        self.emit(SessionEvent::StreamStart {
            source: self.peer_id.clone(),
        });
        Ok(producer)
    }

    /// Join the mesh as a viewer, writing the reassembled stream to `sink`
    pub async fn start_viewing(
        &self,
        location: Option<GeoLocation>,
        sink: Arc<dyn PlaybackSink>,
    ) -> Result<Vec<PeerId>> {
        self.ensure_running()?;
        let node = self.topology.add_peer(self.peer_id.clone(), location);
        let consumer = ChunkConsumer::spawn(sink);
        node.set_sink(Some(Arc::clone(&consumer) as Arc<dyn ChunkSink>));
        *self.consumer.lock() = Some(consumer);
        *self.role.lock() = Role::Viewer;

        let upstreams = self.topology.connect_peer(&self.peer_id).await;
        self.start_monitor();

        info!(peer_id = %self.peer_id, upstreams = ?upstreams, "Viewing started");
        self.emit(SessionEvent::ViewStart {
            upstreams: upstreams.clone(),
        });
        Ok(upstreams)
    }

    /// Broadcasters resolve new capture constraints; viewers look for better upstreams
    pub async fn change_quality(
        &self,
        quality: StreamQuality,
        estimate: &CaptureEstimate,
    ) -> Option<VideoConstraints> {
        let role = *self.role.lock();
        match role {
            Role::Broadcaster => {
                let constraints = quality.resolve(estimate);
                info!(%quality, ?constraints, "Stream quality changed");
                self.emit(SessionEvent::QualityChange {
                    quality,
                    constraints,
                });
                Some(constraints)
            }
            Role::Viewer => {
                let rewires = self.topology.optimize_topology().await;
                debug!(rewires = rewires.len(), "Topology optimized on quality change");
                None
            }
            Role::Idle => None,
        }
    }

    pub fn network_snapshot(&self) -> TopologySnapshot {
        let snapshot = self.topology.snapshot();
        self.emit(SessionEvent::NetworkStats(snapshot.clone()));
        snapshot
    }

    /// Tear everything down; later calls do nothing
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let producer = self.producer.lock().take();
        if let Some(producer) = producer {
            producer.stop_chunking();
        }
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.dispose().await;
        }
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        if let Some(node) = self.topology.node(&self.peer_id) {
            node.set_sink(None);
            node.disconnect().await;
        }
        self.signaling.close().await;
        *self.role.lock() = Role::Idle;

        info!(peer_id = %self.peer_id, "Session stopped");
        self.emit(SessionEvent::StreamStop);
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{MockSignaling, MockSignalingConfig};
    use crate::transport::MemoryNetwork;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl PlaybackSink for NullSink {
        async fn append(&self, _data: Bytes) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn session() -> (Arc<MeshSession>, Arc<MockSignaling>) {
        let signaling = MockSignaling::new(MockSignalingConfig::loopback());
        let network = MemoryNetwork::new();
        let session = MeshSession::new(
            Config::default(),
            None,
            signaling.clone(),
            network.factory(),
        );
        (session, signaling)
    }

    #[tokio::test]
    async fn test_generated_peer_id_and_connect_event() {
        let (session, _signaling) = session();
        assert!(session.peer_id().as_str().starts_with("peer-"));

        let mut events = session.subscribe();
        session.start().unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connect);
        assert!(session.start().is_err());
    }

    #[tokio::test]
    async fn test_broadcaster_quality_change_and_stop() {
        let (session, signaling) = session();
        let mut events = session.subscribe();
        session.start().unwrap();

        let producer = session
            .start_streaming(futures::stream::empty::<Bytes>())
            .unwrap();
        assert!(producer.is_running());
        assert_eq!(session.topology().source_node(), Some(session.peer_id().clone()));

        let constraints = session
            .change_quality(StreamQuality::High, &CaptureEstimate::default())
            .await;
        assert_eq!(constraints, Some(VideoConstraints::HIGH));

        session.stop().await;
        session.stop().await;
        assert!(!producer.is_running());
        assert!(signaling.is_closed());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SessionEvent::StreamStart {
            source: session.peer_id().clone()
        }));
        assert_eq!(seen.iter().filter(|e| **e == SessionEvent::StreamStop).count(), 1);
        assert!(session.start_streaming(futures::stream::empty::<Bytes>()).is_err());
    }

    #[tokio::test]
    async fn test_viewer_without_upstreams() {
        let (session, _signaling) = session();
        session.start().unwrap();
        let upstreams = session
            .start_viewing(Some(GeoLocation::new(37.5, 127.0)), Arc::new(NullSink))
            .await
            .unwrap();
        assert!(upstreams.is_empty());
        assert_eq!(
            session
                .change_quality(StreamQuality::Low, &CaptureEstimate::default())
                .await,
            None
        );

        let snapshot = session.network_snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        session.stop().await;
    }
}
