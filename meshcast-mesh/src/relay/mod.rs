//! Relay endpoint
//!
//! A [`PeerNode`] owns one participant's links. Upstream links deliver chunks,
//! downstream links receive whatever this node accepts. Link state changes are
//! processed by a single event task per node, so the relay count always moves
//! together with the transition that caused it.
//!
//! Nodes created from signaling presence alone are *remote*: they only carry the
//! health record used for upstream selection and never open transports.

mod buffer;

pub use buffer::{Intake, SourceBuffer};

use bytes::Bytes;
use dashmap::DashMap;
use meshcast_core::{
    Config, ConnectionState, Error, FrameFormat, GeoLocation, PeerId, PeerRecord, Result,
};
pub use meshcast_core::RelayPolicy;
use meshcast_stream::{frame, ChunkSink, StreamChunk};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::signaling::{IceCandidate, SessionDescription, SignalingGateway};
use crate::transport::{
    ChannelEvent, ChannelEventKind, ChannelEventSender, ConnectionFactory, LinkDirection,
    LinkId, RelayChannel,
};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Minimum contiguous run released to the local sink
    pub min_buffered_chunks: usize,
    pub frame_format: FrameFormat,
    /// Frames queued per downstream before new ones are dropped
    pub outbound_queue_capacity: usize,
    pub policy: RelayPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_buffered_chunks: 5,
            frame_format: FrameFormat::Binary,
            outbound_queue_capacity: 256,
            policy: RelayPolicy::FloodAccepted,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_buffered_chunks: config.stream.min_buffered_chunks,
            frame_format: config.stream.frame_format,
            outbound_queue_capacity: config.mesh.outbound_queue_capacity,
            policy: config.mesh.relay_policy,
        }
    }
}

/// A link that went down without being closed locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFailure {
    pub node: PeerId,
    pub peer: PeerId,
    pub direction: LinkDirection,
    pub state: ConnectionState,
}

/// Transport plumbing of a node hosted by this process
struct Hosting {
    factory: Arc<dyn ConnectionFactory>,
    signaling: Arc<dyn SignalingGateway>,
    events_tx: ChannelEventSender,
    failures: mpsc::UnboundedSender<LinkFailure>,
}

struct UpstreamLink {
    channel: Arc<dyn RelayChannel>,
    state: ConnectionState,
}

struct DownstreamLink {
    channel: Arc<dyn RelayChannel>,
    queue: mpsc::Sender<Bytes>,
    state: ConnectionState,
}

struct NodeState {
    record: PeerRecord,
    connected_downstreams: HashSet<PeerId>,
}

impl NodeState {
    fn sync_relay_count(&mut self) {
        self.record.relay_count = u32::try_from(self.connected_downstreams.len()).unwrap_or(u32::MAX);
    }
}

struct StatsSample {
    at: Instant,
    sent: u64,
    received: u64,
}

pub struct PeerNode {
    id: PeerId,
    state: RwLock<NodeState>,
    hosting: Option<Hosting>,
    config: RelayConfig,
    upstreams: DashMap<PeerId, UpstreamLink>,
    downstreams: DashMap<PeerId, DownstreamLink>,
    buffers: Mutex<HashMap<PeerId, SourceBuffer>>,
    sink: RwLock<Option<Arc<dyn ChunkSink>>>,
    last_sample: Mutex<Option<StatsSample>>,
    /// Set while this node originates the stream
    publishing: AtomicBool,
    cancel: CancellationToken,
}

impl PeerNode {
    /// A peer known only through signaling
    #[must_use]
    pub fn remote(id: PeerId, location: Option<GeoLocation>) -> Arc<Self> {
        Arc::new(Self::build(id, location, RelayConfig::default(), None))
    }

    /// A peer whose links live in this process
    pub fn hosted(
        id: PeerId,
        location: Option<GeoLocation>,
        config: RelayConfig,
        factory: Arc<dyn ConnectionFactory>,
        signaling: Arc<dyn SignalingGateway>,
        failures: mpsc::UnboundedSender<LinkFailure>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let node = Arc::new(Self::build(
            id,
            location,
            config,
            Some(Hosting {
                factory,
                signaling,
                events_tx,
                failures,
            }),
        ));

        tokio::spawn(run_events(
            Arc::downgrade(&node),
            events_rx,
            node.cancel.clone(),
        ));
        node
    }

    fn build(
        id: PeerId,
        location: Option<GeoLocation>,
        config: RelayConfig,
        hosting: Option<Hosting>,
    ) -> Self {
        Self {
            state: RwLock::new(NodeState {
                record: PeerRecord::new(id.clone(), location),
                connected_downstreams: HashSet::new(),
            }),
            id,
            hosting,
            config,
            upstreams: DashMap::new(),
            downstreams: DashMap::new(),
            buffers: Mutex::new(HashMap::new()),
            sink: RwLock::new(None),
            last_sample: Mutex::new(None),
            publishing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub const fn is_hosted(&self) -> bool {
        self.hosting.is_some()
    }

    /// Snapshot of the health record
    #[must_use]
    pub fn record(&self) -> PeerRecord {
        self.state.read().record.clone()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().record.state
    }

    #[must_use]
    pub fn relay_count(&self) -> u32 {
        self.state.read().record.relay_count
    }

    #[must_use]
    pub fn location(&self) -> Option<GeoLocation> {
        self.state.read().record.location.clone()
    }

    /// Apply externally observed figures, such as stats a remote peer advertises
    pub fn update_record(&self, update: impl FnOnce(&mut PeerRecord)) {
        update(&mut self.state.write().record);
    }

    /// Where delivered runs go
    pub fn set_sink(&self, sink: Option<Arc<dyn ChunkSink>>) {
        *self.sink.write() = sink;
    }

    /// Mark this node as the origin of the stream
    pub fn start_publishing(&self) {
        self.publishing.store(true, Ordering::Release);
        self.state.write().record.state = ConnectionState::Connected;
        info!(peer_id = %self.id, "Node is publishing");
    }

    #[must_use]
    pub fn is_publishing(&self) -> bool {
        self.publishing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn upstream_peers(&self) -> Vec<PeerId> {
        self.upstreams.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn downstream_peers(&self) -> Vec<PeerId> {
        self.downstreams.iter().map(|e| e.key().clone()).collect()
    }

    /// Sequence numbers still waiting for delivery from `source`
    #[must_use]
    pub fn pending_sequences(&self, source: &PeerId) -> Vec<u64> {
        self.buffers
            .lock()
            .get(source)
            .map(SourceBuffer::pending_sequences)
            .unwrap_or_default()
    }

    fn hosting(&self) -> Result<&Hosting> {
        self.hosting.as_ref().ok_or_else(|| {
            Error::Connection(format!("peer {} is not hosted by this process", self.id))
        })
    }

    /// Open a link to receive from `peer` and signal the offer
    pub async fn connect_upstream(&self, peer: &PeerId) -> Result<()> {
        let hosting = self.hosting()?;
        if self.upstreams.contains_key(peer) {
            debug!(peer_id = %self.id, upstream = %peer, "Upstream link already exists");
            return Ok(());
        }

        let (channel, offer) = hosting
            .factory
            .open_outbound(&self.id, peer, hosting.events_tx.clone())
            .await?;
        self.upstreams.insert(
            peer.clone(),
            UpstreamLink {
                channel: Arc::clone(&channel),
                state: ConnectionState::Connecting,
            },
        );
        {
            let mut state = self.state.write();
            if state.record.state != ConnectionState::Connected {
                state.record.state = ConnectionState::Connecting;
            }
        }

        if let Err(e) = hosting.signaling.send_offer(&self.id, peer, offer).await {
            self.upstreams.remove(peer);
            channel.close().await;
            hosting
                .factory
                .release(&self.id, peer, LinkDirection::Upstream)
                .await;
            return Err(e);
        }

        debug!(peer_id = %self.id, upstream = %peer, "Offer sent");
        Ok(())
    }

    /// Answer an offer from `peer`, which will receive from this node
    pub async fn accept_downstream(&self, peer: &PeerId, offer: &SessionDescription) -> Result<()> {
        let hosting = self.hosting()?;
        let (channel, answer) = hosting
            .factory
            .accept_inbound(&self.id, peer, offer, hosting.events_tx.clone())
            .await?;

        let (queue, queue_rx) = mpsc::channel(self.config.outbound_queue_capacity.max(1));
        tokio::spawn(run_writer(
            peer.clone(),
            Arc::clone(&channel),
            queue_rx,
            self.cancel.child_token(),
        ));

        let replaced = self.downstreams.insert(
            peer.clone(),
            DownstreamLink {
                channel,
                queue,
                state: ConnectionState::Connecting,
            },
        );
        if let Some(old) = replaced {
            {
                let mut state = self.state.write();
                if state.connected_downstreams.remove(peer) {
                    state.sync_relay_count();
                }
            }
            old.channel.close().await;
        }

        hosting.signaling.send_answer(&self.id, peer, answer).await?;
        debug!(peer_id = %self.id, downstream = %peer, "Answer sent");
        Ok(())
    }

    pub async fn apply_answer(&self, peer: &PeerId, answer: &SessionDescription) -> Result<()> {
        let hosting = self.hosting()?;
        hosting
            .factory
            .apply_answer(&self.id, peer, answer)
            .await
            .map_err(Into::into)
    }

    pub async fn add_ice_candidate(&self, peer: &PeerId, candidate: IceCandidate) -> Result<()> {
        let hosting = self.hosting()?;
        hosting
            .factory
            .add_ice_candidate(&self.id, peer, candidate)
            .await
            .map_err(Into::into)
    }

    /// Chunk intake
    ///
    /// Returns `false` for duplicates and chunks older than what was already
    /// delivered. Accepted chunks are buffered, any long enough contiguous run
    /// goes to the sink, and the chunk is forwarded to every downstream except
    /// `from`.
    pub fn handle_chunk(&self, chunk: StreamChunk, from: Option<&PeerId>) -> bool {
        let run = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(chunk.source_id.clone()).or_default();
            match buffer.insert(chunk.clone()) {
                Intake::Accepted => {}
                intake => {
                    trace!(
                        peer_id = %self.id,
                        source = %chunk.source_id,
                        seq = chunk.seq_number,
                        ?intake,
                        "Chunk discarded"
                    );
                    return false;
                }
            }
            buffer.take_run(self.config.min_buffered_chunks)
        };

        if let Some(run) = run {
            let sink = self.sink.read().clone();
            if let Some(sink) = sink {
                sink.deliver(run);
            }
        }

        if self.config.policy == RelayPolicy::FloodAccepted {
            self.relay(&chunk, from);
        }
        true
    }

    /// Send a locally produced chunk to every downstream
    pub fn publish(&self, chunk: &StreamChunk) -> usize {
        self.relay(chunk, None)
    }

    fn relay(&self, chunk: &StreamChunk, exclude: Option<&PeerId>) -> usize {
        if self.downstreams.is_empty() {
            return 0;
        }
        let frame = match frame::encode(chunk, self.config.frame_format) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer_id = %self.id, chunk = %chunk.id, error = %e, "Failed to encode chunk");
                return 0;
            }
        };

        let mut queued = 0;
        for link in &self.downstreams {
            if exclude == Some(link.key()) || link.state != ConnectionState::Connected {
                continue;
            }
            match link.queue.try_send(frame.clone()) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(peer_id = %self.id, downstream = %link.key(), "Outbound queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        queued
    }

    /// Close the link to an upstream without reporting it as a failure
    pub async fn drop_upstream(&self, peer: &PeerId) {
        let Some((_, link)) = self.upstreams.remove(peer) else {
            return;
        };
        link.channel.close().await;
        if let Some(hosting) = &self.hosting {
            hosting
                .factory
                .release(&self.id, peer, LinkDirection::Upstream)
                .await;
        }
        debug!(peer_id = %self.id, upstream = %peer, "Upstream link dropped");
    }

    /// Stop relaying to `peer` without reporting it as a failure
    pub async fn release_downstream(&self, peer: &PeerId) {
        let Some((_, link)) = self.downstreams.remove(peer) else {
            return;
        };
        {
            let mut state = self.state.write();
            if state.connected_downstreams.remove(peer) {
                state.sync_relay_count();
            }
        }
        link.channel.close().await;
        if let Some(hosting) = &self.hosting {
            hosting
                .factory
                .release(&self.id, peer, LinkDirection::Downstream)
                .await;
        }
        debug!(peer_id = %self.id, downstream = %peer, "Downstream link released");
    }

    /// Close every link and return to `disconnected`
    pub async fn disconnect(&self) {
        let upstreams: Vec<_> = self
            .upstreams
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.channel)))
            .collect();
        self.upstreams.clear();
        let downstreams: Vec<_> = self
            .downstreams
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.channel)))
            .collect();
        self.downstreams.clear();

        {
            let mut state = self.state.write();
            state.connected_downstreams.clear();
            state.record.relay_count = 0;
            state.record.state = ConnectionState::Disconnected;
        }
        self.publishing.store(false, Ordering::Release);

        let links = upstreams
            .into_iter()
            .map(|(peer, channel)| (peer, channel, LinkDirection::Upstream))
            .chain(
                downstreams
                    .into_iter()
                    .map(|(peer, channel)| (peer, channel, LinkDirection::Downstream)),
            );
        for (peer, channel, direction) in links {
            channel.close().await;
            if let Some(hosting) = &self.hosting {
                hosting.factory.release(&self.id, &peer, direction).await;
            }
        }

        info!(peer_id = %self.id, "Node disconnected");
    }

    /// Refresh bandwidth and latency from the active channels
    ///
    /// Rates are computed from the byte counter deltas since the previous
    /// call. Latency is the mean round-trip time over channels that reported
    /// one. Figures no channel could provide keep their previous value.
    pub async fn update_stats(&self) {
        let channels: Vec<Arc<dyn RelayChannel>> = self
            .upstreams
            .iter()
            .map(|e| Arc::clone(&e.channel))
            .chain(self.downstreams.iter().map(|e| Arc::clone(&e.channel)))
            .collect();
        if channels.is_empty() {
            return;
        }

        let mut reported = false;
        let (mut sent, mut received) = (0u64, 0u64);
        let (mut rtt_sum, mut rtt_count) = (0.0f64, 0u32);
        for channel in channels {
            let Some(stats) = channel.stats().await else {
                continue;
            };
            reported = true;
            sent += stats.bytes_sent;
            received += stats.bytes_received;
            if let Some(rtt) = stats.rtt_ms {
                rtt_sum += rtt;
                rtt_count += 1;
            }
        }
        if !reported {
            return;
        }

        let now = Instant::now();
        let previous = self.last_sample.lock().replace(StatsSample {
            at: now,
            sent,
            received,
        });

        let mut state = self.state.write();
        if let Some(previous) = previous {
            let secs = now.duration_since(previous.at).as_secs_f64();
            if secs > 0.0 {
                state.record.upload_kbps = rate_kbps(previous.sent, sent, secs);
                state.record.download_kbps = rate_kbps(previous.received, received, secs);
            }
        }
        if rtt_count > 0 {
            state.record.latency_ms = rtt_sum / f64::from(rtt_count);
        }
        trace!(
            peer_id = %self.id,
            upload_kbps = state.record.upload_kbps,
            download_kbps = state.record.download_kbps,
            latency_ms = state.record.latency_ms,
            "Stats updated"
        );
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event.kind {
            ChannelEventKind::Message(frame) => match frame::decode(&frame) {
                Ok(chunk) => {
                    self.handle_chunk(chunk, Some(&event.peer));
                }
                Err(e) => {
                    debug!(peer_id = %self.id, from = %event.peer, error = %e, "Undecodable frame");
                }
            },
            ChannelEventKind::IceCandidate(candidate) => {
                if let Some(hosting) = &self.hosting {
                    if let Err(e) = hosting
                        .signaling
                        .send_ice_candidate(&self.id, &event.peer, candidate)
                        .await
                    {
                        warn!(peer_id = %self.id, to = %event.peer, error = %e, "Failed to signal ICE candidate");
                    }
                }
            }
            ChannelEventKind::State(state) => {
                let failed = match event.direction {
                    LinkDirection::Upstream => {
                        self.on_upstream_state(&event.peer, event.link, state)
                    }
                    LinkDirection::Downstream => {
                        self.on_downstream_state(&event.peer, event.link, state)
                    }
                };
                if failed {
                    self.report_failure(event.peer, event.direction, state).await;
                }
            }
        }
    }

    /// Returns whether the link went down
    fn on_upstream_state(&self, peer: &PeerId, channel: LinkId, state: ConnectionState) -> bool {
        {
            let Some(mut link) = self.upstreams.get_mut(peer) else {
                trace!(peer_id = %self.id, upstream = %peer, %state, "State for unknown upstream");
                return false;
            };
            // Late callback from a channel that was already replaced
            if link.channel.link_id() != channel {
                trace!(peer_id = %self.id, upstream = %peer, %channel, %state, "State for a replaced channel");
                return false;
            }
            link.state = state;
        }

        let mut node = self.state.write();
        match state {
            ConnectionState::Connecting => {
                if node.record.state != ConnectionState::Connected {
                    node.record.state = ConnectionState::Connecting;
                }
                false
            }
            ConnectionState::Connected => {
                node.record.state = ConnectionState::Connected;
                info!(peer_id = %self.id, upstream = %peer, "Upstream connected");
                false
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.upstreams.remove(peer);
                let still_fed = self.is_publishing()
                    || self
                        .upstreams
                        .iter()
                        .any(|link| link.state.is_connected());
                if !still_fed {
                    node.record.state = state;
                }
                info!(peer_id = %self.id, upstream = %peer, %state, "Upstream lost");
                true
            }
        }
    }

    fn on_downstream_state(&self, peer: &PeerId, channel: LinkId, state: ConnectionState) -> bool {
        {
            let Some(mut link) = self.downstreams.get_mut(peer) else {
                trace!(peer_id = %self.id, downstream = %peer, %state, "State for unknown downstream");
                return false;
            };
            if link.channel.link_id() != channel {
                trace!(peer_id = %self.id, downstream = %peer, %channel, %state, "State for a replaced channel");
                return false;
            }
            link.state = state;
        }

        let mut node = self.state.write();
        match state {
            ConnectionState::Connecting => false,
            ConnectionState::Connected => {
                node.connected_downstreams.insert(peer.clone());
                node.sync_relay_count();
                info!(peer_id = %self.id, downstream = %peer, relay_count = node.record.relay_count, "Downstream connected");
                false
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.downstreams.remove(peer);
                node.connected_downstreams.remove(peer);
                node.sync_relay_count();
                info!(peer_id = %self.id, downstream = %peer, %state, relay_count = node.record.relay_count, "Downstream lost");
                true
            }
        }
    }

    async fn report_failure(&self, peer: PeerId, direction: LinkDirection, state: ConnectionState) {
        let Some(hosting) = &self.hosting else {
            return;
        };
        hosting.factory.release(&self.id, &peer, direction).await;
        let _ = hosting.failures.send(LinkFailure {
            node: self.id.clone(),
            peer,
            direction,
            state,
        });
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate_kbps(before: u64, after: u64, secs: f64) -> f64 {
    after.saturating_sub(before) as f64 * 8.0 / 1000.0 / secs
}

async fn run_events(
    node: Weak<PeerNode>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(node) = node.upgrade() else {
            break;
        };
        node.handle_channel_event(event).await;
    }
}

async fn run_writer(
    peer: PeerId,
    channel: Arc<dyn RelayChannel>,
    mut queue: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = channel.send(frame).await {
            debug!(downstream = %peer, error = %e, "Relay write failed");
        }
    }
}
