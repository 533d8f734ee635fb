//! Overlay topology controller
//!
//! Keeps the directed relay graph, picks upstreams for joining peers, rewires
//! around bottlenecks and heals the mesh when peers leave or links fail.
//! Every edge mutation happens under one writer lock, so join, leave,
//! optimization and failure handling never interleave.

mod graph;
pub mod selection;

pub use graph::OverlayGraph;
pub use selection::CandidateFilter;

use indexmap::IndexMap;
use meshcast_core::{Config, GeoLocation, MeshConfig, PeerId, PeerRecord};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::relay::{LinkFailure, PeerNode, RelayConfig};
use crate::signaling::{AdvertisedStats, PeerInfo, SignalingEvent, SignalingGateway};
use crate::snapshot::{SnapshotEdge, SnapshotNode, TopologySnapshot};
use crate::transport::{ConnectionFactory, LinkDirection};

/// One downstream moved off a bottleneck
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewire {
    pub peer: PeerId,
    pub from: PeerId,
    pub to: PeerId,
}

/// Handle to a running health monitor
///
/// Cancelling stops future ticks; a tick already running completes.
pub struct MonitorHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the loop to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Monitor task ended abnormally");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

pub struct MeshTopology {
    mesh: MeshConfig,
    relay: RelayConfig,
    factory: Arc<dyn ConnectionFactory>,
    signaling: Arc<dyn SignalingGateway>,
    nodes: RwLock<IndexMap<PeerId, Arc<PeerNode>>>,
    graph: RwLock<OverlayGraph>,
    source: RwLock<Option<PeerId>>,
    /// Serializes edge mutations
    writer: Mutex<()>,
    failures_tx: mpsc::UnboundedSender<LinkFailure>,
    cancel: CancellationToken,
}

impl MeshTopology {
    pub fn new(
        config: &Config,
        factory: Arc<dyn ConnectionFactory>,
        signaling: Arc<dyn SignalingGateway>,
    ) -> Arc<Self> {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let topology = Arc::new(Self {
            mesh: config.mesh.clone(),
            relay: RelayConfig::from_config(config),
            factory,
            signaling,
            nodes: RwLock::new(IndexMap::new()),
            graph: RwLock::new(OverlayGraph::new()),
            source: RwLock::new(None),
            writer: Mutex::new(()),
            failures_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_failures(
            Arc::downgrade(&topology),
            failures_rx,
            topology.cancel.clone(),
        ));
        topology
    }

    /// Register a peer hosted by this process, in `disconnected`
    pub fn add_peer(&self, id: PeerId, location: Option<GeoLocation>) -> Arc<PeerNode> {
        if let Some(existing) = self.node(&id) {
            if existing.is_hosted() {
                return existing;
            }
        }
        let node = PeerNode::hosted(
            id.clone(),
            location,
            self.relay.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.signaling),
            self.failures_tx.clone(),
        );
        self.graph.write().ensure_node(&id);
        self.nodes.write().insert(id.clone(), Arc::clone(&node));
        info!(peer_id = %id, "Peer added");
        node
    }

    fn register_remote(&self, id: &PeerId, info: &PeerInfo) -> Arc<PeerNode> {
        if let Some(existing) = self.node(id) {
            return existing;
        }
        let node = PeerNode::remote(id.clone(), info.location.clone());
        self.graph.write().ensure_node(id);
        self.nodes.write().insert(id.clone(), Arc::clone(&node));
        debug!(peer_id = %id, "Remote peer registered");
        node
    }

    pub fn set_source_node(&self, id: PeerId) {
        info!(source = %id, "Source node set");
        *self.source.write() = Some(id);
    }

    #[must_use]
    pub fn source_node(&self) -> Option<PeerId> {
        self.source.read().clone()
    }

    #[must_use]
    pub fn node(&self, id: &PeerId) -> Option<Arc<PeerNode>> {
        self.nodes.read().get(id).cloned()
    }

    fn hosted_node(&self, id: &PeerId) -> Option<Arc<PeerNode>> {
        self.node(id).filter(|node| node.is_hosted())
    }

    /// All nodes in registration order
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<PeerNode>> {
        self.nodes.read().values().cloned().collect()
    }

    #[must_use]
    pub fn records(&self) -> Vec<PeerRecord> {
        self.nodes.read().values().map(|node| node.record()).collect()
    }

    /// Copy of the overlay graph
    #[must_use]
    pub fn graph(&self) -> OverlayGraph {
        self.graph.read().clone()
    }

    #[must_use]
    pub fn upstreams_of(&self, id: &PeerId) -> Vec<PeerId> {
        self.graph.read().upstreams(id)
    }

    #[must_use]
    pub fn downstreams_of(&self, id: &PeerId) -> Vec<PeerId> {
        self.graph.read().downstreams(id)
    }

    /// Best `count` upstream candidates for a peer at `location`
    ///
    /// An empty result means no upstream is available; nothing is retried.
    #[must_use]
    pub fn find_optimal_upstreams(&self, location: Option<&GeoLocation>, count: usize) -> Vec<PeerId> {
        self.select_upstreams(location, count, &[])
    }

    fn select_upstreams(
        &self,
        location: Option<&GeoLocation>,
        count: usize,
        exclude: &[PeerId],
    ) -> Vec<PeerId> {
        let records: Vec<PeerRecord> = self
            .records()
            .into_iter()
            .filter(|record| !exclude.contains(&record.id))
            .collect();
        let filter = CandidateFilter::from(&self.mesh);
        let mut selected: Vec<PeerId> = selection::rank(location, &records, &filter)
            .into_iter()
            .take(count)
            .map(|(id, _)| id)
            .collect();

        if count > 0 {
            if let Some(source) = self.source_node() {
                if !exclude.contains(&source) && !selected.contains(&source) {
                    selected.insert(0, source);
                    selected.truncate(count);
                }
            }
        }
        selected
    }

    /// Peers whose load, latency or bandwidth crosses a threshold
    #[must_use]
    pub fn detect_bottlenecks(&self) -> Vec<PeerId> {
        let limits = &self.mesh.bottleneck;
        self.records()
            .into_iter()
            .filter(|r| {
                r.relay_count > limits.max_relay_count
                    || r.latency_ms > limits.max_latency_ms
                    || r.upload_kbps < limits.min_upload_kbps
                    || r.download_kbps < limits.min_download_kbps
            })
            .map(|r| r.id)
            .collect()
    }

    /// Move the downstreams of every bottleneck to another upstream
    pub async fn optimize_topology(&self) -> Vec<Rewire> {
        let _guard = self.writer.lock().await;
        self.optimize_locked().await
    }

    async fn optimize_locked(&self) -> Vec<Rewire> {
        let mut rewires = Vec::new();

        for bottleneck in self.detect_bottlenecks() {
            let downstreams = self.graph.read().downstreams(&bottleneck);
            for downstream in downstreams {
                let Some(node) = self.node(&downstream) else {
                    continue;
                };
                let current = self.graph.read().upstreams(&downstream);
                let exclude = [bottleneck.clone(), downstream.clone()];
                let candidates = self.select_upstreams(
                    node.location().as_ref(),
                    self.mesh.upstream_count,
                    &exclude,
                );

                let candidates: Vec<PeerId> = {
                    let graph = self.graph.read();
                    candidates
                        .into_iter()
                        .filter(|candidate| {
                            !current.contains(candidate)
                                && !graph.would_create_cycle(candidate, &downstream)
                        })
                        .collect()
                };

                // The old link stays up until a new one has been offered
                let mut replacement = None;
                for candidate in candidates {
                    if node.is_hosted() {
                        if let Err(e) = node.connect_upstream(&candidate).await {
                            warn!(peer_id = %downstream, upstream = %candidate, error = %e, "Rewire connection failed");
                            continue;
                        }
                    }
                    replacement = Some(candidate);
                    break;
                }
                let Some(replacement) = replacement else {
                    debug!(peer_id = %downstream, bottleneck = %bottleneck, "No replacement upstream");
                    continue;
                };

                {
                    let mut graph = self.graph.write();
                    graph.remove_edge(&bottleneck, &downstream);
                    graph.add_edge(&replacement, &downstream);
                }
                if node.is_hosted() {
                    node.drop_upstream(&bottleneck).await;
                }
                if let Some(old) = self.hosted_node(&bottleneck) {
                    old.release_downstream(&downstream).await;
                }

                info!(
                    peer_id = %downstream,
                    from = %bottleneck,
                    to = %replacement,
                    "Rewired away from bottleneck"
                );
                rewires.push(Rewire {
                    peer: downstream,
                    from: bottleneck.clone(),
                    to: replacement,
                });
            }
        }

        rewires
    }

    /// Top a node up to the configured number of upstreams
    async fn wire_upstreams_locked(&self, node: &Arc<PeerNode>, exclude: &[PeerId]) -> Vec<PeerId> {
        let id = node.id().clone();
        let current = self.graph.read().upstreams(&id);
        let wanted = self.mesh.upstream_count.saturating_sub(current.len());
        if wanted == 0 {
            return Vec::new();
        }

        let mut excluded: Vec<PeerId> = exclude.to_vec();
        excluded.push(id.clone());
        excluded.extend(current);
        let candidates = self.select_upstreams(node.location().as_ref(), wanted, &excluded);

        let mut wired = Vec::new();
        for upstream in candidates {
            if self.graph.read().would_create_cycle(&upstream, &id) {
                debug!(peer_id = %id, upstream = %upstream, "Skipping candidate that closes a cycle");
                continue;
            }
            self.graph.write().add_edge(&upstream, &id);

            if node.is_hosted() {
                if let Err(e) = node.connect_upstream(&upstream).await {
                    warn!(peer_id = %id, upstream = %upstream, error = %e, "Failed to connect upstream");
                    self.graph.write().remove_edge(&upstream, &id);
                    continue;
                }
            }
            wired.push(upstream);
        }

        if wired.is_empty() {
            warn!(peer_id = %id, "No upstream available");
        } else {
            info!(peer_id = %id, upstreams = ?wired, "Upstreams wired");
        }
        wired
    }

    /// Wire upstreams for a node that is already registered
    pub async fn connect_peer(&self, id: &PeerId) -> Vec<PeerId> {
        let _guard = self.writer.lock().await;
        match self.node(id) {
            Some(node) => self.wire_upstreams_locked(&node, &[]).await,
            None => Vec::new(),
        }
    }

    /// Register a joining peer and wire its upstreams
    pub async fn handle_peer_join(&self, id: PeerId, info: PeerInfo) -> Vec<PeerId> {
        let _guard = self.writer.lock().await;
        let node = self.register_remote(&id, &info);
        info!(peer_id = %id, hosted = node.is_hosted(), is_source = info.is_source, "Peer joined");

        apply_peer_info(&node, &info);

        if info.is_source {
            *self.source.write() = Some(id);
            return Vec::new();
        }
        if self.source_node().as_ref() == Some(&id) {
            return Vec::new();
        }
        self.wire_upstreams_locked(&node, &[]).await
    }

    /// Refresh what a remote peer advertises about itself
    ///
    /// Hosted peers keep their own measurements; updates for them are ignored.
    pub fn handle_peer_update(&self, id: PeerId, info: PeerInfo) {
        let node = self.register_remote(&id, &info);
        if node.is_hosted() {
            return;
        }
        apply_peer_info(&node, &info);
        if info.is_source && self.source_node().as_ref() != Some(&id) {
            self.set_source_node(id.clone());
        }
        debug!(peer_id = %id, state = %node.connection_state(), relay_count = node.relay_count(), "Peer stats updated");
    }

    /// Send the health of every hosted peer to the room
    pub async fn advertise_stats(&self) {
        let source = self.source_node();
        for node in self.nodes().into_iter().filter(|node| node.is_hosted()) {
            let record = node.record();
            let info = PeerInfo {
                location: record.location.clone(),
                is_source: source.as_ref() == Some(&record.id),
                stats: Some(AdvertisedStats::from(&record)),
            };
            if let Err(e) = self.signaling.send_peer_update(&record.id, info).await {
                debug!(peer_id = %record.id, error = %e, "Failed to advertise stats");
            }
        }
    }

    /// Remove a departed peer and re-home its downstreams
    pub async fn handle_peer_leave(&self, id: &PeerId) {
        let _guard = self.writer.lock().await;
        let Some(node) = self.nodes.write().shift_remove(id) else {
            debug!(peer_id = %id, "Leave for unknown peer");
            return;
        };

        let (upstreams, downstreams) = {
            let mut graph = self.graph.write();
            let upstreams = graph.upstreams(id);
            (upstreams, graph.remove_node(id))
        };
        {
            let mut source = self.source.write();
            if source.as_ref() == Some(id) {
                *source = None;
            }
        }
        info!(peer_id = %id, downstreams = downstreams.len(), "Peer left");

        if node.is_hosted() {
            node.disconnect().await;
        }
        for upstream in &upstreams {
            if let Some(up) = self.hosted_node(upstream) {
                up.release_downstream(id).await;
            }
        }
        for downstream in &downstreams {
            let Some(down) = self.node(downstream) else {
                continue;
            };
            if down.is_hosted() {
                down.drop_upstream(id).await;
            }
            self.wire_upstreams_locked(&down, std::slice::from_ref(id)).await;
        }

        self.optimize_locked().await;
    }

    async fn handle_link_failure(&self, failure: LinkFailure) {
        let _guard = self.writer.lock().await;
        let (upstream, downstream) = match failure.direction {
            LinkDirection::Upstream => (&failure.peer, &failure.node),
            LinkDirection::Downstream => (&failure.node, &failure.peer),
        };
        if self.graph.write().remove_edge(upstream, downstream) {
            info!(
                upstream = %upstream,
                downstream = %downstream,
                state = %failure.state,
                "Edge removed after link failure"
            );
        }

        // Only the receiving side looks for a new feed
        if failure.direction == LinkDirection::Upstream {
            if let Some(node) = self.hosted_node(&failure.node) {
                self.wire_upstreams_locked(&node, std::slice::from_ref(&failure.peer))
                    .await;
            }
        }
    }

    /// Route one inbound signaling event
    pub async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Offer { from, to, offer } => {
                let Some(node) = self.hosted_node(&to) else {
                    debug!(from = %from, to = %to, "Offer for a peer not hosted here");
                    return;
                };
                let _guard = self.writer.lock().await;
                if self.graph.read().would_create_cycle(&to, &from) {
                    warn!(from = %from, to = %to, "Rejecting offer that would close a cycle");
                    return;
                }
                if self.node(&from).is_none() {
                    self.register_remote(&from, &PeerInfo::default());
                }
                match node.accept_downstream(&from, &offer).await {
                    Ok(()) => {
                        self.graph.write().add_edge(&to, &from);
                    }
                    Err(e) => warn!(from = %from, to = %to, error = %e, "Failed to accept offer"),
                }
            }
            SignalingEvent::Answer { from, to, answer } => {
                if let Some(node) = self.hosted_node(&to) {
                    if let Err(e) = node.apply_answer(&from, &answer).await {
                        warn!(from = %from, to = %to, error = %e, "Failed to apply answer");
                    }
                }
            }
            SignalingEvent::IceCandidate {
                from,
                to,
                candidate,
            } => {
                if let Some(node) = self.hosted_node(&to) {
                    if let Err(e) = node.add_ice_candidate(&from, candidate).await {
                        debug!(from = %from, to = %to, error = %e, "Failed to add ICE candidate");
                    }
                }
            }
            SignalingEvent::PeerJoin { peer_id, info } => {
                self.handle_peer_join(peer_id, info).await;
            }
            SignalingEvent::PeerUpdate { peer_id, info } => {
                self.handle_peer_update(peer_id, info);
            }
            SignalingEvent::PeerLeave { peer_id } => {
                self.handle_peer_leave(&peer_id).await;
            }
            SignalingEvent::Connected => info!("Signaling connected"),
            SignalingEvent::Disconnected => warn!("Signaling disconnected"),
            SignalingEvent::Error(kind) => error!(error = %kind, "Signaling error"),
        }
    }

    /// One monitoring pass: refresh and advertise stats, optimize when needed
    pub async fn run_health_check(&self) -> Vec<Rewire> {
        for node in self.nodes() {
            node.update_stats().await;
        }
        self.advertise_stats().await;
        let bottlenecks = self.detect_bottlenecks();
        if bottlenecks.is_empty() {
            return Vec::new();
        }
        debug!(bottlenecks = ?bottlenecks, "Bottlenecks detected");
        self.optimize_topology().await
    }

    /// Run [`Self::run_health_check`] every `period`
    pub fn monitor(self: &Arc<Self>, period: Duration) -> MonitorHandle {
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let topology = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            info!(period = ?period, "Health monitor started");

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        info!("Health monitor shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                let Some(topology) = topology.upgrade() else {
                    return;
                };
                let rewires = topology.run_health_check().await;
                if !rewires.is_empty() {
                    info!(rewires = rewires.len(), "Topology optimized");
                }
            }
        });

        MonitorHandle { cancel, handle }
    }

    #[must_use]
    pub fn snapshot(&self) -> TopologySnapshot {
        let source = self.source_node();
        let nodes = self
            .records()
            .iter()
            .map(|record| SnapshotNode::from_record(record, source.as_ref() == Some(&record.id)))
            .collect();
        let edges = self
            .graph
            .read()
            .edges()
            .map(|(from, to)| SnapshotEdge {
                from: from.clone(),
                to: to.clone(),
            })
            .collect();
        TopologySnapshot { nodes, edges }
    }
}

impl Drop for MeshTopology {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn apply_peer_info(node: &PeerNode, info: &PeerInfo) {
    if node.is_hosted() {
        return;
    }
    node.update_record(|record| {
        if record.location.is_none() {
            record.location.clone_from(&info.location);
        }
        if let Some(stats) = &info.stats {
            stats.apply_to(record);
        }
    });
}

async fn run_failures(
    topology: Weak<MeshTopology>,
    mut failures: mpsc::UnboundedReceiver<LinkFailure>,
    cancel: CancellationToken,
) {
    loop {
        let failure = tokio::select! {
            () = cancel.cancelled() => return,
            failure = failures.recv() => match failure {
                Some(failure) => failure,
                None => return,
            },
        };
        let Some(topology) = topology.upgrade() else {
            return;
        };
        topology.handle_link_failure(failure).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{MockSignaling, MockSignalingConfig, WireMessage};
    use crate::transport::MemoryNetwork;
    use meshcast_core::ConnectionState;

    fn topology() -> Arc<MeshTopology> {
        topology_with(MockSignaling::new(MockSignalingConfig::loopback()))
    }

    fn topology_with(signaling: Arc<MockSignaling>) -> Arc<MeshTopology> {
        let network = MemoryNetwork::new();
        MeshTopology::new(&Config::default(), network.factory(), signaling)
    }

    fn set_health(node: &PeerNode, upload: f64, relays: u32) {
        node.update_record(|record| {
            record.state = ConnectionState::Connected;
            record.upload_kbps = upload;
            record.download_kbps = 1000.0;
            record.latency_ms = 20.0;
            record.relay_count = relays;
        });
    }

    fn healthy(upload: f64, latency: f64, relays: u32) -> PeerInfo {
        PeerInfo {
            location: None,
            is_source: false,
            stats: Some(AdvertisedStats {
                connection_state: ConnectionState::Connected,
                upload_kbps: upload,
                download_kbps: 1000.0,
                latency_ms: latency,
                relay_count: relays,
            }),
        }
    }

    fn at(lat: f64, lon: f64, info: PeerInfo) -> PeerInfo {
        PeerInfo {
            location: Some(GeoLocation::new(lat, lon)),
            ..info
        }
    }

    fn p(id: &str) -> PeerId {
        PeerId::from(id)
    }

    #[tokio::test]
    async fn test_scenario_source_forced_first() {
        let topology = topology();
        let source = PeerInfo {
            location: Some(GeoLocation::new(0.0, 0.0)),
            is_source: true,
            stats: None,
        };
        topology.handle_peer_join(p("P1"), source).await;
        topology
            .handle_peer_join(p("P2"), at(0.0, 1.0, healthy(1000.0, 50.0, 0)))
            .await;
        topology
            .handle_peer_join(p("P3"), at(50.0, 50.0, healthy(600.0, 300.0, 0)))
            .await;

        let best = topology.find_optimal_upstreams(Some(&GeoLocation::new(0.0, 0.0)), 2);
        assert_eq!(best, vec![p("P1"), p("P2")]);
    }

    #[tokio::test]
    async fn test_source_guarantee_and_empty_result() {
        let topology = topology();
        assert!(topology.find_optimal_upstreams(None, 2).is_empty());

        topology.set_source_node(p("src"));
        assert_eq!(topology.find_optimal_upstreams(None, 1), vec![p("src")]);
        assert!(topology.find_optimal_upstreams(None, 0).is_empty());
    }

    #[tokio::test]
    async fn test_bottleneck_boundary() {
        let topology = topology();
        topology
            .handle_peer_join(p("five"), healthy(1000.0, 10.0, 5))
            .await;
        topology
            .handle_peer_join(p("six"), healthy(1000.0, 10.0, 6))
            .await;
        topology
            .handle_peer_join(p("slow"), healthy(1000.0, 501.0, 0))
            .await;
        topology
            .handle_peer_join(p("thin"), healthy(199.0, 10.0, 0))
            .await;

        assert_eq!(topology.detect_bottlenecks(), vec![p("six"), p("slow"), p("thin")]);
    }

    #[tokio::test]
    async fn test_leave_removes_peer_everywhere_and_rehomes_downstreams() {
        let topology = topology();
        topology.set_source_node(p("src"));
        topology.handle_peer_join(p("relay"), healthy(900.0, 20.0, 0)).await;
        topology.handle_peer_join(p("backup"), healthy(900.0, 30.0, 0)).await;
        topology.handle_peer_join(p("viewer"), healthy(100.0, 20.0, 0)).await;

        {
            let mut graph = topology.graph.write();
            for up in graph.upstreams(&p("viewer")) {
                graph.remove_edge(&up, &p("viewer"));
            }
            graph.add_edge(&p("relay"), &p("viewer"));
        }

        topology.handle_peer_leave(&p("relay")).await;

        let graph = topology.graph();
        assert!(!graph.mentions(&p("relay")));
        assert!(topology.node(&p("relay")).is_none());
        let upstreams = graph.upstreams(&p("viewer"));
        assert!(!upstreams.is_empty());
        assert!(upstreams.iter().all(|u| *u != p("relay")));
    }

    #[tokio::test]
    async fn test_optimize_moves_downstream_off_bottleneck() {
        let topology = topology();
        topology.handle_peer_join(p("busy"), healthy(900.0, 20.0, 6)).await;
        topology.handle_peer_join(p("idle"), healthy(900.0, 20.0, 0)).await;
        topology.handle_peer_join(p("viewer"), healthy(900.0, 20.0, 0)).await;
        {
            let mut graph = topology.graph.write();
            for up in graph.upstreams(&p("viewer")) {
                graph.remove_edge(&up, &p("viewer"));
            }
            graph.add_edge(&p("busy"), &p("viewer"));
        }

        let rewires = topology.optimize_topology().await;
        assert_eq!(
            rewires,
            vec![Rewire {
                peer: p("viewer"),
                from: p("busy"),
                to: p("idle"),
            }]
        );
        assert_eq!(topology.upstreams_of(&p("viewer")), vec![p("idle")]);
    }

    #[tokio::test]
    async fn test_failed_rewire_keeps_the_old_upstream() {
        let signaling = MockSignaling::new(MockSignalingConfig::loopback());
        let topology = topology_with(signaling.clone());
        let busy = topology.add_peer(p("busy"), None);
        let idle = topology.add_peer(p("idle"), None);
        let viewer = topology.add_peer(p("viewer"), None);
        set_health(&busy, 900.0, 6);
        set_health(&idle, 900.0, 0);
        set_health(&viewer, 900.0, 0);
        topology.graph.write().add_edge(&p("busy"), &p("viewer"));

        // Offers can no longer be signaled
        signaling.close().await;
        let rewires = topology.optimize_topology().await;

        assert!(rewires.is_empty());
        assert_eq!(topology.upstreams_of(&p("viewer")), vec![p("busy")]);
        assert!(viewer.upstream_peers().is_empty());
    }

    #[tokio::test]
    async fn test_advertised_stats_make_a_remote_relay_a_candidate() {
        // Two processes: `here` hosts the relay, `there` only hears about it
        let here_signaling = MockSignaling::new(MockSignalingConfig::loopback());
        let here = topology_with(here_signaling.clone());
        let there = topology();

        let relay = here.add_peer(p("relay"), Some(GeoLocation::new(0.0, 0.0)));
        there
            .handle_peer_join(
                p("relay"),
                PeerInfo {
                    location: Some(GeoLocation::new(0.0, 0.0)),
                    ..PeerInfo::default()
                },
            )
            .await;
        assert!(there.find_optimal_upstreams(None, 2).is_empty());

        set_health(&relay, 1200.0, 1);
        here.run_health_check().await;

        let updates: Vec<SignalingEvent> = here_signaling
            .sent_messages()
            .into_iter()
            .filter(|m| matches!(m, WireMessage::PeerUpdate { .. }))
            .filter_map(WireMessage::into_event)
            .collect();
        assert_eq!(updates.len(), 1);
        for event in updates {
            there.handle_signaling_event(event).await;
        }

        let record = there.node(&p("relay")).unwrap().record();
        assert_eq!(record.state, ConnectionState::Connected);
        assert_eq!(record.relay_count, 1);
        assert_eq!(there.find_optimal_upstreams(None, 2), vec![p("relay")]);

        // The hosting side keeps its own measurements
        here.handle_peer_update(p("relay"), PeerInfo::default());
        assert_eq!(relay.relay_count(), 1);
    }

    #[tokio::test]
    async fn test_optimize_skips_candidates_that_close_a_cycle() {
        let topology = topology();
        topology.handle_peer_join(p("busy"), healthy(900.0, 20.0, 6)).await;
        topology.handle_peer_join(p("a"), healthy(900.0, 20.0, 0)).await;
        topology.handle_peer_join(p("b"), healthy(900.0, 20.0, 0)).await;
        {
            let mut graph = OverlayGraph::new();
            graph.add_edge(&p("busy"), &p("a"));
            graph.add_edge(&p("a"), &p("b"));
            *topology.graph.write() = graph;
        }
        // b is the only other candidate for a, and b already hangs below a
        let rewires = topology.optimize_topology().await;
        assert!(rewires.is_empty());
        assert!(topology.graph().has_edge(&p("busy"), &p("a")));
    }

    #[tokio::test]
    async fn test_snapshot_marks_source() {
        let topology = topology();
        topology.add_peer(p("src"), None);
        topology.set_source_node(p("src"));
        topology.add_peer(p("v"), None);
        topology.graph.write().add_edge(&p("src"), &p("v"));

        let snapshot = topology.snapshot();
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.nodes[0].color, crate::snapshot::SOURCE_COLOR);
        assert_eq!(snapshot.nodes[1].color, crate::snapshot::PEER_COLOR);
        assert_eq!(snapshot.edges, vec![SnapshotEdge { from: p("src"), to: p("v") }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_cancellation_stops_ticks() {
        let topology = topology();
        let handle = topology.monitor(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!handle.is_finished());
        handle.stop().await;
    }
}
