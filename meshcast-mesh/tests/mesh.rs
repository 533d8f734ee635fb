//! Several nodes hosted by one controller, negotiating over loopback
//! signaling and exchanging chunks over in-memory channels.

use bytes::Bytes;
use meshcast_core::{Config, ConnectionState, GeoLocation, PeerId};
use meshcast_mesh::{
    MemoryNetwork, MeshTopology, MockSignaling, MockSignalingConfig, PeerNode, SignalingGateway,
};
use meshcast_stream::{ChunkSink, StreamChunk};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct CollectingSink {
    seqs: Mutex<Vec<u64>>,
}

impl ChunkSink for CollectingSink {
    fn deliver(&self, chunks: Vec<StreamChunk>) {
        self.seqs
            .lock()
            .extend(chunks.iter().map(|chunk| chunk.seq_number));
    }
}

struct Mesh {
    network: Arc<MemoryNetwork>,
    topology: Arc<MeshTopology>,
}

impl Mesh {
    fn new() -> Self {
        let network = MemoryNetwork::new();
        let signaling = MockSignaling::new(MockSignalingConfig::loopback());
        let mut events = signaling.take_event_receiver().unwrap();
        let topology = MeshTopology::new(&Config::default(), network.factory(), signaling);

        let dispatcher = Arc::clone(&topology);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatcher.handle_signaling_event(event).await;
            }
        });

        Self { network, topology }
    }

    fn source(&self, id: &str) -> Arc<PeerNode> {
        let node = self.topology.add_peer(PeerId::from(id), Some(GeoLocation::new(37.5, 127.0)));
        node.start_publishing();
        self.topology.set_source_node(PeerId::from(id));
        node
    }

    /// Join and wait until every chosen upstream link is up
    async fn join(&self, id: &str, location: GeoLocation) -> (Arc<PeerNode>, Vec<PeerId>) {
        let node = self.topology.add_peer(PeerId::from(id), Some(location));
        let upstreams = self.topology.connect_peer(node.id()).await;
        assert!(!upstreams.is_empty(), "{id} found no upstream");

        let feeders: Vec<Arc<PeerNode>> = upstreams
            .iter()
            .map(|up| self.topology.node(up).unwrap())
            .collect();
        let me = node.id().clone();
        wait_for(|| {
            node.connection_state() == ConnectionState::Connected
                && feeders
                    .iter()
                    .all(|up| up.downstream_peers().contains(&me) && up.relay_count() > 0)
        })
        .await;
        (node, upstreams)
    }
}

/// Advertise enough capacity to be picked as an upstream
fn healthy(node: &PeerNode, latency_ms: f64) {
    node.update_record(|record| {
        record.upload_kbps = 2000.0;
        record.download_kbps = 2000.0;
        record.latency_ms = latency_ms;
    });
}

fn chunk(source: &PeerId, seq: u64) -> StreamChunk {
    StreamChunk::new(
        source.clone(),
        seq,
        1_700_000_000_000,
        Bytes::from(vec![u8::try_from(seq % 256).unwrap_or(0); 64]),
        "video/webm;codecs=vp8,opus",
    )
}

async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_chunks_flow_from_source_through_relay() {
    let mesh = Mesh::new();
    let source = mesh.source("source");

    let (relay, relay_upstreams) = mesh.join("relay", GeoLocation::new(37.6, 127.0)).await;
    assert_eq!(relay_upstreams, vec![source.id().clone()]);
    healthy(&relay, 10.0);

    let (viewer, viewer_upstreams) = mesh.join("viewer", GeoLocation::new(37.7, 127.1)).await;
    assert_eq!(viewer_upstreams, vec![source.id().clone(), relay.id().clone()]);
    wait_for(|| mesh.network.open_link_count() == 3).await;
    wait_for(|| source.relay_count() == 2 && relay.relay_count() == 1).await;

    let sink = Arc::new(CollectingSink::default());
    viewer.set_sink(Some(sink.clone() as Arc<dyn ChunkSink>));

    for seq in 0..10 {
        source.publish(&chunk(source.id(), seq));
    }

    // Every chunk arrives twice, once directly and once relayed
    wait_for(|| sink.seqs.lock().len() == 10).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*sink.seqs.lock(), (0..10).collect::<Vec<_>>());
    assert!(viewer.pending_sequences(source.id()).is_empty());

    let snapshot = mesh.topology.snapshot();
    assert_eq!(snapshot.nodes.len(), 3);
    assert_eq!(snapshot.edges.len(), 3);
}

#[tokio::test]
async fn test_leave_heals_downstreams() {
    let mesh = Mesh::new();
    let source = mesh.source("source");
    let (relay, _) = mesh.join("relay", GeoLocation::new(37.6, 127.0)).await;
    healthy(&relay, 10.0);
    let (viewer, _) = mesh.join("viewer", GeoLocation::new(37.7, 127.1)).await;
    wait_for(|| mesh.network.open_link_count() == 3).await;
    wait_for(|| source.relay_count() == 2).await;

    let sink = Arc::new(CollectingSink::default());
    viewer.set_sink(Some(sink.clone() as Arc<dyn ChunkSink>));

    mesh.topology.handle_peer_leave(relay.id()).await;

    let graph = mesh.topology.graph();
    assert!(!graph.mentions(relay.id()));
    assert!(mesh.topology.node(relay.id()).is_none());
    assert_eq!(mesh.topology.upstreams_of(viewer.id()), vec![source.id().clone()]);
    assert_eq!(relay.connection_state(), ConnectionState::Disconnected);
    wait_for(|| source.relay_count() == 1).await;
    assert_eq!(viewer.upstream_peers(), vec![source.id().clone()]);

    // Still fed by the source alone
    for seq in 0..5 {
        source.publish(&chunk(source.id(), seq));
    }
    wait_for(|| sink.seqs.lock().len() == 5).await;
    assert_eq!(*sink.seqs.lock(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_failed_link_is_rewired() {
    let mesh = Mesh::new();
    let source = mesh.source("source");
    let (backup, _) = mesh.join("backup", GeoLocation::new(37.6, 127.0)).await;
    healthy(&backup, 100.0);
    let (relay, _) = mesh.join("relay", GeoLocation::new(37.6, 127.0)).await;
    healthy(&relay, 10.0);

    let (viewer, upstreams) = mesh.join("viewer", GeoLocation::new(37.7, 127.1)).await;
    assert_eq!(upstreams, vec![source.id().clone(), relay.id().clone()]);
    // backup and relay both hang off the source, relay also off backup
    wait_for(|| mesh.network.open_link_count() == 5).await;
    wait_for(|| relay.relay_count() == 1).await;

    assert!(mesh.network.fail_link(relay.id(), viewer.id()));

    wait_for(|| {
        let upstreams = mesh.topology.upstreams_of(viewer.id());
        upstreams.contains(backup.id()) && !upstreams.contains(relay.id())
    })
    .await;
    wait_for(|| backup.downstream_peers().contains(viewer.id())).await;
    wait_for(|| !relay.downstream_peers().contains(viewer.id())).await;

    let mut fed_by = viewer.upstream_peers();
    fed_by.sort();
    assert_eq!(fed_by, vec![backup.id().clone(), source.id().clone()]);
    assert!(!mesh.topology.graph().has_edge(relay.id(), viewer.id()));
}
