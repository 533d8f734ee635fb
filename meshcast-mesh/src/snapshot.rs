//! Serializable view of the overlay for dashboards

use meshcast_core::{PeerId, PeerRecord};
use serde::{Deserialize, Serialize};

pub const SOURCE_COLOR: &str = "#FF5733";
pub const PEER_COLOR: &str = "#3388FF";

const LABEL_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bandwidth {
    pub upload: f64,
    pub download: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub bandwidth: Bandwidth,
    pub latency: f64,
    pub relay_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: PeerId,
    pub label: String,
    pub size: u32,
    pub color: String,
    pub stats: NodeStats,
}

impl SnapshotNode {
    #[must_use]
    pub fn from_record(record: &PeerRecord, is_source: bool) -> Self {
        Self {
            id: record.id.clone(),
            label: record.id.as_str().chars().take(LABEL_LEN).collect(),
            size: 10 + record.relay_count.saturating_mul(5),
            color: if is_source { SOURCE_COLOR } else { PEER_COLOR }.to_string(),
            stats: NodeStats {
                bandwidth: Bandwidth {
                    upload: record.upload_kbps,
                    download: record.download_kbps,
                },
                latency: record.latency_ms,
                relay_count: record.relay_count,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub from: PeerId,
    pub to: PeerId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub nodes: Vec<SnapshotNode>,
    pub edges: Vec<SnapshotEdge>,
}

impl TopologySnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_presentation() {
        let mut record = PeerRecord::new(PeerId::from("peer-abcdefgh"), None);
        record.relay_count = 3;
        record.upload_kbps = 750.0;

        let node = SnapshotNode::from_record(&record, true);
        assert_eq!(node.label, "peer-abc");
        assert_eq!(node.size, 25);
        assert_eq!(node.color, SOURCE_COLOR);
        assert_eq!(SnapshotNode::from_record(&record, false).color, PEER_COLOR);
    }

    #[test]
    fn test_json_shape() {
        let record = PeerRecord::new(PeerId::from("p1"), None);
        let snapshot = TopologySnapshot {
            nodes: vec![SnapshotNode::from_record(&record, false)],
            edges: vec![SnapshotEdge {
                from: PeerId::from("s"),
                to: PeerId::from("p1"),
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(value["nodes"][0]["stats"]["relayCount"], 0);
        assert_eq!(value["nodes"][0]["stats"]["bandwidth"]["upload"], 0.0);
        assert_eq!(value["edges"][0]["from"], "s");
        assert_eq!(value["edges"][0]["to"], "p1");
    }
}
