//! Upstream candidate scoring
//!
//! `score = 0.3/(d+1) + 0.3/(latency+1) + 0.2·upload/1000 + 0.2/(relays+1)`,
//! where `d` is the haversine distance in km (infinite when a location is
//! unknown, which zeroes that term).

use meshcast_core::{distance_between, ConnectionState, GeoLocation, MeshConfig, PeerId, PeerRecord};
use std::cmp::Ordering;

const DISTANCE_WEIGHT: f64 = 0.3;
const LATENCY_WEIGHT: f64 = 0.3;
const BANDWIDTH_WEIGHT: f64 = 0.2;
const LOAD_WEIGHT: f64 = 0.2;

/// Who may serve as an upstream at all
#[derive(Debug, Clone, Copy)]
pub struct CandidateFilter {
    pub max_relay_count: u32,
    pub min_upload_kbps: f64,
}

impl From<&MeshConfig> for CandidateFilter {
    fn from(config: &MeshConfig) -> Self {
        Self {
            max_relay_count: config.max_relay_count,
            min_upload_kbps: config.min_upload_kbps,
        }
    }
}

impl CandidateFilter {
    #[must_use]
    pub fn admits(&self, record: &PeerRecord) -> bool {
        record.state == ConnectionState::Connected
            && record.relay_count < self.max_relay_count
            && record.upload_kbps > self.min_upload_kbps
    }
}

#[must_use]
pub fn score(record: &PeerRecord, distance_km: f64) -> f64 {
    DISTANCE_WEIGHT / (distance_km + 1.0)
        + LATENCY_WEIGHT / (record.latency_ms + 1.0)
        + BANDWIDTH_WEIGHT * record.upload_kbps / 1000.0
        + LOAD_WEIGHT / (f64::from(record.relay_count) + 1.0)
}

/// Admitted candidates best first; equal scores keep their input order
#[must_use]
pub fn rank<'a>(
    location: Option<&GeoLocation>,
    records: impl IntoIterator<Item = &'a PeerRecord>,
    filter: &CandidateFilter,
) -> Vec<(PeerId, f64)> {
    let mut scored: Vec<(PeerId, f64)> = records
        .into_iter()
        .filter(|record| filter.admits(record))
        .map(|record| {
            let distance = distance_between(location, record.location.as_ref());
            (record.id.clone(), score(record, distance))
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, loc: (f64, f64), latency: f64, upload: f64, relays: u32) -> PeerRecord {
        PeerRecord {
            state: ConnectionState::Connected,
            latency_ms: latency,
            upload_kbps: upload,
            relay_count: relays,
            ..PeerRecord::new(PeerId::from(id), Some(GeoLocation::new(loc.0, loc.1)))
        }
    }

    fn filter() -> CandidateFilter {
        CandidateFilter::from(&MeshConfig::default())
    }

    #[test]
    fn test_filter_boundaries() {
        let f = filter();
        assert!(f.admits(&record("a", (0.0, 0.0), 0.0, 501.0, 4)));
        assert!(!f.admits(&record("a", (0.0, 0.0), 0.0, 500.0, 4)));
        assert!(!f.admits(&record("a", (0.0, 0.0), 0.0, 900.0, 5)));

        let mut connecting = record("a", (0.0, 0.0), 0.0, 900.0, 0);
        connecting.state = ConnectionState::Connecting;
        assert!(!f.admits(&connecting));
    }

    #[test]
    fn test_score_decreases_with_latency() {
        let fast = record("a", (0.0, 1.0), 10.0, 800.0, 1);
        let slow = record("a", (0.0, 1.0), 200.0, 800.0, 1);
        assert!(score(&fast, 100.0) > score(&slow, 100.0));
    }

    #[test]
    fn test_unknown_location_scores_zero_distance_term() {
        let mut r = record("a", (0.0, 0.0), 0.0, 1000.0, 0);
        r.location = None;
        let distance = distance_between(Some(&GeoLocation::new(0.0, 0.0)), r.location.as_ref());
        assert!((score(&r, distance) - (0.3 + 0.2 + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn test_rank_is_stable_for_ties() {
        let records = [
            record("first", (10.0, 10.0), 20.0, 800.0, 1),
            record("second", (10.0, 10.0), 20.0, 800.0, 1),
            record("best", (0.0, 0.0), 5.0, 2000.0, 0),
        ];
        let ranked: Vec<PeerId> = rank(Some(&GeoLocation::new(0.0, 0.0)), &records, &filter())
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ranked, vec![PeerId::from("best"), PeerId::from("first"), PeerId::from("second")]);
    }
}
