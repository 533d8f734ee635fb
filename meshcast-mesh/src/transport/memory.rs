//! In-process transport
//!
//! Channels are pairs of in-memory endpoints. Negotiation follows the same
//! offer / accept / answer order as WebRTC so relay endpoints exercise their
//! real code paths; the link comes up when the answer is applied.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use meshcast_core::{ConnectionState, PeerId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use super::{
    ChannelEvent, ChannelEventKind, ChannelEventSender, ChannelStats, ConnectionFactory,
    LinkDirection, LinkId, RelayChannel, TransportError,
};
use crate::signaling::{IceCandidate, SessionDescription};

pub struct MemoryChannel {
    link: LinkId,
    local: PeerId,
    remote: PeerId,
    direction: LinkDirection,
    events: ChannelEventSender,
    peer: Mutex<Weak<MemoryChannel>>,
    open: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    network: Weak<MemoryNetwork>,
}

impl MemoryChannel {
    fn emit(&self, kind: ChannelEventKind) {
        let _ = self.events.send(ChannelEvent {
            peer: self.remote.clone(),
            direction: self.direction,
            link: self.link,
            kind,
        });
    }

    fn receive(&self, frame: Bytes) {
        self.bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.emit(ChannelEventKind::Message(frame));
    }

    /// Tear down from the remote side or the network
    fn drop_link(&self, state: ConnectionState) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.emit(ChannelEventKind::State(state));
        }
    }
}

#[async_trait]
impl RelayChannel for MemoryChannel {
    fn link_id(&self) -> LinkId {
        self.link
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let Some(peer) = self.peer.lock().upgrade() else {
            return Err(TransportError::NotConnected);
        };
        self.bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        peer.receive(frame);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn stats(&self) -> Option<ChannelStats> {
        let network = self.network.upgrade()?;
        Some(ChannelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            rtt_ms: network.rtt.get(&self.local).map(|rtt| *rtt),
        })
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let peer = self.peer.lock().upgrade();
            if let Some(peer) = peer {
                peer.drop_link(ConnectionState::Disconnected);
            }
        }
    }
}

/// Shared state of an in-process mesh
#[derive(Default)]
pub struct MemoryNetwork {
    /// Outbound halves waiting for their answer, keyed by (offerer, answerer)
    pending: DashMap<(PeerId, PeerId), Arc<MemoryChannel>>,
    /// Established pairs, keyed the same way
    links: DashMap<(PeerId, PeerId), (Arc<MemoryChannel>, Arc<MemoryChannel>)>,
    /// Round-trip time every channel of a peer reports
    rtt: DashMap<PeerId, f64>,
    /// Peers whose answers fail instead of connecting
    unreachable: DashMap<PeerId, ()>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn factory(self: &Arc<Self>) -> Arc<MemoryConnectionFactory> {
        Arc::new(MemoryConnectionFactory {
            network: Arc::clone(self),
        })
    }

    pub fn set_rtt(&self, peer: &PeerId, rtt_ms: f64) {
        self.rtt.insert(peer.clone(), rtt_ms);
    }

    /// Make new connections involving `peer` fail at answer time
    pub fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(peer.clone(), ());
        } else {
            self.unreachable.remove(peer);
        }
    }

    /// Fail the link between an upstream and a downstream peer
    pub fn fail_link(&self, upstream: &PeerId, downstream: &PeerId) -> bool {
        let Some((_, (offerer, answerer))) = self
            .links
            .remove(&(downstream.clone(), upstream.clone()))
        else {
            return false;
        };
        offerer.drop_link(ConnectionState::Failed);
        answerer.drop_link(ConnectionState::Failed);
        true
    }

    /// Number of established links that are still open
    #[must_use]
    pub fn open_link_count(&self) -> usize {
        self.links
            .iter()
            .filter(|entry| entry.value().0.is_open() && entry.value().1.is_open())
            .count()
    }

    fn channel(
        self: &Arc<Self>,
        local: &PeerId,
        remote: &PeerId,
        direction: LinkDirection,
        events: ChannelEventSender,
    ) -> Arc<MemoryChannel> {
        Arc::new(MemoryChannel {
            link: LinkId::next(),
            local: local.clone(),
            remote: remote.clone(),
            direction,
            events,
            peer: Mutex::new(Weak::new()),
            open: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            network: Arc::downgrade(self),
        })
    }
}

pub struct MemoryConnectionFactory {
    network: Arc<MemoryNetwork>,
}

impl MemoryConnectionFactory {
    #[must_use]
    pub const fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn open_outbound(
        &self,
        local: &PeerId,
        remote: &PeerId,
        events: ChannelEventSender,
    ) -> Result<(Arc<dyn RelayChannel>, SessionDescription), TransportError> {
        let channel = self
            .network
            .channel(local, remote, LinkDirection::Upstream, events);
        channel.emit(ChannelEventKind::State(ConnectionState::Connecting));
        self.network
            .pending
            .insert((local.clone(), remote.clone()), Arc::clone(&channel));

        let offer = SessionDescription::offer(format!("memory-offer {local}->{remote}"));
        Ok((channel, offer))
    }

    async fn accept_inbound(
        &self,
        local: &PeerId,
        remote: &PeerId,
        _offer: &SessionDescription,
        events: ChannelEventSender,
    ) -> Result<(Arc<dyn RelayChannel>, SessionDescription), TransportError> {
        let offerer = self
            .network
            .pending
            .get(&(remote.clone(), local.clone()))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::UnknownConnection(remote.clone()))?;

        let channel = self
            .network
            .channel(local, remote, LinkDirection::Downstream, events);
        *channel.peer.lock() = Arc::downgrade(&offerer);
        *offerer.peer.lock() = Arc::downgrade(&channel);
        channel.emit(ChannelEventKind::State(ConnectionState::Connecting));

        let answer = SessionDescription::answer(format!("memory-answer {local}->{remote}"));
        Ok((channel, answer))
    }

    async fn apply_answer(
        &self,
        local: &PeerId,
        remote: &PeerId,
        _answer: &SessionDescription,
    ) -> Result<(), TransportError> {
        let key = (local.clone(), remote.clone());
        let (_, offerer) = self
            .network
            .pending
            .remove(&key)
            .ok_or_else(|| TransportError::UnknownConnection(remote.clone()))?;
        let answerer = offerer
            .peer
            .lock()
            .upgrade()
            .ok_or_else(|| TransportError::Negotiation("offer was never accepted".to_string()))?;

        if self.network.unreachable.contains_key(local)
            || self.network.unreachable.contains_key(remote)
        {
            debug!(local = %local, remote = %remote, "Memory link unreachable");
            offerer.emit(ChannelEventKind::State(ConnectionState::Failed));
            answerer.emit(ChannelEventKind::State(ConnectionState::Failed));
            return Ok(());
        }

        offerer.open.store(true, Ordering::Release);
        answerer.open.store(true, Ordering::Release);
        self.network
            .links
            .insert(key, (Arc::clone(&offerer), Arc::clone(&answerer)));

        offerer.emit(ChannelEventKind::State(ConnectionState::Connected));
        answerer.emit(ChannelEventKind::State(ConnectionState::Connected));
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        _local: &PeerId,
        _remote: &PeerId,
        _candidate: IceCandidate,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn release(&self, local: &PeerId, remote: &PeerId, direction: LinkDirection) {
        let key = match direction {
            LinkDirection::Upstream => (local.clone(), remote.clone()),
            LinkDirection::Downstream => (remote.clone(), local.clone()),
        };
        self.network.pending.remove(&key);
        self.network.links.remove(&key);
    }
}
