//! Chunk consumer
//!
//! Reorders received chunks into a gapless byte stream and feeds it to a
//! playback sink, one write at a time.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::chunk::StreamChunk;

/// Playback target for the reassembled stream
///
/// `append` resolves once the sink has finished consuming the write; the
/// consumer never issues a second write before that.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn append(&self, data: Bytes) -> anyhow::Result<()>;

    /// Called once after the first successful write
    async fn play(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pause(&self) {}

    fn is_open(&self) -> bool {
        true
    }

    async fn end_of_stream(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Receives ordered runs of chunks from a relay endpoint
pub trait ChunkSink: Send + Sync {
    fn deliver(&self, chunks: Vec<StreamChunk>);
}

/// A contiguous run popped from a [`ReorderBuffer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRun {
    pub first_seq: u64,
    pub last_seq: u64,
    pub data: Bytes,
}

impl DeliveryRun {
    /// Number of chunks in the run
    #[must_use]
    pub const fn chunk_count(&self) -> u64 {
        self.last_seq - self.first_seq + 1
    }
}

/// Sequence-ordered pending payloads plus the delivery cursor
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    last_delivered: Option<u64>,
    pending: BTreeMap<u64, Bytes>,
}

impl ReorderBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn last_delivered(&self) -> Option<u64> {
        self.last_delivered
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffer a payload. Stale or duplicate sequence numbers are rejected.
    pub fn insert(&mut self, seq: u64, data: Bytes) -> bool {
        if self.last_delivered.is_some_and(|last| seq <= last) {
            return false;
        }
        if self.pending.contains_key(&seq) {
            return false;
        }
        self.pending.insert(seq, data);
        true
    }

    /// Pop the contiguous prefix starting at the next expected sequence number.
    /// Before the first delivery the lowest buffered chunk starts the run.
    pub fn take_run(&mut self) -> Option<DeliveryRun> {
        let (&first, _) = self.pending.first_key_value()?;
        if let Some(last) = self.last_delivered {
            if first != last + 1 {
                return None;
            }
        }

        let mut run = BytesMut::new();
        let mut last_seq = first;
        while let Some(entry) = self.pending.first_entry() {
            let seq = *entry.key();
            if seq != first && seq != last_seq + 1 {
                break;
            }
            run.extend_from_slice(&entry.remove());
            last_seq = seq;
        }

        self.last_delivered = Some(last_seq);
        Some(DeliveryRun {
            first_seq: first,
            last_seq,
            data: run.freeze(),
        })
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_delivered = None;
    }
}

enum Command {
    Add(StreamChunk),
    Dispose(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct ConsumerState {
    /// -1 before the first delivery
    last_delivered: AtomicI64,
    pending: AtomicUsize,
    writes: AtomicUsize,
}

/// Handle to the consumer task
///
/// All buffer state lives inside one spawned task, so ordering decisions and
/// sink writes are serialized without locks.
pub struct ChunkConsumer {
    tx: mpsc::UnboundedSender<Command>,
    state: Arc<ConsumerState>,
}

impl ChunkConsumer {
    pub fn spawn(sink: Arc<dyn PlaybackSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ConsumerState {
            last_delivered: AtomicI64::new(-1),
            ..ConsumerState::default()
        });

        tokio::spawn(run_consumer(rx, sink, Arc::clone(&state)));

        Arc::new(Self { tx, state })
    }

    pub fn add_chunk(&self, chunk: StreamChunk) {
        if self.tx.send(Command::Add(chunk)).is_err() {
            debug!("Consumer task gone, chunk dropped");
        }
    }

    /// Stop playback and reset the reassembly state
    pub async fn dispose(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Dispose(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Highest sequence number written to the sink, if any
    #[must_use]
    pub fn last_delivered(&self) -> Option<u64> {
        u64::try_from(self.state.last_delivered.load(Ordering::Acquire)).ok()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Number of sink writes completed so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.writes.load(Ordering::Acquire)
    }
}

impl ChunkSink for ChunkConsumer {
    fn deliver(&self, chunks: Vec<StreamChunk>) {
        for chunk in chunks {
            self.add_chunk(chunk);
        }
    }
}

async fn run_consumer(
    mut rx: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn PlaybackSink>,
    state: Arc<ConsumerState>,
) {
    let mut buffer = ReorderBuffer::new();
    let mut playing = false;

    while let Some(command) = rx.recv().await {
        let mut next = Some(command);

        // A write completion resumes processing of whatever queued meanwhile
        loop {
            while let Some(command) = next.take().or_else(|| rx.try_recv().ok()) {
                match command {
                    Command::Add(chunk) => {
                        if !buffer.insert(chunk.seq_number, chunk.data) {
                            trace!(seq = chunk.seq_number, "Stale or duplicate chunk discarded");
                        }
                    }
                    Command::Dispose(ack) => {
                        dispose(&sink, &mut buffer).await;
                        playing = false;
                        state.last_delivered.store(-1, Ordering::Release);
                        state.pending.store(0, Ordering::Release);
                        let _ = ack.send(());
                    }
                }
            }
            state.pending.store(buffer.pending_len(), Ordering::Release);

            let Some(run) = buffer.take_run() else {
                break;
            };
            state.pending.store(buffer.pending_len(), Ordering::Release);

            trace!(
                first_seq = run.first_seq,
                last_seq = run.last_seq,
                bytes = run.data.len(),
                "Writing run to playback"
            );
            if let Err(e) = sink.append(run.data).await {
                warn!(error = %e, first_seq = run.first_seq, "Playback write failed");
            }
            #[allow(clippy::cast_possible_wrap)]
            state
                .last_delivered
                .store(run.last_seq as i64, Ordering::Release);
            state.writes.fetch_add(1, Ordering::AcqRel);

            if !playing {
                playing = true;
                if let Err(e) = sink.play().await {
                    warn!(error = %e, "Playback start failed");
                }
            }
        }
    }
}

async fn dispose(sink: &Arc<dyn PlaybackSink>, buffer: &mut ReorderBuffer) {
    sink.pause().await;
    if sink.is_open() {
        if let Err(e) = sink.end_of_stream().await {
            warn!(error = %e, "End of stream signal failed");
        }
    }
    buffer.reset();
    debug!("Consumer disposed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcast_core::PeerId;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn chunk(seq: u64, byte: u8) -> StreamChunk {
        StreamChunk::new(PeerId::from("src"), seq, 0, Bytes::from(vec![byte]), "video/webm")
    }

    #[test]
    fn test_reorder_buffer_runs() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.insert(2, Bytes::from_static(b"c")));
        assert!(buffer.insert(0, Bytes::from_static(b"a")));
        assert!(!buffer.insert(0, Bytes::from_static(b"a")));

        let run = buffer.take_run().unwrap();
        assert_eq!((run.first_seq, run.last_seq), (0, 0));
        assert!(buffer.take_run().is_none());

        assert!(buffer.insert(1, Bytes::from_static(b"b")));
        let run = buffer.take_run().unwrap();
        assert_eq!((run.first_seq, run.last_seq), (1, 2));
        assert_eq!(&run.data[..], b"bc");
        assert_eq!(run.chunk_count(), 2);

        assert!(!buffer.insert(1, Bytes::from_static(b"b")));
        assert_eq!(buffer.last_delivered(), Some(2));
    }

    #[test]
    fn test_first_delivery_starts_at_lowest() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(5, Bytes::from_static(b"x"));
        buffer.insert(6, Bytes::from_static(b"y"));
        let run = buffer.take_run().unwrap();
        assert_eq!((run.first_seq, run.last_seq), (5, 6));

        buffer.reset();
        assert_eq!(buffer.last_delivered(), None);
        assert!(buffer.insert(0, Bytes::from_static(b"z")));
    }

    /// Sink that records writes and holds each one open until released
    struct GatedSink {
        writes: Mutex<Vec<Bytes>>,
        in_flight: AtomicBool,
        overlapped: AtomicBool,
        gate: tokio::sync::Semaphore,
        ended: AtomicBool,
    }

    impl GatedSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                in_flight: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                gate: tokio::sync::Semaphore::new(0),
                ended: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl PlaybackSink for GatedSink {
        async fn append(&self, data: Bytes) -> anyhow::Result<()> {
            if self.in_flight.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.writes.lock().push(data);
            self.gate.acquire().await?.forget();
            self.in_flight.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn end_of_stream(&self) -> anyhow::Result<()> {
            self.ended.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_no_overlapping_writes() {
        let sink = GatedSink::new();
        let consumer = ChunkConsumer::spawn(sink.clone());

        consumer.add_chunk(chunk(0, b'a'));
        settle().await;
        assert_eq!(sink.writes.lock().len(), 1);

        // Arrive while the first write is still in flight
        consumer.add_chunk(chunk(2, b'c'));
        consumer.add_chunk(chunk(1, b'b'));
        settle().await;
        assert_eq!(sink.writes.lock().len(), 1);

        sink.gate.add_permits(1);
        settle().await;
        {
            let writes = sink.writes.lock();
            assert_eq!(writes.len(), 2);
            assert_eq!(&writes[1][..], b"bc");
        }

        sink.gate.add_permits(1);
        settle().await;
        assert_eq!(consumer.last_delivered(), Some(2));
        assert!(!sink.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dispose_resets_state() {
        let sink = GatedSink::new();
        sink.gate.add_permits(10);
        let consumer = ChunkConsumer::spawn(sink.clone());

        consumer.add_chunk(chunk(0, b'a'));
        consumer.add_chunk(chunk(3, b'd'));
        settle().await;
        assert_eq!(consumer.last_delivered(), Some(0));
        assert_eq!(consumer.pending_len(), 1);

        consumer.dispose().await;
        assert!(sink.ended.load(Ordering::SeqCst));
        assert_eq!(consumer.last_delivered(), None);
        assert_eq!(consumer.pending_len(), 0);

        // Stale numbering is accepted again after a reset
        consumer.add_chunk(chunk(0, b'z'));
        settle().await;
        assert_eq!(consumer.last_delivered(), Some(0));
        assert_eq!(consumer.write_count(), 2);
    }
}
