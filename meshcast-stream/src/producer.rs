//! Chunk producer
//!
//! Cuts the broadcaster's capture stream into fixed-size, sequenced chunks and
//! hands each one to the registered listeners.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use meshcast_core::PeerId;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::StreamChunk;

/// Receives every chunk the producer emits
pub trait ChunkListener: Send + Sync {
    fn on_chunk(&self, chunk: &StreamChunk) -> anyhow::Result<()>;
}

impl<F> ChunkListener for F
where
    F: Fn(&StreamChunk) -> anyhow::Result<()> + Send + Sync,
{
    fn on_chunk(&self, chunk: &StreamChunk) -> anyhow::Result<()> {
        self(chunk)
    }
}

/// Handle returned by [`ChunkProducer::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub chunk_size: usize,
    pub mime_type: String,
}

impl From<&meshcast_core::StreamConfig> for ProducerConfig {
    fn from(config: &meshcast_core::StreamConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            mime_type: config.mime_type.clone(),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ChunkProducer {
    source_id: PeerId,
    config: ProducerConfig,
    capture: Arc<tokio::sync::Mutex<BoxStream<'static, Bytes>>>,
    next_seq: AtomicU64,
    next_listener: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChunkListener>)>>,
    running: Mutex<Option<Running>>,
}

impl ChunkProducer {
    pub fn new<S>(source_id: PeerId, capture: S, config: ProducerConfig) -> Arc<Self>
    where
        S: futures::Stream<Item = Bytes> + Send + 'static,
    {
        Arc::new(Self {
            source_id,
            config: ProducerConfig {
                chunk_size: config.chunk_size.max(1),
                ..config
            },
            capture: Arc::new(tokio::sync::Mutex::new(capture.boxed())),
            next_seq: AtomicU64::new(0),
            next_listener: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            running: Mutex::new(None),
        })
    }

    #[must_use]
    pub const fn source_id(&self) -> &PeerId {
        &self.source_id
    }

    pub fn add_listener(&self, listener: Arc<dyn ChunkListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Sequence number the next chunk will carry
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Begin consuming the capture stream. Calling it while running is a no-op.
    pub fn start_chunking(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            debug!(source_id = %self.source_id, "Chunking already running");
            return;
        }

        let cancel = CancellationToken::new();
        let producer = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            producer.capture_loop(token).await;
        });

        *running = Some(Running { cancel, handle });
        info!(source_id = %self.source_id, "Chunking started");
    }

    /// Stop consuming the capture stream. Safe in any state.
    pub fn stop_chunking(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
            info!(
                source_id = %self.source_id,
                next_seq = self.next_sequence(),
                "Chunking stopped"
            );
        }
    }

    async fn capture_loop(&self, cancel: CancellationToken) {
        // Held for the whole run so a restarted loop resumes the same stream
        let mut capture = self.capture.lock().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                slice = capture.next() => match slice {
                    Some(slice) => {
                        self.ingest_slice(slice);
                    }
                    None => {
                        info!(source_id = %self.source_id, "Capture stream ended");
                        break;
                    }
                },
            }
        }
    }

    /// Cut one recorder slice into chunks and notify listeners.
    /// Returns the number of chunks emitted.
    pub fn ingest_slice(&self, slice: Bytes) -> usize {
        let mut offset = 0;
        let mut emitted = 0;

        while offset < slice.len() {
            let end = (offset + self.config.chunk_size).min(slice.len());
            let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
            let chunk = StreamChunk::new(
                self.source_id.clone(),
                seq,
                chrono::Utc::now().timestamp_millis(),
                slice.slice(offset..end),
                self.config.mime_type.clone(),
            );
            self.notify(&chunk);
            offset = end;
            emitted += 1;
        }

        emitted
    }

    fn notify(&self, chunk: &StreamChunk) {
        // Snapshot so listeners may (de)register from inside a callback
        let listeners: Vec<Arc<dyn ChunkListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if let Err(e) = listener.on_chunk(chunk) {
                warn!(
                    source_id = %self.source_id,
                    seq = chunk.seq_number,
                    error = %e,
                    "Chunk listener failed"
                );
            }
        }
    }
}
