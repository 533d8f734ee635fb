//! Stream side of meshcast
//!
//! The producer cuts a capture stream into sequenced chunks, the frame codec
//! moves them across relay channels and the consumer turns whatever arrives
//! back into an ordered byte stream.

pub mod chunk;
pub mod consumer;
pub mod frame;
pub mod producer;

pub use chunk::StreamChunk;
pub use consumer::{ChunkConsumer, ChunkSink, DeliveryRun, PlaybackSink, ReorderBuffer};
pub use frame::FrameError;
pub use producer::{ChunkListener, ChunkProducer, ListenerId, ProducerConfig};
