//! Playback output: the reassembled stream written to a file or stdout

use async_trait::async_trait;
use bytes::Bytes;
use meshcast_stream::PlaybackSink;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::info;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct WriterSink {
    writer: Mutex<Writer>,
    written: AtomicU64,
}

impl WriterSink {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            written: AtomicU64::new(0),
        }
    }

    /// `-` writes to stdout, anything else creates or truncates a file
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        if path == "-" {
            info!("Playing to stdout");
            return Ok(Self::new(tokio::io::stdout()));
        }
        info!(path, "Playing to file");
        Ok(Self::new(tokio::fs::File::create(path).await?))
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PlaybackSink for WriterSink {
    async fn append(&self, data: Bytes) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        writer.flush().await?;
        self.written.fetch_add(data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    async fn play(&self) -> anyhow::Result<()> {
        info!("Playback started");
        Ok(())
    }

    async fn end_of_stream(&self) -> anyhow::Result<()> {
        self.writer.lock().await.shutdown().await?;
        info!(bytes = self.bytes_written(), "Playback finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_appends_in_order_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.webm");
        let sink = WriterSink::open(path.to_str().unwrap()).await.unwrap();

        sink.append(Bytes::from_static(b"head")).await.unwrap();
        sink.append(Bytes::from_static(b"-tail")).await.unwrap();
        sink.end_of_stream().await.unwrap();

        assert_eq!(sink.bytes_written(), 9);
        assert_eq!(std::fs::read(&path).unwrap(), b"head-tail");
    }
}
