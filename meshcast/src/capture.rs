//! Capture input: a file or stdin read in timed slices

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{info, warn};

type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// Open `path` (`-` for stdin) as a stream of recorder-like slices
pub async fn open(
    path: &str,
    slice_size: usize,
    interval: Duration,
) -> anyhow::Result<BoxStream<'static, Bytes>> {
    let reader: Reader = if path == "-" {
        info!("Capturing from stdin");
        Box::new(tokio::io::stdin())
    } else {
        info!(path, "Capturing from file");
        Box::new(tokio::fs::File::open(path).await?)
    };
    Ok(slices(reader, slice_size, interval))
}

/// One read of at most `slice_size` bytes per tick, until end of input
pub fn slices<R>(reader: R, slice_size: usize, period: Duration) -> BoxStream<'static, Bytes>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let state: (R, Interval) = (reader, ticker);

    stream::unfold(state, move |(mut reader, mut ticker)| async move {
        ticker.tick().await;

        let mut buf = BytesMut::with_capacity(slice_size.max(1));
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                info!("Capture input ended");
                None
            }
            Ok(_) => Some((buf.freeze(), (reader, ticker))),
            Err(e) => {
                warn!(error = %e, "Capture read failed");
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slices_follow_the_interval() {
        let input: &'static [u8] = b"abcdefghij";
        let mut stream = slices(input, 4, Duration::from_millis(100));

        let start = tokio::time::Instant::now();
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"abcd")));
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"efgh")));
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"ij")));
        assert_eq!(stream.next().await, None);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.webm");
        std::fs::write(&path, b"media").unwrap();

        let mut stream = open(path.to_str().unwrap(), 1024, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"media")));
        assert_eq!(stream.next().await, None);
        assert!(open("/nonexistent/capture.webm", 1024, Duration::from_millis(1))
            .await
            .is_err());
    }
}
