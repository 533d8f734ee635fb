use meshcast_stream::StreamChunk;
use std::collections::BTreeMap;

/// Outcome of offering a chunk to a [`SourceBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    Accepted,
    /// Already buffered
    Duplicate,
    /// Older than the next expected sequence number
    Stale,
}

/// Receive buffer for one source
///
/// Holds chunks not yet delivered, ordered by sequence number. A run is only
/// released once it starts at the next expected sequence number and is at
/// least `min_run` chunks long. Before the first delivery the run may start at
/// the lowest buffered sequence number.
#[derive(Debug, Default)]
pub struct SourceBuffer {
    next_expected: Option<u64>,
    pending: BTreeMap<u64, StreamChunk>,
}

impl SourceBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chunk: StreamChunk) -> Intake {
        if self
            .next_expected
            .is_some_and(|next| chunk.seq_number < next)
        {
            return Intake::Stale;
        }
        if self.pending.contains_key(&chunk.seq_number) {
            return Intake::Duplicate;
        }
        self.pending.insert(chunk.seq_number, chunk);
        Intake::Accepted
    }

    /// Pop the contiguous run at the head of the buffer if it is long enough
    pub fn take_run(&mut self, min_run: usize) -> Option<Vec<StreamChunk>> {
        let start = match self.next_expected {
            Some(next) => next,
            None => *self.pending.keys().next()?,
        };

        let mut expected = start;
        let mut len = 0usize;
        for &seq in self.pending.range(start..).map(|(seq, _)| seq) {
            if seq != expected {
                break;
            }
            len += 1;
            expected += 1;
        }

        if len == 0 || len < min_run {
            return None;
        }

        let rest = self.pending.split_off(&expected);
        let run = std::mem::replace(&mut self.pending, rest);
        self.next_expected = Some(expected);
        Some(run.into_values().collect())
    }

    #[must_use]
    pub const fn next_expected(&self) -> Option<u64> {
        self.next_expected
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn pending_sequences(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use meshcast_core::PeerId;

    fn chunk(seq: u64) -> StreamChunk {
        StreamChunk::new(PeerId::from("src"), seq, 0, Bytes::from(vec![seq as u8]), "video/webm")
    }

    fn seqs(run: &[StreamChunk]) -> Vec<u64> {
        run.iter().map(|c| c.seq_number).collect()
    }

    #[test]
    fn test_out_of_order_run_is_released_once() {
        let mut buffer = SourceBuffer::new();

        assert_eq!(buffer.insert(chunk(2)), Intake::Accepted);
        assert!(buffer.take_run(2).is_none());
        assert_eq!(buffer.insert(chunk(0)), Intake::Accepted);
        assert!(buffer.take_run(2).is_none());
        assert_eq!(buffer.insert(chunk(1)), Intake::Accepted);

        let run = buffer.take_run(2).unwrap();
        assert_eq!(seqs(&run), vec![0, 1, 2]);
        assert_eq!(buffer.next_expected(), Some(3));

        assert_eq!(buffer.insert(chunk(4)), Intake::Accepted);
        assert!(buffer.take_run(2).is_none());
        assert_eq!(buffer.pending_sequences(), vec![4]);
    }

    #[test]
    fn test_duplicates_and_stale_chunks() {
        let mut buffer = SourceBuffer::new();
        assert_eq!(buffer.insert(chunk(0)), Intake::Accepted);
        assert_eq!(buffer.insert(chunk(0)), Intake::Duplicate);
        assert_eq!(seqs(&buffer.take_run(1).unwrap()), vec![0]);

        assert_eq!(buffer.insert(chunk(0)), Intake::Stale);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_run_shorter_than_minimum_waits() {
        let mut buffer = SourceBuffer::new();
        for seq in [0, 1, 2, 3] {
            buffer.insert(chunk(seq));
        }
        assert!(buffer.take_run(5).is_none());
        buffer.insert(chunk(4));
        assert_eq!(seqs(&buffer.take_run(5).unwrap()), vec![0, 1, 2, 3, 4]);
        assert!(buffer.take_run(5).is_none());
    }

    #[test]
    fn test_gap_blocks_delivery_after_first_run() {
        let mut buffer = SourceBuffer::new();
        buffer.insert(chunk(0));
        buffer.take_run(1).unwrap();

        buffer.insert(chunk(2));
        buffer.insert(chunk(3));
        assert!(buffer.take_run(1).is_none());
        buffer.insert(chunk(1));
        assert_eq!(seqs(&buffer.take_run(1).unwrap()), vec![1, 2, 3]);
    }
}
