use bytes::Bytes;
use meshcast_core::PeerId;

/// A slice of encoded media as it travels through the mesh
///
/// `seq_number` strictly increases per source, starting at 0 for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    /// `"{source_id}-{seq_number}"`
    pub id: String,
    /// Emission time at the source, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub data: Bytes,
    pub seq_number: u64,
    pub source_id: PeerId,
    pub mime_type: String,
}

impl StreamChunk {
    pub fn new(
        source_id: PeerId,
        seq_number: u64,
        timestamp: i64,
        data: Bytes,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            id: chunk_id(&source_id, seq_number),
            timestamp,
            data,
            seq_number,
            source_id,
            mime_type: mime_type.into(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[must_use]
pub fn chunk_id(source_id: &PeerId, seq_number: u64) -> String {
    format!("{source_id}-{seq_number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_format() {
        let chunk = StreamChunk::new(
            PeerId::from("peer-abc1234"),
            42,
            0,
            Bytes::from_static(b"x"),
            "video/webm",
        );
        assert_eq!(chunk.id, "peer-abc1234-42");
        assert_eq!(chunk.len(), 1);
    }
}
