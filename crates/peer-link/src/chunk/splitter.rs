use bytes::Bytes;

use super::package::{ChunkPackage, ChunkedMessagePackage, ContentHash, MetaDataPackage};
use super::DEFAULT_CHUNK_SIZE_LIMIT;
use crate::model::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSplitter {
    chunk_size_limit: usize,
}

impl Default for MessageSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE_LIMIT)
    }
}

impl MessageSplitter {
    pub fn new(chunk_size_limit: usize) -> Self {
        Self {
            chunk_size_limit: chunk_size_limit.max(1),
        }
    }

    pub fn chunk_size_limit(&self) -> usize {
        self.chunk_size_limit
    }

    /// One metadata package followed by the chunks in index order.
    ///
    /// An empty payload still produces one (empty) chunk so the receiver
    /// always sees a positive chunk count.
    pub fn split(&self, payload: &[u8], message_id: MessageId) -> Vec<ChunkedMessagePackage> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(self.chunk_size_limit).collect()
        };

        let mut packages = Vec::with_capacity(chunks.len() + 1);
        packages.push(ChunkedMessagePackage::MetaData(MetaDataPackage {
            message_id: message_id.clone(),
            chunk_count: chunks.len() as i64,
            message_byte_count: payload.len() as u64,
            hash_of_message: ContentHash::of(payload),
        }));
        packages.extend(chunks.into_iter().enumerate().map(|(index, chunk)| {
            ChunkedMessagePackage::Chunk(ChunkPackage {
                message_id: message_id.clone(),
                chunk_index: index as i64,
                chunk_data: Bytes::copy_from_slice(chunk),
            })
        }));
        packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_comes_first_and_indices_are_sequential() {
        let splitter = MessageSplitter::new(4);
        let packages = splitter.split(b"0123456789", MessageId::from("m"));
        assert_eq!(packages.len(), 4);

        match &packages[0] {
            ChunkedMessagePackage::MetaData(meta) => {
                assert_eq!(meta.chunk_count, 3);
                assert_eq!(meta.message_byte_count, 10);
                assert_eq!(meta.hash_of_message, ContentHash::of(b"0123456789"));
            }
            other => panic!("expected metadata first, got {other:?}"),
        }

        let chunks: Vec<(i64, Bytes)> = packages[1..]
            .iter()
            .map(|package| match package {
                ChunkedMessagePackage::Chunk(chunk) => (chunk.chunk_index, chunk.chunk_data.clone()),
                other => panic!("expected chunk, got {other:?}"),
            })
            .collect();
        assert_eq!(
            chunks,
            vec![
                (0, Bytes::from_static(b"0123")),
                (1, Bytes::from_static(b"4567")),
                (2, Bytes::from_static(b"89")),
            ]
        );
    }

    #[test]
    fn every_package_carries_the_message_id() {
        let packages = MessageSplitter::new(2).split(b"abcdef", MessageId::from("same"));
        assert!(packages.iter().all(|p| p.message_id().as_str() == "same"));
    }

    #[test]
    fn empty_payload_yields_single_empty_chunk() {
        let packages = MessageSplitter::new(8).split(b"", MessageId::from("empty"));
        assert_eq!(packages.len(), 2);
        assert!(matches!(
            &packages[0],
            ChunkedMessagePackage::MetaData(meta) if meta.chunk_count == 1 && meta.message_byte_count == 0
        ));
    }
}
