use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::package::{ChunkPackage, ChunkedMessagePackage, ContentHash};
use super::ChunkError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledMessage {
    pub content: Bytes,
    pub hash: ContentHash,
}

/// Rebuilds one message from its metadata and chunk packages.
///
/// Chunks may come in any order, but their indices must be exactly
/// `0..chunkCount`. Confirmation packages are ignored.
pub fn assemble(packages: &[ChunkedMessagePackage]) -> Result<AssembledMessage, ChunkError> {
    if packages.is_empty() {
        return Err(ChunkError::NoPackages);
    }

    if let Some(error) = packages.iter().find_map(|package| match package {
        ChunkedMessagePackage::ReceiveMessageError(error) => Some(error),
        _ => None,
    }) {
        return Err(ChunkError::FoundReceiveMessageError(error.clone()));
    }

    let mut metadata = packages.iter().filter_map(|package| match package {
        ChunkedMessagePackage::MetaData(meta) => Some(meta),
        _ => None,
    });
    let meta = metadata.next().ok_or(ChunkError::NoMetaDataPackage)?;
    if metadata.next().is_some() {
        return Err(ChunkError::MultipleMetaDataPackages);
    }

    let declared = meta.chunk_count;
    if declared <= 0 {
        return Err(ChunkError::ZeroChunkCountDeclared(declared));
    }

    let mut chunks: Vec<&ChunkPackage> = packages
        .iter()
        .filter_map(|package| match package {
            ChunkedMessagePackage::Chunk(chunk) => Some(chunk),
            _ => None,
        })
        .collect();
    if chunks.len() as i64 != declared {
        return Err(ChunkError::ChunkCountMismatch {
            got: chunks.len(),
            declared,
        });
    }

    let expected: BTreeSet<i64> = (0..declared).collect();
    let received: BTreeSet<i64> = chunks.iter().map(|chunk| chunk.chunk_index).collect();
    if received.symmetric_difference(&expected).next().is_some() {
        return Err(ChunkError::IncorrectChunkIndices { declared });
    }

    if !chunks.windows(2).all(|pair| pair[0].chunk_index < pair[1].chunk_index) {
        debug!(
            target = "peer_link::chunk",
            message_id = %meta.message_id,
            "chunks arrived out of order; sorting"
        );
        chunks.sort_by_key(|chunk| chunk.chunk_index);
    }

    let total: usize = chunks.iter().map(|chunk| chunk.chunk_data.len()).sum();
    let mut content = BytesMut::with_capacity(total);
    for chunk in &chunks {
        content.extend_from_slice(&chunk.chunk_data);
    }

    if content.len() as u64 != meta.message_byte_count {
        return Err(ChunkError::ByteCountMismatch {
            got: content.len(),
            declared: meta.message_byte_count,
        });
    }

    let hash = ContentHash::of(&content);
    if hash != meta.hash_of_message {
        return Err(ChunkError::HashMismatch {
            calculated: hash.to_hex(),
            expected: meta.hash_of_message.to_hex(),
        });
    }

    Ok(AssembledMessage {
        content: content.freeze(),
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MessageSplitter;
    use crate::model::MessageId;
    use rand::seq::SliceRandom;
    use rand::{thread_rng, Rng};

    fn split(payload: &[u8], limit: usize) -> Vec<ChunkedMessagePackage> {
        MessageSplitter::new(limit).split(payload, MessageId::random())
    }

    fn random_payload(len: usize) -> Vec<u8> {
        let mut rng = thread_rng();
        (0..len).map(|_| rng.gen()).collect()
    }

    fn chunk_positions(packages: &[ChunkedMessagePackage]) -> Vec<usize> {
        packages
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, ChunkedMessagePackage::Chunk(_)))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn round_trips_across_sizes_and_limits() {
        for len in [0usize, 1, 7, 999, 1000, 1001, 4096, 50_000] {
            for limit in [1usize, 3, 1000, 15_441, 100_000] {
                if len > 5_000 && limit < 10 {
                    continue;
                }
                let payload = random_payload(len);
                let assembled = assemble(&split(&payload, limit)).expect("assemble");
                assert_eq!(assembled.content.as_ref(), payload.as_slice(), "len={len} limit={limit}");
                assert_eq!(assembled.hash, ContentHash::of(&payload));
            }
        }
    }

    #[test]
    fn large_repetitive_message_round_trips() {
        let message = "very ".repeat(10_000);
        let assembled = assemble(&split(message.as_bytes(), 1_000)).expect("assemble");
        assert_eq!(assembled.content.as_ref(), message.as_bytes());
    }

    #[test]
    fn shuffled_packages_assemble_like_ordered_ones() {
        let payload = random_payload(10_000);
        let packages = split(&payload, 333);
        let ordered = assemble(&packages).expect("ordered");

        let mut shuffled = packages.clone();
        for _ in 0..10 {
            shuffled.shuffle(&mut thread_rng());
            assert_eq!(assemble(&shuffled).expect("shuffled"), ordered);
        }
    }

    #[test]
    fn removing_any_chunk_is_a_count_mismatch() {
        let packages = split(&random_payload(2_000), 300);
        for position in chunk_positions(&packages) {
            let mut incomplete = packages.clone();
            incomplete.remove(position);
            assert!(matches!(
                assemble(&incomplete),
                Err(ChunkError::ChunkCountMismatch { got: 6, declared: 7 })
            ));
        }
    }

    #[test]
    fn corrupting_any_chunk_is_a_hash_mismatch() {
        let packages = split(&random_payload(1_500), 256);
        let mut rng = thread_rng();
        for position in chunk_positions(&packages) {
            let mut corrupted = packages.clone();
            if let ChunkedMessagePackage::Chunk(chunk) = &mut corrupted[position] {
                let mut data = chunk.chunk_data.to_vec();
                let at = rng.gen_range(0..data.len());
                data[at] ^= 0x01;
                chunk.chunk_data = Bytes::from(data);
            }
            assert!(matches!(assemble(&corrupted), Err(ChunkError::HashMismatch { .. })));
        }
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let mut packages = split(b"abcdef", 2);
        if let ChunkedMessagePackage::Chunk(chunk) = &mut packages[3] {
            chunk.chunk_index = 0;
        }
        assert_eq!(
            assemble(&packages),
            Err(ChunkError::IncorrectChunkIndices { declared: 3 })
        );
    }

    #[test]
    fn structural_errors_are_reported_in_order() {
        assert_eq!(assemble(&[]), Err(ChunkError::NoPackages));

        let packages = split(b"abcdef", 2);
        assert_eq!(
            assemble(&packages[1..]),
            Err(ChunkError::NoMetaDataPackage)
        );

        let mut doubled = packages.clone();
        doubled.push(packages[0].clone());
        assert_eq!(assemble(&doubled), Err(ChunkError::MultipleMetaDataPackages));

        let mut zero = packages.clone();
        if let ChunkedMessagePackage::MetaData(meta) = &mut zero[0] {
            meta.chunk_count = 0;
        }
        assert_eq!(assemble(&zero), Err(ChunkError::ZeroChunkCountDeclared(0)));

        let mut wrong_len = packages.clone();
        if let ChunkedMessagePackage::MetaData(meta) = &mut wrong_len[0] {
            meta.message_byte_count = 5;
        }
        assert_eq!(
            assemble(&wrong_len),
            Err(ChunkError::ByteCountMismatch { got: 6, declared: 5 })
        );

        let mut with_error = packages.clone();
        with_error.push(ChunkedMessagePackage::hash_mismatch(MessageId::from("x")));
        assert!(matches!(
            assemble(&with_error),
            Err(ChunkError::FoundReceiveMessageError(_))
        ));
    }
}
