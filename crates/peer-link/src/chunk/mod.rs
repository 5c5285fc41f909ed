//! Splitting of large payloads into JSON chunk packages and their verified reassembly.

mod assembler;
mod package;
mod receiver;
mod splitter;

use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::config::{parse_u64_env, parse_usize_env};

pub use assembler::{assemble, AssembledMessage};
pub use package::{
    ChunkPackage, ChunkedMessagePackage, ContentHash, MetaDataPackage, ReceiveConfirmation,
    ReceiveError, ReceiveErrorReason,
};
pub use receiver::{ChunkReceiver, GcEvent, GcReason, Received};
pub use splitter::MessageSplitter;

pub const DEFAULT_CHUNK_SIZE_LIMIT: usize = 15_441;
pub const DEFAULT_GC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_INFLIGHT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Maximum number of payload bytes carried by one chunk package.
    pub chunk_size_limit: usize,
    /// Partially received messages older than this are dropped.
    pub gc_timeout: Duration,
    pub max_inflight: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size_limit: DEFAULT_CHUNK_SIZE_LIMIT,
            gc_timeout: DEFAULT_GC_TIMEOUT,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

impl ChunkConfig {
    pub fn from_env() -> Self {
        Self {
            chunk_size_limit: parse_usize_env("PEER_LINK_CHUNK_SIZE", DEFAULT_CHUNK_SIZE_LIMIT, 1),
            gc_timeout: Duration::from_millis(parse_u64_env(
                "PEER_LINK_CHUNK_GC_MS",
                DEFAULT_GC_TIMEOUT.as_millis() as u64,
            )),
            max_inflight: parse_usize_env("PEER_LINK_CHUNK_MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT, 1),
        }
    }

    pub fn with_chunk_size_limit(mut self, limit: usize) -> Self {
        self.chunk_size_limit = limit.max(1);
        self
    }
}

pub fn runtime_config() -> &'static ChunkConfig {
    static CONFIG: Lazy<ChunkConfig> = Lazy::new(ChunkConfig::from_env);
    &CONFIG
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("no packages to assemble")]
    NoPackages,
    #[error("remote reported a receive error: {0:?}")]
    FoundReceiveMessageError(ReceiveError),
    #[error("no metadata package")]
    NoMetaDataPackage,
    #[error("found multiple metadata packages")]
    MultipleMetaDataPackages,
    #[error("metadata declares {0} chunks")]
    ZeroChunkCountDeclared(i64),
    #[error("got {got} chunk packages but metadata declared {declared}")]
    ChunkCountMismatch { got: usize, declared: i64 },
    #[error("chunk indices do not cover 0..{declared} exactly")]
    IncorrectChunkIndices { declared: i64 },
    #[error("assembled {got} bytes but metadata declared {declared}")]
    ByteCountMismatch { got: usize, declared: u64 },
    #[error("hash mismatch: calculated {calculated} but metadata declared {expected}")]
    HashMismatch { calculated: String, expected: String },
    #[error("malformed chunk package: {0}")]
    Malformed(String),
}

impl ChunkError {
    /// Integrity failures that the sender should hear about.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            ChunkError::HashMismatch { .. } | ChunkError::ByteCountMismatch { .. }
        )
    }
}
