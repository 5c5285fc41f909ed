use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};

use super::assembler::{assemble, AssembledMessage};
use super::package::{ChunkedMessagePackage, ReceiveError};
use super::{ChunkConfig, ChunkError};
use crate::model::MessageId;

/// What one ingested package produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Buffered; the message is not complete yet.
    Pending,
    Assembled {
        message_id: MessageId,
        message: AssembledMessage,
    },
    /// The remote confirmed it assembled one of our messages.
    Confirmation(MessageId),
    /// The remote failed to assemble one of our messages.
    RemoteError(ReceiveError),
    /// A complete package set for this message failed validation.
    Failed {
        message_id: MessageId,
        error: ChunkError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    Timeout,
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcEvent {
    pub message_id: MessageId,
    pub reason: GcReason,
}

#[derive(Debug)]
struct PartialMessage {
    created_at: Instant,
    packages: Vec<ChunkedMessagePackage>,
    declared_chunks: Option<i64>,
    chunks: usize,
}

impl PartialMessage {
    fn new(created_at: Instant) -> Self {
        Self {
            created_at,
            packages: Vec::new(),
            declared_chunks: None,
            chunks: 0,
        }
    }

    fn is_ready(&self) -> bool {
        match self.declared_chunks {
            Some(declared) if declared <= 0 => true,
            Some(declared) => self.chunks as i64 >= declared,
            None => false,
        }
    }
}

/// Buffers packages per message id until each message can be assembled.
///
/// Packages of different messages may interleave freely. A buffer is dropped
/// once its message assembles or fails, and stale buffers are garbage collected.
#[derive(Debug)]
pub struct ChunkReceiver {
    partials: HashMap<MessageId, PartialMessage>,
    config: ChunkConfig,
}

impl ChunkReceiver {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            partials: HashMap::new(),
            config,
        }
    }

    pub fn ingest(&mut self, package: ChunkedMessagePackage, now: Instant) -> Received {
        for event in self.gc(now) {
            debug!(
                target = "peer_link::chunk",
                message_id = %event.message_id,
                reason = ?event.reason,
                "dropped partial message"
            );
        }

        let message_id = package.message_id().clone();
        match package {
            ChunkedMessagePackage::ReceiveMessageConfirmation(_) => {
                return Received::Confirmation(message_id)
            }
            ChunkedMessagePackage::ReceiveMessageError(error) => {
                return Received::RemoteError(error)
            }
            ChunkedMessagePackage::MetaData(_) | ChunkedMessagePackage::Chunk(_) => {}
        }

        if !self.partials.contains_key(&message_id) && self.partials.len() >= self.config.max_inflight {
            if let Some(evicted) = self.evict_oldest() {
                warn!(
                    target = "peer_link::chunk",
                    message_id = %evicted.message_id,
                    max_inflight = self.config.max_inflight,
                    "too many partial messages; evicted oldest"
                );
            }
        }

        let partial = self
            .partials
            .entry(message_id.clone())
            .or_insert_with(|| PartialMessage::new(now));
        match &package {
            ChunkedMessagePackage::MetaData(meta) => {
                // a second metadata package makes assembly fail, which is what we want
                if partial.declared_chunks.is_none() {
                    partial.declared_chunks = Some(meta.chunk_count);
                }
            }
            ChunkedMessagePackage::Chunk(_) => partial.chunks += 1,
            _ => {}
        }
        partial.packages.push(package);

        if !partial.is_ready() {
            return Received::Pending;
        }

        let Some(partial) = self.partials.remove(&message_id) else {
            return Received::Pending;
        };
        match assemble(&partial.packages) {
            Ok(message) => Received::Assembled {
                message_id,
                message,
            },
            Err(error) => Received::Failed { message_id, error },
        }
    }

    pub fn gc(&mut self, now: Instant) -> Vec<GcEvent> {
        let timeout = self.config.gc_timeout;
        let mut dropped = Vec::new();
        self.partials.retain(|message_id, partial| {
            let expired = now.saturating_duration_since(partial.created_at) > timeout;
            if expired {
                dropped.push(GcEvent {
                    message_id: message_id.clone(),
                    reason: GcReason::Timeout,
                });
            }
            !expired
        });
        dropped
    }

    pub fn in_flight(&self) -> usize {
        self.partials.len()
    }

    fn evict_oldest(&mut self) -> Option<GcEvent> {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, partial)| partial.created_at)
            .map(|(message_id, _)| message_id.clone())?;
        self.partials.remove(&oldest);
        Some(GcEvent {
            message_id: oldest,
            reason: GcReason::Capacity,
        })
    }
}
