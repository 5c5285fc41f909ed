use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::ChunkError;
use crate::model::MessageId;

/// One JSON frame of the chunking protocol, discriminated by `packageType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "packageType", rename_all = "camelCase")]
pub enum ChunkedMessagePackage {
    MetaData(MetaDataPackage),
    Chunk(ChunkPackage),
    ReceiveMessageConfirmation(ReceiveConfirmation),
    ReceiveMessageError(ReceiveError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaDataPackage {
    pub message_id: MessageId,
    pub chunk_count: i64,
    pub message_byte_count: u64,
    pub hash_of_message: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPackage {
    pub message_id: MessageId,
    pub chunk_index: i64,
    #[serde(with = "base64_bytes")]
    pub chunk_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveConfirmation {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveError {
    pub message_id: MessageId,
    pub error: ReceiveErrorReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiveErrorReason {
    #[serde(rename = "messageHashesMismatch")]
    MessageHashesMismatch,
}

impl ChunkedMessagePackage {
    pub fn message_id(&self) -> &MessageId {
        match self {
            ChunkedMessagePackage::MetaData(package) => &package.message_id,
            ChunkedMessagePackage::Chunk(package) => &package.message_id,
            ChunkedMessagePackage::ReceiveMessageConfirmation(package) => &package.message_id,
            ChunkedMessagePackage::ReceiveMessageError(package) => &package.message_id,
        }
    }

    pub fn confirmation(message_id: MessageId) -> Self {
        ChunkedMessagePackage::ReceiveMessageConfirmation(ReceiveConfirmation { message_id })
    }

    pub fn hash_mismatch(message_id: MessageId) -> Self {
        ChunkedMessagePackage::ReceiveMessageError(ReceiveError {
            message_id,
            error: ReceiveErrorReason::MessageHashesMismatch,
        })
    }

    pub fn to_json(&self) -> Result<Bytes, ChunkError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| ChunkError::Malformed(err.to_string()))
    }

    pub fn from_json(frame: &[u8]) -> Result<Self, ChunkError> {
        serde_json::from_slice(frame).map_err(|err| ChunkError::Malformed(err.to_string()))
    }
}

/// SHA-256 of a whole message, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("hashOfMessage must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
