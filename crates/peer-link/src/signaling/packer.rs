use tracing::trace;

use super::encryption::{decrypt, encrypt};
use super::message::RpcMessage;
use super::SignalingError;
use crate::model::{
    ClientSource, ConnectionSecrets, EncryptionKey, PeerConnectionId, RequestId, RtcPrimitive,
};

/// Seals outgoing primitives into relay RPC messages.
#[derive(Debug, Clone)]
pub struct Packer {
    connection_id: PeerConnectionId,
    key: EncryptionKey,
    source: ClientSource,
}

impl Packer {
    pub fn new(secrets: &ConnectionSecrets, source: ClientSource) -> Self {
        Self {
            connection_id: secrets.connection_id(),
            key: secrets.encryption_key().clone(),
            source,
        }
    }

    pub fn pack(&self, primitive: &RtcPrimitive) -> Result<RpcMessage, SignalingError> {
        let payload = primitive
            .payload_json()
            .map_err(|err| SignalingError::Payload(err.to_string()))?;
        let encrypted_payload = encrypt(&payload, &self.key)?;
        let message = RpcMessage {
            request_id: RequestId::random(),
            connection_id: self.connection_id,
            method: primitive.method(),
            source: self.source,
            encrypted_payload,
        };
        trace!(
            target = "peer_link::signaling",
            request_id = %message.request_id,
            method = %message.method,
            "packed primitive"
        );
        Ok(message)
    }
}

/// Opens relay RPC messages meant for this connection.
#[derive(Debug, Clone)]
pub struct Unpacker {
    connection_id: PeerConnectionId,
    key: EncryptionKey,
}

impl Unpacker {
    pub fn new(secrets: &ConnectionSecrets) -> Self {
        Self {
            connection_id: secrets.connection_id(),
            key: secrets.encryption_key().clone(),
        }
    }

    pub fn unpack(&self, message: &RpcMessage) -> Result<RtcPrimitive, SignalingError> {
        if message.connection_id != self.connection_id {
            return Err(SignalingError::WrongConnectionId {
                expected: self.connection_id,
                got: message.connection_id,
            });
        }
        let payload = decrypt(&message.encrypted_payload, &self.key)?;
        RtcPrimitive::from_payload_json(message.method, &payload)
            .map_err(|err| SignalingError::Payload(err.to_string()))
    }
}
