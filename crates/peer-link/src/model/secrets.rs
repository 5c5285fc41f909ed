use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use super::ids::PeerConnectionId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// The 32-byte secret both endpoints share out of band.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionPassword([u8; 32]);

impl ConnectionPassword {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(value.trim()).map_err(|err| SecretError::InvalidHex(err.to_string()))?;
        let got = bytes.len();
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| SecretError::InvalidLength {
            expected: Self::LEN,
            got,
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ConnectionPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionPassword(<redacted>)")
    }
}

impl FromStr for ConnectionPassword {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Symmetric key used to seal signaling payloads. Taken verbatim from the password bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Everything derived from one password. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecrets {
    password: ConnectionPassword,
    connection_id: PeerConnectionId,
    encryption_key: EncryptionKey,
}

impl ConnectionSecrets {
    pub fn from_password(password: ConnectionPassword) -> Self {
        let connection_id = PeerConnectionId::from_password(&password);
        let encryption_key = EncryptionKey::new(*password.as_bytes());
        Self {
            password,
            connection_id,
            encryption_key,
        }
    }

    pub fn password(&self) -> &ConnectionPassword {
        &self.password
    }

    pub fn connection_id(&self) -> PeerConnectionId {
        self.connection_id
    }

    pub fn encryption_key(&self) -> &EncryptionKey {
        &self.encryption_key
    }
}
