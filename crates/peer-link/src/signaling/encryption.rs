use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use thiserror::Error;

use crate::model::EncryptionKey;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("sealed payload too short: {0} bytes")]
    TooShort(usize),
    #[error("failed to encrypt payload")]
    Encrypt,
    #[error("failed to decrypt payload")]
    Decrypt,
}

/// Seals `plaintext` with AES-256-GCM as `nonce || ciphertext || tag`, using a
/// fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, EncryptionError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    seal(plaintext, key, &nonce)
}

fn seal(plaintext: &[u8], key: &EncryptionKey, nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| EncryptionError::Encrypt)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| EncryptionError::Encrypt)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn decrypt(sealed: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, EncryptionError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(EncryptionError::TooShort(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| EncryptionError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EncryptionError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_payload_opens_with_same_key() {
        let key = EncryptionKey::new([7; 32]);
        let sealed = encrypt(b"v=0 offer", &key).expect("encrypt");
        assert_eq!(sealed.len(), NONCE_LEN + 9 + TAG_LEN);
        assert_eq!(decrypt(&sealed, &key).expect("decrypt"), b"v=0 offer");
    }

    // AES-256-GCM test case 14 from the GCM submission: zero key, zero IV,
    // one zero block.
    const ZERO_BLOCK_SEALED: &str = "000000000000000000000000\
                                     cea7403d4d606b6e074ec5d3baf39d18\
                                     d0d1c8a799996bf0265b98b5d48ab919";

    #[test]
    fn matches_the_aes_gcm_known_answer() {
        let key = EncryptionKey::new([0; 32]);
        let expected = hex::decode(ZERO_BLOCK_SEALED).expect("vector");
        assert_eq!(seal(&[0; 16], &key, &[0; NONCE_LEN]).expect("seal"), expected);
        assert_eq!(decrypt(&expected, &key).expect("decrypt"), vec![0; 16]);
    }

    #[test]
    fn nonces_are_fresh() {
        let key = EncryptionKey::new([7; 32]);
        let a = encrypt(b"same", &key).expect("encrypt");
        let b = encrypt(b"same", &key).expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_or_wrong_key_fails() {
        let key = EncryptionKey::new([7; 32]);
        let mut sealed = encrypt(b"payload", &key).expect("encrypt");
        assert_eq!(
            decrypt(&sealed, &EncryptionKey::new([8; 32])),
            Err(EncryptionError::Decrypt)
        );
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert_eq!(decrypt(&sealed, &key), Err(EncryptionError::Decrypt));
        assert_eq!(decrypt(&sealed[..10], &key), Err(EncryptionError::TooShort(10)));
    }
}
