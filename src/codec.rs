//! Payload sealing.
//!
//! Every stored payload is wrapped in a versioned [`Envelope`]. In
//! [`SealMode::Encrypted`] the payload is ChaCha20-Poly1305 output
//! (`nonce ‖ ciphertext ‖ tag`, base64 encoded); in
//! [`SealMode::Obfuscated`] it is plain base64 of the cleartext and offers no
//! confidentiality. The mode is written into every envelope so the two can
//! never be confused.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::StoreError;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const FORMAT_VERSION: u32 = 1;

/// Symmetric key material. Zeroized on drop; `Debug` only shows a fingerprint.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let array: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            StoreError::Validation(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short SHA-256 prefix, safe to log.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(self.0)
            .iter()
            .take(6)
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyMaterial").field(&self.fingerprint()).finish()
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(plaintext: &[u8], key: &KeyMaterial) -> crate::Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::FatalStorage("encryption failed".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverse of [`encrypt`]. Truncated, tampered or foreign-key input is an
/// [`StoreError::Authentication`] error; corrupted plaintext is never returned.
pub fn decrypt(sealed: &[u8], key: &KeyMaterial) -> crate::Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(StoreError::Authentication(format!(
            "sealed payload too short ({} bytes)",
            sealed.len()
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::Authentication("wrong key or tampered data".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealMode {
    Encrypted,
    Obfuscated,
}

impl SealMode {
    pub fn is_confidential(self) -> bool {
        matches!(self, SealMode::Encrypted)
    }
}

impl fmt::Display for SealMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SealMode::Encrypted => write!(f, "encrypted"),
            SealMode::Obfuscated => write!(f, "obfuscated"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub format_version: u32,
    pub backend_mode: SealMode,
    pub payload: String,
}

/// Seals and opens envelopes for one backend.
#[derive(Debug, Clone)]
pub struct Codec {
    mode: SealMode,
    key: Option<KeyMaterial>,
}

impl Codec {
    pub fn encrypted(key: KeyMaterial) -> Self {
        Self {
            mode: SealMode::Encrypted,
            key: Some(key),
        }
    }

    pub fn obfuscated() -> Self {
        Self {
            mode: SealMode::Obfuscated,
            key: None,
        }
    }

    pub fn mode(&self) -> SealMode {
        self.mode
    }

    /// Exact length of [`seal`](Self::seal)'s output for a plaintext of
    /// `plaintext_len` bytes, without doing the work.
    pub fn sealed_len(&self, plaintext_len: usize) -> crate::Result<usize> {
        let raw_len = match self.mode {
            SealMode::Encrypted => NONCE_SIZE + plaintext_len + TAG_SIZE,
            SealMode::Obfuscated => plaintext_len,
        };
        let empty = Envelope {
            format_version: FORMAT_VERSION,
            backend_mode: self.mode,
            payload: String::new(),
        };
        // Base64 output needs no JSON escaping.
        Ok(serde_json::to_vec(&empty)?.len() + (raw_len + 2) / 3 * 4)
    }

    pub fn seal(&self, plaintext: &[u8]) -> crate::Result<Vec<u8>> {
        let payload = match (&self.mode, &self.key) {
            (SealMode::Encrypted, Some(key)) => BASE64.encode(encrypt(plaintext, key)?),
            (SealMode::Encrypted, None) => {
                return Err(StoreError::Configuration(
                    "encrypted codec has no key".to_string(),
                ))
            }
            (SealMode::Obfuscated, _) => BASE64.encode(plaintext),
        };
        let envelope = Envelope {
            format_version: FORMAT_VERSION,
            backend_mode: self.mode,
            payload,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    pub fn open(&self, stored: &[u8]) -> crate::Result<Vec<u8>> {
        let envelope: Envelope = serde_json::from_slice(stored)
            .map_err(|e| StoreError::Validation(format!("not an envelope: {}", e)))?;
        if envelope.format_version != FORMAT_VERSION {
            return Err(StoreError::Validation(format!(
                "unsupported format version {}",
                envelope.format_version
            )));
        }
        if envelope.backend_mode != self.mode {
            return Err(StoreError::Validation(format!(
                "envelope is {} but this backend reads {}",
                envelope.backend_mode, self.mode
            )));
        }
        let raw = BASE64.decode(envelope.payload.as_bytes()).map_err(|e| match self.mode {
            SealMode::Encrypted => StoreError::Authentication(format!("payload not base64: {}", e)),
            SealMode::Obfuscated => StoreError::Validation(format!("payload not base64: {}", e)),
        })?;
        match (&self.mode, &self.key) {
            (SealMode::Encrypted, Some(key)) => decrypt(&raw, key),
            (SealMode::Encrypted, None) => Err(StoreError::Configuration(
                "encrypted codec has no key".to_string(),
            )),
            (SealMode::Obfuscated, _) => Ok(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = KeyMaterial::generate();
        let sealed = encrypt(b"sk-live-credential", &key).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 18 + TAG_SIZE);
        assert_eq!(decrypt(&sealed, &key).unwrap(), b"sk-live-credential");
    }

    #[test]
    fn fresh_nonce_every_call() {
        let key = KeyMaterial::generate();
        let a = encrypt(b"same", &key).unwrap();
        let b = encrypt(b"same", &key).unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn every_flipped_byte_fails_authentication() {
        let key = KeyMaterial::generate();
        let sealed = encrypt(b"{\"apiKey\":\"secret\"}", &key).unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(decrypt(&tampered, &key), Err(StoreError::Authentication(_))),
                "byte {} flip was not detected",
                i
            );
        }
    }

    #[test]
    fn truncated_and_wrong_key_fail() {
        let key = KeyMaterial::generate();
        let sealed = encrypt(b"payload", &key).unwrap();
        assert!(matches!(
            decrypt(&sealed[..sealed.len() - 1], &key),
            Err(StoreError::Authentication(_))
        ));
        assert!(matches!(
            decrypt(&sealed[..5], &key),
            Err(StoreError::Authentication(_))
        ));
        let other = KeyMaterial::generate();
        assert!(matches!(decrypt(&sealed, &other), Err(StoreError::Authentication(_))));
    }

    #[test]
    fn envelope_carries_mode_flag() {
        let encrypted = Codec::encrypted(KeyMaterial::generate());
        let stored = encrypted.seal(b"hello").unwrap();
        let envelope: Envelope = serde_json::from_slice(&stored).unwrap();
        assert_eq!(envelope.backend_mode, SealMode::Encrypted);
        assert_eq!(envelope.format_version, FORMAT_VERSION);
        assert_eq!(encrypted.open(&stored).unwrap(), b"hello");

        let obfuscated = Codec::obfuscated();
        let stored = obfuscated.seal(b"hello").unwrap();
        let text = String::from_utf8(stored.clone()).unwrap();
        assert!(text.contains("\"backendMode\":\"obfuscated\""));
        assert_eq!(obfuscated.open(&stored).unwrap(), b"hello");
        assert!(!SealMode::Obfuscated.is_confidential());
    }

    #[test]
    fn mode_mismatch_is_rejected() {
        let stored = Codec::obfuscated().seal(b"hello").unwrap();
        let encrypted = Codec::encrypted(KeyMaterial::generate());
        assert!(matches!(encrypted.open(&stored), Err(StoreError::Validation(_))));
    }

    #[test]
    fn tampered_envelope_payload_fails() {
        let codec = Codec::encrypted(KeyMaterial::generate());
        let stored = codec.seal(b"settings").unwrap();
        let mut envelope: Envelope = serde_json::from_slice(&stored).unwrap();
        let mut raw = BASE64.decode(&envelope.payload).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        envelope.payload = BASE64.encode(raw);
        let tampered = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(codec.open(&tampered), Err(StoreError::Authentication(_))));
    }

    #[test]
    fn debug_never_prints_key_bytes() {
        let key = KeyMaterial::from_bytes([7u8; KEY_SIZE]);
        let shown = format!("{:?}", key);
        assert!(shown.contains(&key.fingerprint()));
        assert!(!shown.contains("7, 7"));
    }
}
