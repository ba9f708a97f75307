use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::atomic::AtomicWriter;
use crate::codec::KeyMaterial;
use crate::error::StoreError;

const KEY_FILE_VERSION: u32 = 1;
const KEY_FILE_MODE: u32 = 0o600;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    version: u32,
    created_at: DateTime<Utc>,
    key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// An existing key file was read.
    Loaded,
    /// First run: no key file existed.
    Created,
    /// The key file was unreadable; a new key replaced it and everything
    /// sealed under the old key is gone.
    Regenerated,
}

#[derive(Debug, Clone)]
pub struct LoadedKey {
    pub material: KeyMaterial,
    pub created_at: DateTime<Utc>,
    pub status: KeyStatus,
}

pub struct KeyManager {
    path: PathBuf,
    writer: AtomicWriter,
}

impl KeyManager {
    pub fn new(path: impl Into<PathBuf>, writer: AtomicWriter) -> Self {
        Self {
            path: path.into(),
            writer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_or_create_key(&self) -> crate::Result<LoadedKey> {
        match AtomicWriter::read_file(&self.path) {
            Ok(Some(bytes)) => match Self::parse(&bytes) {
                Ok(loaded) => {
                    info!(fingerprint = %loaded.material.fingerprint(), "loaded storage key");
                    Ok(loaded)
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "key file is corrupt, generating a new key; previously encrypted data is unrecoverable");
                    self.create(KeyStatus::Regenerated)
                }
            },
            Ok(None) => self.create(KeyStatus::Created),
            Err(StoreError::Io(e)) if e.kind() != std::io::ErrorKind::PermissionDenied => {
                warn!(path = %self.path.display(), error = %e, "key file is unreadable, generating a new key; previously encrypted data is unrecoverable");
                self.create(KeyStatus::Regenerated)
            }
            Err(e) => Err(e),
        }
    }

    fn parse(bytes: &[u8]) -> crate::Result<LoadedKey> {
        let file: KeyFile = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Validation(format!("key file: {}", e)))?;
        if file.version != KEY_FILE_VERSION {
            return Err(StoreError::Validation(format!(
                "key file version {}",
                file.version
            )));
        }
        let raw = Zeroizing::new(
            BASE64
                .decode(file.key.as_bytes())
                .map_err(|e| StoreError::Validation(format!("key file: {}", e)))?,
        );
        Ok(LoadedKey {
            material: KeyMaterial::from_slice(&raw)?,
            created_at: file.created_at,
            status: KeyStatus::Loaded,
        })
    }

    fn create(&self, status: KeyStatus) -> crate::Result<LoadedKey> {
        // Best-effort first-run serialization: another caller may have written
        // the key since we looked. The host runs a single instance, so the
        // remaining window is accepted.
        if status == KeyStatus::Created {
            if let Some(bytes) = AtomicWriter::read_file(&self.path)? {
                if let Ok(existing) = Self::parse(&bytes) {
                    return Ok(existing);
                }
            }
        }

        let material = KeyMaterial::generate();
        let created_at = Utc::now();
        let file = KeyFile {
            version: KEY_FILE_VERSION,
            created_at,
            key: BASE64.encode(material.as_bytes()),
        };
        let encoded = Zeroizing::new(serde_json::to_vec(&file)?);
        self.writer
            .write_atomic_with_mode(&self.path, &encoded, Some(KEY_FILE_MODE))?;
        info!(fingerprint = %material.fingerprint(), ?status, "wrote new storage key");

        Ok(LoadedKey {
            material,
            created_at,
            status,
        })
    }
}
