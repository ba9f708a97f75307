//! Storage backends.
//!
//! Every backend stores opaque byte blobs under logical slot names such as
//! `settings` or `conversations/<id>/active`. The three variants differ only
//! in where the blobs go and how they are sealed:
//!
//! | kind              | medium                         | seal mode    |
//! |-------------------|--------------------------------|--------------|
//! | `HostBridge`      | embedder-supplied key/value API | obfuscated  |
//! | `NativeEncrypted` | files under the base directory | encrypted    |
//! | `BrowserFallback` | in-process local area          | obfuscated   |

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::atomic::{self, AtomicWriter};
use crate::codec::{Codec, SealMode};
use crate::error::StoreError;
use crate::keys::{KeyManager, LoadedKey};
use crate::paths;

const FILE_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    HostBridge,
    NativeEncrypted,
    BrowserFallback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::HostBridge => write!(f, "host-bridge"),
            BackendKind::NativeEncrypted => write!(f, "native-encrypted"),
            BackendKind::BrowserFallback => write!(f, "browser-fallback"),
        }
    }
}

/// A string key/value store in the shape of web storage. The embedding host
/// provides one as its bridge; [`LocalArea`] is the in-process fallback.
pub trait KeyValueArea: Send + Sync {
    /// Whether the area can be used right now. Must not have side effects.
    fn is_available(&self) -> bool {
        true
    }
    fn get_item(&self, key: &str) -> crate::Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> crate::Result<()>;
    fn remove_item(&self, key: &str) -> crate::Result<()>;
    fn keys(&self) -> crate::Result<Vec<String>>;
}

/// In-process key/value area, optionally mirrored to a JSON file.
pub struct LocalArea {
    items: RwLock<BTreeMap<String, String>>,
    persistence_path: Option<PathBuf>,
    writer: AtomicWriter,
}

impl LocalArea {
    pub fn in_memory() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            persistence_path: None,
            writer: AtomicWriter::default(),
        }
    }

    /// Back the area with `path`; existing contents are loaded. An unreadable
    /// file starts the area empty rather than failing.
    pub fn with_path(path: impl Into<PathBuf>, writer: AtomicWriter) -> Self {
        let path = path.into();
        let mut items = BTreeMap::new();
        if let Ok(Some(data)) = AtomicWriter::read_file(&path) {
            match serde_json::from_slice::<BTreeMap<String, String>>(&data) {
                Ok(loaded) => items = loaded,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable fallback area"),
            }
        }
        Self {
            items: RwLock::new(items),
            persistence_path: Some(path),
            writer,
        }
    }

    /// Whether contents reach a file on disk.
    pub fn is_persistent(&self) -> bool {
        self.persistence_path.is_some()
    }

    fn with_write<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> R,
    {
        let mut guard = self
            .items
            .write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let Some(path) = &self.persistence_path else {
            return Ok(f(&mut guard));
        };
        // Only publish the change once it is on disk.
        let mut staged = guard.clone();
        let result = f(&mut staged);
        self.writer.write_atomic(path, &serde_json::to_vec(&staged)?)?;
        *guard = staged;
        Ok(result)
    }
}

impl KeyValueArea for LocalArea {
    fn get_item(&self, key: &str) -> crate::Result<Option<String>> {
        let guard = self
            .items
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> crate::Result<()> {
        self.with_write(|items| {
            items.insert(key.to_string(), value.to_string());
        })
    }

    fn remove_item(&self, key: &str) -> crate::Result<()> {
        self.with_write(|items| {
            items.remove(key);
        })
    }

    fn keys(&self) -> crate::Result<Vec<String>> {
        let guard = self
            .items
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(guard.keys().cloned().collect())
    }
}

/// Files under a root directory, one `<slot>.json` per slot.
pub struct NativeFiles {
    root: PathBuf,
    writer: AtomicWriter,
}

impl NativeFiles {
    pub fn new(root: impl Into<PathBuf>, writer: AtomicWriter) -> Self {
        Self {
            root: root.into(),
            writer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, slot: &str) -> PathBuf {
        self.root.join(format!("{}.{}", slot, FILE_EXTENSION))
    }

    fn dir_for(&self, dir: &str) -> PathBuf {
        self.root.join(dir)
    }
}

pub enum Medium {
    Host(Arc<dyn KeyValueArea>),
    Native(NativeFiles),
    Local(Arc<LocalArea>),
}

impl Medium {
    fn area(&self) -> Option<&dyn KeyValueArea> {
        match self {
            Medium::Host(area) => Some(&**area),
            Medium::Local(area) => Some(&**area as &dyn KeyValueArea),
            Medium::Native(_) => None,
        }
    }
}

pub struct Backend {
    kind: BackendKind,
    codec: Codec,
    medium: Medium,
    namespace: String,
}

impl Backend {
    pub fn host_bridge(area: Arc<dyn KeyValueArea>, namespace: &str) -> Self {
        Self {
            kind: BackendKind::HostBridge,
            codec: Codec::obfuscated(),
            medium: Medium::Host(area),
            namespace: namespace.to_string(),
        }
    }

    pub fn browser_fallback(area: Arc<LocalArea>, namespace: &str) -> Self {
        Self {
            kind: BackendKind::BrowserFallback,
            codec: Codec::obfuscated(),
            medium: Medium::Local(area),
            namespace: namespace.to_string(),
        }
    }

    /// Open the encrypted file backend rooted at `root`, loading or creating
    /// the installation key.
    pub fn native(root: &Path, writer: AtomicWriter) -> crate::Result<(Self, LoadedKey)> {
        fs::create_dir_all(root)?;
        let swept = atomic::sweep_temp_files(root);
        if swept > 0 {
            info!(root = %root.display(), swept, "cleaned up interrupted writes");
        }
        let key = KeyManager::new(paths::key_file(root), writer.clone()).get_or_create_key()?;
        let backend = Self {
            kind: BackendKind::NativeEncrypted,
            codec: Codec::encrypted(key.material.clone()),
            medium: Medium::Native(NativeFiles::new(root, writer)),
            namespace: String::new(),
        };
        Ok((backend, key))
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn seal_mode(&self) -> SealMode {
        self.codec.mode()
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    /// Unencrypted blobs that end up in a file on the local disk.
    pub fn writes_cleartext_to_disk(&self) -> bool {
        match &self.medium {
            Medium::Local(area) => area.is_persistent(),
            _ => false,
        }
    }

    fn area_key(&self, slot: &str) -> String {
        format!("{}:{}", self.namespace, slot)
    }

    /// Stored size of a slot holding `plaintext_len` bytes.
    pub fn sealed_len(&self, plaintext_len: usize) -> crate::Result<u64> {
        Ok(self.codec.sealed_len(plaintext_len)? as u64)
    }

    /// Read and unseal a slot. `Ok(None)` when the slot does not exist.
    pub fn read(&self, slot: &str) -> crate::Result<Option<Vec<u8>>> {
        let stored = self.read_raw(slot)?;
        stored.map(|bytes| self.codec.open(&bytes)).transpose()
    }

    /// Seal and atomically replace a slot.
    pub fn write(&self, slot: &str, plaintext: &[u8]) -> crate::Result<()> {
        let sealed = self.codec.seal(plaintext)?;
        debug!(backend = %self.kind, slot, bytes = sealed.len(), "writing slot");
        match &self.medium {
            Medium::Native(files) => files.writer.write_atomic(&files.file_for(slot), &sealed),
            _ => {
                let text = String::from_utf8(sealed)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                self.require_area()?.set_item(&self.area_key(slot), &text)
            }
        }
    }

    pub fn read_raw(&self, slot: &str) -> crate::Result<Option<Vec<u8>>> {
        match &self.medium {
            Medium::Native(files) => AtomicWriter::read_file(&files.file_for(slot)),
            _ => Ok(self
                .require_area()?
                .get_item(&self.area_key(slot))?
                .map(String::into_bytes)),
        }
    }

    pub fn exists(&self, slot: &str) -> crate::Result<bool> {
        match &self.medium {
            Medium::Native(files) => Ok(files.file_for(slot).exists()),
            _ => Ok(self.require_area()?.get_item(&self.area_key(slot))?.is_some()),
        }
    }

    /// Move a slot's sealed contents to a new name without re-sealing.
    pub fn rename(&self, from: &str, to: &str) -> crate::Result<()> {
        match &self.medium {
            Medium::Native(files) => {
                fs::rename(files.file_for(from), files.file_for(to))?;
                Ok(())
            }
            _ => {
                let area = self.require_area()?;
                let value = area
                    .get_item(&self.area_key(from))?
                    .ok_or_else(|| StoreError::NotFound(from.to_string()))?;
                area.set_item(&self.area_key(to), &value)?;
                area.remove_item(&self.area_key(from))
            }
        }
    }

    pub fn remove(&self, slot: &str) -> crate::Result<()> {
        match &self.medium {
            Medium::Native(files) => match fs::remove_file(files.file_for(slot)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            _ => self.require_area()?.remove_item(&self.area_key(slot)),
        }
    }

    /// Remove every slot under `dir`. Returns whether anything was there.
    pub fn remove_dir(&self, dir: &str) -> crate::Result<bool> {
        match &self.medium {
            Medium::Native(files) => match fs::remove_dir_all(files.dir_for(dir)) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            },
            _ => {
                let area = self.require_area()?;
                let prefix = self.area_key(&format!("{}/", dir));
                let doomed: Vec<String> = area
                    .keys()?
                    .into_iter()
                    .filter(|k| k.starts_with(&prefix))
                    .collect();
                for key in &doomed {
                    area.remove_item(key)?;
                }
                Ok(!doomed.is_empty())
            }
        }
    }

    /// Immediate children of `dir`, sorted: subdirectory names and slot names
    /// (without extension). Temp files are never listed; directories always are,
    /// whatever their name.
    pub fn children(&self, dir: &str) -> crate::Result<Vec<String>> {
        let mut names = BTreeSet::new();
        match &self.medium {
            Medium::Native(files) => {
                let entries = match fs::read_dir(files.dir_for(dir)) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type()?.is_dir() {
                        names.insert(name);
                    } else if atomic::is_temp_file(&name) {
                        continue;
                    } else if let Some(stem) = name.strip_suffix(&format!(".{}", FILE_EXTENSION)) {
                        names.insert(stem.to_string());
                    }
                }
            }
            _ => {
                let prefix = self.area_key(&format!("{}/", dir));
                for key in self.require_area()?.keys()? {
                    if let Some(rest) = key.strip_prefix(&prefix) {
                        if let Some(first) = rest.split('/').next().filter(|s| !s.is_empty()) {
                            names.insert(first.to_string());
                        }
                    }
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn require_area(&self) -> crate::Result<&dyn KeyValueArea> {
        self.medium
            .area()
            .ok_or_else(|| StoreError::Backend(format!("{} has no key/value area", self.kind)))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind)
            .field("mode", &self.codec.mode())
            .finish()
    }
}
