//! Crash-safe file replacement.
//!
//! Bytes go to a sibling temp file, are fsynced, and the temp file is then
//! renamed over the destination. A reader sees either the previous complete
//! file or the new complete file. Transient failures are retried a bounded
//! number of times before surfacing as [`StoreError::FatalStorage`].

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::{thread_rng, Rng};
use tracing::{debug, warn};

use crate::error::StoreError;

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct AtomicWriter {
    retries: u32,
    backoff: Duration,
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(20))
    }
}

impl AtomicWriter {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> crate::Result<()> {
        self.write_atomic_with_mode(path, bytes, None)
    }

    /// Like [`write_atomic`](Self::write_atomic), applying a Unix permission
    /// mode to the temp file before any bytes land in it.
    pub fn write_atomic_with_mode(
        &self,
        path: &Path,
        bytes: &[u8],
        mode: Option<u32>,
    ) -> crate::Result<()> {
        let mut attempt = 0;
        loop {
            let result = self
                .stage_with_mode(path, bytes, mode)
                .and_then(StagedWrite::commit)
                .map_err(classify);
            match result {
                Ok(()) => return Ok(()),
                Err(StoreError::TransientIo(reason)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(path = %path.display(), attempt, error = %reason, "transient write failure, retrying");
                    std::thread::sleep(self.backoff * attempt);
                }
                Err(StoreError::TransientIo(reason)) => {
                    return Err(StoreError::FatalStorage(format!(
                        "write to {} failed after {} retries: {}",
                        path.display(),
                        self.retries,
                        reason
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write and fsync the temp file without renaming it into place.
    pub fn stage(&self, path: &Path, bytes: &[u8]) -> crate::Result<StagedWrite> {
        self.stage_with_mode(path, bytes, None)
    }

    fn stage_with_mode(
        &self,
        path: &Path,
        bytes: &[u8],
        mode: Option<u32>,
    ) -> crate::Result<StagedWrite> {
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Validation(format!("no parent directory: {}", path.display())))?;
        fs::create_dir_all(parent)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| StoreError::Validation(format!("no file name: {}", path.display())))?
            .to_string_lossy();
        let suffix: u64 = thread_rng().gen();
        let tmp = parent.join(format!(".{}.{:016x}{}", file_name, suffix, TEMP_SUFFIX));

        let staged = StagedWrite {
            tmp: tmp.clone(),
            dest: path.to_path_buf(),
            committed: false,
        };

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            if let Some(mode) = mode {
                options.mode(mode);
            }
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(staged)
    }

    pub fn read_file(path: &Path) -> crate::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// A fully written temp file waiting to be renamed into place. Dropping it
/// without [`commit`](StagedWrite::commit) removes the temp file and leaves
/// the destination untouched.
#[derive(Debug)]
pub struct StagedWrite {
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }

    pub fn commit(mut self) -> crate::Result<()> {
        fs::rename(&self.tmp, &self.dest)?;
        self.committed = true;
        if let Some(parent) = self.dest.parent() {
            sync_dir(parent);
        }
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

pub fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Remove temp files left behind by writes that never reached the rename.
/// Walks `dir` and its immediate subdirectories; returns how many were removed.
pub fn sweep_temp_files(dir: &Path) -> usize {
    fn sweep(dir: &Path, depth: usize) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if depth > 0 {
                    removed += sweep(&path, depth - 1);
                }
            } else if is_temp_file(&name) && fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "removed stale temp file");
                removed += 1;
            }
        }
        removed
    }
    sweep(dir, 2)
}

fn classify(err: StoreError) -> StoreError {
    match err {
        StoreError::Io(e) if is_transient(&e) => StoreError::TransientIo(e.to_string()),
        other => other,
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => true,
        // Sharing violations while another handle has the destination open.
        ErrorKind::PermissionDenied => cfg!(windows),
        _ => false,
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
