use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::backend::{BackendKind, KeyValueArea};

/// Decides which backend is authoritative. Probing reads metadata only and
/// the first answer is kept for the adapter's lifetime.
pub struct EnvironmentAdapter {
    host: Option<Arc<dyn KeyValueArea>>,
    base_dir: PathBuf,
    native_disabled: bool,
    selected: OnceCell<BackendKind>,
}

impl EnvironmentAdapter {
    pub fn new(
        host: Option<Arc<dyn KeyValueArea>>,
        base_dir: impl Into<PathBuf>,
        native_disabled: bool,
    ) -> Self {
        Self {
            host,
            base_dir: base_dir.into(),
            native_disabled,
            selected: OnceCell::new(),
        }
    }

    pub fn select_backend(&self) -> BackendKind {
        *self.selected.get_or_init(|| {
            let kind = if self.host_available() {
                BackendKind::HostBridge
            } else if self.native_reachable() {
                BackendKind::NativeEncrypted
            } else {
                BackendKind::BrowserFallback
            };
            debug!(%kind, base_dir = %self.base_dir.display(), "selected storage backend");
            kind
        })
    }

    /// The selected backend followed by every available lower-priority one.
    pub fn chain(&self) -> Vec<BackendKind> {
        let mut chain = vec![self.select_backend()];
        if chain[0] == BackendKind::HostBridge && self.native_reachable() {
            chain.push(BackendKind::NativeEncrypted);
        }
        if chain[0] != BackendKind::BrowserFallback {
            chain.push(BackendKind::BrowserFallback);
        }
        chain
    }

    pub fn host_available(&self) -> bool {
        self.host.as_ref().map_or(false, |host| host.is_available())
    }

    pub fn native_reachable(&self) -> bool {
        !self.native_disabled && writable_ancestor(&self.base_dir)
    }

    pub fn host(&self) -> Option<Arc<dyn KeyValueArea>> {
        self.host.clone()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// The nearest existing ancestor of `path` (or `path` itself) is a directory
/// we could create files in.
fn writable_ancestor(path: &Path) -> bool {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .or_else(|| path.is_relative().then(|| Path::new(".")))
        .and_then(|p| std::fs::metadata(p).ok())
        .map_or(false, |meta| meta.is_dir() && !meta.permissions().readonly())
}
