//! Where persisted files live.
//!
//! The base directory is vendor/app scoped under the per-user application
//! data location of the host OS. Resolution only reads environment
//! variables; it never touches the file system and never fails.

use std::path::{Path, PathBuf};

pub const SETTINGS_SLOT: &str = "settings";
pub const KEY_FILE: &str = "store.key";
pub const CONVERSATIONS_DIR: &str = "conversations";
pub const ACTIVE_SEGMENT: &str = "active";
pub const ARCHIVE_PREFIX: &str = "archive-";

fn env_dir(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_or_cwd() -> PathBuf {
    env_dir("HOME").unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve the application base directory for `vendor`/`app`.
pub fn base_dir(vendor: &str, app: &str) -> PathBuf {
    if cfg!(target_os = "windows") {
        env_dir("APPDATA")
            .or_else(|| env_dir("LOCALAPPDATA"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(vendor)
            .join(app)
    } else if cfg!(target_os = "macos") {
        home_or_cwd()
            .join("Library/Application Support")
            .join(vendor)
            .join(app)
    } else if cfg!(target_os = "linux") {
        env_dir("XDG_DATA_HOME")
            .unwrap_or_else(|| home_or_cwd().join(".local/share"))
            .join(vendor)
            .join(app)
    } else {
        env_dir("APPDATA")
            .or_else(|| env_dir("HOME"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(format!(".{}", vendor))
            .join(app)
    }
}

pub fn key_file(base: &Path) -> PathBuf {
    base.join(KEY_FILE)
}

/// Logical slot name of the settings record.
pub fn settings_slot() -> String {
    SETTINGS_SLOT.to_string()
}

pub fn conversation_dir(conversation_id: &str) -> String {
    format!("{}/{}", CONVERSATIONS_DIR, conversation_id)
}

pub fn active_slot(conversation_id: &str) -> String {
    format!("{}/{}", conversation_dir(conversation_id), ACTIVE_SEGMENT)
}

pub fn segment_slot(conversation_id: &str, segment: &str) -> String {
    format!("{}/{}", conversation_dir(conversation_id), segment)
}

/// Conversation ids become directory names, so only a conservative charset is accepted.
pub fn validate_conversation_id(id: &str) -> crate::Result<()> {
    let well_formed = !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if well_formed {
        Ok(())
    } else {
        Err(crate::StoreError::Validation(format!(
            "invalid conversation id: {:?}",
            id
        )))
    }
}
