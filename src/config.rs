use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const DEFAULT_VENDOR: &str = "PanelVault";
pub const DEFAULT_APP: &str = "ae-chat-panel";
pub const DEFAULT_ROTATION_THRESHOLD: u64 = 256 * 1024;

/// Store configuration. Everything has a default; `from_env` overlays
/// `PANEL_VAULT_*` variables on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub vendor: String,
    pub app: String,
    /// Overrides the OS-derived base directory.
    pub base_dir: Option<PathBuf>,
    pub rotation_threshold_bytes: u64,
    pub write_retries: u32,
    pub retry_backoff_ms: u64,
    pub mirror_to_fallback: bool,
    /// Pretend no native file system is reachable.
    pub disable_native: bool,
    /// Persist the browser-fallback area to this file instead of keeping it in memory.
    pub fallback_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            vendor: DEFAULT_VENDOR.to_string(),
            app: DEFAULT_APP.to_string(),
            base_dir: None,
            rotation_threshold_bytes: DEFAULT_ROTATION_THRESHOLD,
            write_retries: 3,
            retry_backoff_ms: 20,
            mirror_to_fallback: false,
            disable_native: false,
            fallback_path: None,
        }
    }
}

impl StoreConfig {
    pub fn with_base_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_env() -> crate::Result<Self> {
        Self::default().overlay_env()
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: StoreConfig = serde_json::from_str(&data)
            .map_err(|e| StoreError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn overlay_env(mut self) -> crate::Result<Self> {
        if let Some(dir) = std::env::var_os("PANEL_VAULT_DIR").filter(|v| !v.is_empty()) {
            self.base_dir = Some(PathBuf::from(dir));
        }
        if let Some(bytes) = env_parse::<u64>("PANEL_VAULT_ROTATE_BYTES")? {
            self.rotation_threshold_bytes = bytes;
        }
        if let Some(retries) = env_parse::<u32>("PANEL_VAULT_RETRIES")? {
            self.write_retries = retries;
        }
        if let Some(mirror) = env_parse::<EnvFlag>("PANEL_VAULT_MIRROR")? {
            self.mirror_to_fallback = mirror.0;
        }
        if let Some(disable) = env_parse::<EnvFlag>("PANEL_VAULT_DISABLE_NATIVE")? {
            self.disable_native = disable.0;
        }
        if let Some(path) = std::env::var_os("PANEL_VAULT_FALLBACK_PATH").filter(|v| !v.is_empty()) {
            self.fallback_path = Some(PathBuf::from(path));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.rotation_threshold_bytes == 0 {
            return Err(StoreError::Configuration(
                "rotationThresholdBytes must be greater than zero".to_string(),
            ));
        }
        if self.vendor.trim().is_empty() || self.app.trim().is_empty() {
            return Err(StoreError::Configuration(
                "vendor and app must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| crate::paths::base_dir(&self.vendor, &self.app))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Boolean environment flag: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EnvFlag(bool);

impl std::str::FromStr for EnvFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(EnvFlag(true)),
            "0" | "false" | "no" | "off" => Ok(EnvFlag(false)),
            _ => Err("expected 1/0, true/false, yes/no or on/off".to_string()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> crate::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| StoreError::Configuration(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}
