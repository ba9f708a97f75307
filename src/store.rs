//! The public façade.
//!
//! A [`Store`] owns a priority-ordered chain of backends chosen once by the
//! [`EnvironmentAdapter`]. Reads fall through the chain until a backend has
//! a valid value; writes go to the first backend (and optionally a
//! best-effort mirror in the browser fallback).
//!
//! Writes to one logical key run one at a time, in a spawned task, so a
//! caller that stops waiting never interrupts a write that has started.
//! Reads of a key wait for a write in flight on the same key.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::atomic::AtomicWriter;
use crate::backend::{Backend, BackendKind, KeyValueArea, LocalArea};
use crate::codec::SealMode;
use crate::config::StoreConfig;
use crate::environment::EnvironmentAdapter;
use crate::error::StoreError;
use crate::keys::KeyStatus;
use crate::model::{self, Conversation, Message, NewMessage, SettingsRecord};
use crate::paths;
use crate::redact;
use crate::rotation::{AppendOutcome, RotationManager};

const SETTINGS_LOCK: &str = "settings";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearTarget {
    Setting(String),
    Conversation(String),
}

impl ClearTarget {
    fn lock_key(&self) -> String {
        match self {
            ClearTarget::Setting(_) => SETTINGS_LOCK.to_string(),
            ClearTarget::Conversation(id) => conversation_lock(id),
        }
    }
}

fn conversation_lock(id: &str) -> String {
    format!("conversation:{}", id)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationExport<'a> {
    id: &'a str,
    created_at: DateTime<Utc>,
    exported_at: DateTime<Utc>,
    message_count: usize,
    messages: &'a [Message],
}

/// One queue per logical key.
#[derive(Default)]
struct KeyQueues {
    queues: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl KeyQueues {
    fn queue(&self, key: &str) -> Arc<RwLock<()>> {
        let mut queues = match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

struct StoreInner {
    config: StoreConfig,
    base_dir: PathBuf,
    chain: Vec<Backend>,
    rotation: RotationManager,
    key_status: Option<KeyStatus>,
    writer: AtomicWriter,
    queues: KeyQueues,
}

pub struct StoreBuilder {
    config: StoreConfig,
    host: Option<Arc<dyn KeyValueArea>>,
    fallback: Option<Arc<LocalArea>>,
}

impl StoreBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            host: None,
            fallback: None,
        }
    }

    /// Storage API supplied by the embedding host.
    pub fn host_bridge(mut self, host: Arc<dyn KeyValueArea>) -> Self {
        self.host = Some(host);
        self
    }

    /// Use this area as the browser fallback instead of a fresh one.
    pub fn fallback_area(mut self, area: Arc<LocalArea>) -> Self {
        self.fallback = Some(area);
        self
    }

    pub fn build(self) -> crate::Result<Store> {
        let config = self.config;
        config.validate()?;
        let base_dir = config.resolved_base_dir();
        let writer = AtomicWriter::new(config.write_retries, config.retry_backoff());
        let namespace = format!("{}.{}", config.vendor, config.app);
        let adapter = EnvironmentAdapter::new(self.host.clone(), &base_dir, config.disable_native);

        let mut chain = Vec::new();
        let mut key_status = None;
        for kind in adapter.chain() {
            match kind {
                BackendKind::HostBridge => {
                    if let Some(host) = adapter.host() {
                        chain.push(Backend::host_bridge(host, &namespace));
                    }
                }
                BackendKind::NativeEncrypted => match Backend::native(&base_dir, writer.clone()) {
                    Ok((backend, key)) => {
                        if key.status == KeyStatus::Regenerated {
                            warn!(base_dir = %base_dir.display(), "storage key was regenerated; older encrypted data cannot be read");
                        }
                        key_status = Some(key.status);
                        chain.push(backend);
                    }
                    Err(e) => {
                        warn!(base_dir = %base_dir.display(), error = %e, "native storage unavailable, falling through");
                    }
                },
                BackendKind::BrowserFallback => {
                    let area = match (self.fallback.clone(), &config.fallback_path) {
                        (Some(area), _) => area,
                        (None, Some(path)) => Arc::new(LocalArea::with_path(path, writer.clone())),
                        (None, None) => Arc::new(LocalArea::in_memory()),
                    };
                    chain.push(Backend::browser_fallback(area, &namespace));
                }
            }
        }
        if chain.is_empty() {
            return Err(StoreError::FatalStorage("no storage backend available".to_string()));
        }

        info!(
            primary = %chain[0].kind(),
            mode = %chain[0].seal_mode(),
            backends = chain.len(),
            "store opened"
        );
        if !chain[0].seal_mode().is_confidential() {
            warn!(primary = %chain[0].kind(), "authoritative backend only obfuscates; credentials are not encrypted at rest");
        }

        Ok(Store {
            inner: Arc::new(StoreInner {
                rotation: RotationManager::new(config.rotation_threshold_bytes),
                config,
                base_dir,
                chain,
                key_status,
                writer,
                queues: KeyQueues::default(),
            }),
        })
    }
}

/// Handle to the persistence layer. Cheap to clone; construct one per process.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn open(config: StoreConfig) -> crate::Result<Self> {
        StoreBuilder::new(config).build()
    }

    pub fn builder(config: StoreConfig) -> StoreBuilder {
        StoreBuilder::new(config)
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.chain[0].kind()
    }

    pub fn chain(&self) -> Vec<BackendKind> {
        self.inner.chain.iter().map(Backend::kind).collect()
    }

    /// Whether the authoritative backend really encrypts, or only obfuscates.
    pub fn seal_mode(&self) -> SealMode {
        self.inner.chain[0].seal_mode()
    }

    /// How the native key was obtained, if the native backend is in the chain.
    pub fn key_status(&self) -> Option<KeyStatus> {
        self.inner.key_status
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    // Run a read against the store once no write on `key` is in flight.
    async fn with_read<F, R>(&self, key: &str, f: F) -> crate::Result<R>
    where
        F: FnOnce(&StoreInner) -> crate::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let queue = self.inner.queues.queue(key);
        let _guard = queue.read().await;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&*inner)).await?
    }

    // Queue a write on `key`. The write joins the key's queue during the first
    // poll, before anything can be cancelled, and then runs in its own task:
    // dropping the returned future neither cancels it nor lets a later read
    // on the same key overtake it.
    async fn with_write<F, R>(&self, key: String, f: F) -> crate::Result<R>
    where
        F: FnOnce(&StoreInner) -> crate::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let queue = self.inner.queues.queue(&key);
        let mut acquire = Box::pin(queue.write_owned());
        // Poll once without suspending; a pending acquire keeps its place in line.
        let held = std::future::poll_fn(|cx| Poll::Ready(acquire.as_mut().poll(cx)))
            .await;
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _guard = match held {
                Poll::Ready(guard) => guard,
                Poll::Pending => acquire.await,
            };
            tokio::task::spawn_blocking(move || f(&*inner)).await?
        });
        task.await?
    }

    /// Value for `key`, or `default` on a miss or a value failing validation.
    pub async fn get(&self, key: &str, default: Value) -> Value {
        let owned = key.to_string();
        match self
            .with_read(SETTINGS_LOCK, move |inner| Ok(inner.read_setting(&owned)))
            .await
        {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                error!(key, error = %e, "settings read failed");
                default
            }
        }
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key, Value::Null).await {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The whole settings record as seen through the chain (first backend
    /// holding a readable record wins).
    pub async fn settings(&self) -> crate::Result<SettingsRecord> {
        self.with_read(SETTINGS_LOCK, |inner| Ok(inner.read_settings_record()))
            .await
    }

    pub async fn set(&self, key: &str, value: Value) -> crate::Result<()> {
        self.set_many(vec![(key.to_string(), value)]).await
    }

    /// Apply several settings under a single write.
    pub async fn set_many(&self, entries: Vec<(String, Value)>) -> crate::Result<()> {
        for (key, value) in &entries {
            model::validate_setting(key, value)?;
        }
        let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
        self.with_write(SETTINGS_LOCK.to_string(), move |inner| {
            inner.write_settings(&|record: &mut SettingsRecord| {
                for (key, value) in &entries {
                    record.insert(key.clone(), value.clone());
                }
                true
            })
        })
        .await?;
        debug!(?keys, "settings updated");
        Ok(())
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> crate::Result<AppendOutcome> {
        paths::validate_conversation_id(conversation_id)?;
        let message = message.stamp()?;
        let id = conversation_id.to_string();
        self.with_write(conversation_lock(conversation_id), move |inner| {
            inner.append(&id, &message)
        })
        .await
    }

    /// Ids of every conversation in any backend, sorted.
    pub async fn list_conversations(&self) -> crate::Result<Vec<String>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || Ok(inner.list_conversations())).await?
    }

    pub async fn read_conversation(&self, id: &str) -> crate::Result<Conversation> {
        paths::validate_conversation_id(id)?;
        let owned = id.to_string();
        self.with_read(&conversation_lock(id), move |inner| {
            inner
                .read_conversation(&owned)
                .ok_or_else(|| StoreError::NotFound(format!("conversation {}", owned)))
        })
        .await
    }

    /// Segment names of a conversation in the authoritative backend holding it.
    pub async fn conversation_segments(&self, id: &str) -> crate::Result<Vec<String>> {
        paths::validate_conversation_id(id)?;
        let owned = id.to_string();
        self.with_read(&conversation_lock(id), move |inner| {
            for backend in &inner.chain {
                let segments = RotationManager::segments(backend, &owned)?;
                if !segments.is_empty() {
                    return Ok(segments);
                }
            }
            Ok(Vec::new())
        })
        .await
    }

    /// Redacted JSON rendering of a conversation, for handing to a save dialog.
    pub async fn export_conversation(&self, id: &str) -> crate::Result<Vec<u8>> {
        let conversation = self.read_conversation(id).await?;
        let export = ConversationExport {
            id: &conversation.id,
            created_at: conversation.created_at,
            exported_at: Utc::now(),
            message_count: conversation.messages.len(),
            messages: &conversation.messages,
        };
        let json = serde_json::to_string_pretty(&export)?;
        Ok(redact::redact(&json).into_bytes())
    }

    pub async fn export_conversation_to_file(&self, id: &str, path: &Path) -> crate::Result<()> {
        let bytes = self.export_conversation(id).await?;
        let writer = self.inner.writer.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || writer.write_atomic(&path, &bytes)).await?
    }

    /// Delete a setting or a whole conversation from every backend holding it.
    pub async fn clear(&self, target: ClearTarget) -> crate::Result<()> {
        if let ClearTarget::Conversation(id) = &target {
            paths::validate_conversation_id(id)?;
        }
        self.with_write(target.lock_key(), move |inner| inner.clear(&target))
            .await
    }
}

impl StoreInner {
    fn primary(&self) -> &Backend {
        &self.chain[0]
    }

    fn mirror(&self) -> Option<&Backend> {
        if !self.config.mirror_to_fallback {
            return None;
        }
        self.chain
            .iter()
            .skip(1)
            .find(|b| b.kind() == BackendKind::BrowserFallback)
    }

    fn load_settings(backend: &Backend) -> crate::Result<Option<SettingsRecord>> {
        let Some(bytes) = backend.read(&paths::settings_slot())? else {
            return Ok(None);
        };
        let record: SettingsRecord = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Validation(format!("settings record: {}", e)))?;
        Ok(Some(record))
    }

    fn log_read_failure(backend: &Backend, what: &str, err: &StoreError) {
        match err {
            StoreError::Authentication(_) => {
                error!(backend = %backend.kind(), what, error = %err, "stored data failed authentication")
            }
            _ => warn!(backend = %backend.kind(), what, error = %err, "read failed, falling through"),
        }
    }

    fn read_setting(&self, key: &str) -> Option<Value> {
        for backend in &self.chain {
            match Self::load_settings(backend) {
                Ok(Some(record)) => match record.get(key) {
                    Some(value) => match model::validate_setting(key, value) {
                        Ok(()) => return Some(value.clone()),
                        Err(e) => {
                            warn!(backend = %backend.kind(), key, error = %e, "dropping invalid setting")
                        }
                    },
                    None => continue,
                },
                Ok(None) => continue,
                Err(e) => Self::log_read_failure(backend, "settings", &e),
            }
        }
        None
    }

    fn read_settings_record(&self) -> SettingsRecord {
        for backend in &self.chain {
            match Self::load_settings(backend) {
                Ok(Some(mut record)) => {
                    let invalid: Vec<String> = record
                        .0
                        .iter()
                        .filter(|(k, v)| model::validate_setting(k, v).is_err())
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in invalid {
                        warn!(backend = %backend.kind(), key = %key, "dropping invalid setting");
                        record.remove(&key);
                    }
                    return record;
                }
                Ok(None) => continue,
                Err(e) => Self::log_read_failure(backend, "settings", &e),
            }
        }
        SettingsRecord::default()
    }

    // Read-modify-write the settings record in one backend. `mutate` returns
    // whether anything changed; unchanged records are not rewritten.
    fn apply_settings(
        backend: &Backend,
        mutate: &dyn Fn(&mut SettingsRecord) -> bool,
        create: bool,
    ) -> crate::Result<()> {
        let mut record = match Self::load_settings(backend) {
            Ok(Some(record)) => record,
            Ok(None) if !create => return Ok(()),
            Ok(None) => SettingsRecord::default(),
            Err(e) if e.is_miss() => {
                warn!(backend = %backend.kind(), error = %e, "replacing unreadable settings record");
                SettingsRecord::default()
            }
            Err(e) => return Err(e),
        };
        if mutate(&mut record) {
            backend.write(&paths::settings_slot(), &serde_json::to_vec(&record)?)?;
        }
        Ok(())
    }

    fn write_settings(&self, mutate: &dyn Fn(&mut SettingsRecord) -> bool) -> crate::Result<()> {
        let primary = self.primary();
        let result = Self::apply_settings(primary, mutate, true);
        if let Some(mirror) = self.mirror() {
            // Credentials never land on disk outside the encrypted backend.
            let scrub = mirror.writes_cleartext_to_disk();
            let mirrored = |record: &mut SettingsRecord| {
                let mut changed = mutate(record);
                if scrub {
                    for key in model::fields::CREDENTIALS {
                        changed |= record.remove(key).is_some();
                    }
                }
                changed
            };
            if let Err(e) = Self::apply_settings(mirror, &mirrored, true) {
                warn!(backend = %mirror.kind(), error = %e, "settings mirror write failed");
            }
        }
        result.map_err(|e| primary_failure(primary, e))
    }

    fn append(&self, id: &str, message: &Message) -> crate::Result<AppendOutcome> {
        let primary = self.primary();
        let result = self.rotation.append_record(primary, id, message);
        if let Some(mirror) = self.mirror() {
            if let Err(e) = self.rotation.append_record(mirror, id, message) {
                warn!(backend = %mirror.kind(), conversation = id, error = %e, "log mirror append failed");
            }
        }
        result.map_err(|e| primary_failure(primary, e))
    }

    fn list_conversations(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for backend in &self.chain {
            match backend.children(paths::CONVERSATIONS_DIR) {
                Ok(children) => ids.extend(
                    children
                        .into_iter()
                        .filter(|id| paths::validate_conversation_id(id).is_ok()),
                ),
                Err(e) => Self::log_read_failure(backend, "conversation list", &e),
            }
        }
        ids.into_iter().collect()
    }

    fn read_conversation(&self, id: &str) -> Option<Conversation> {
        for backend in &self.chain {
            match RotationManager::read_log(backend, id) {
                Ok(Some(conversation)) => return Some(conversation),
                Ok(None) => continue,
                Err(e) => Self::log_read_failure(backend, "conversation", &e),
            }
        }
        None
    }

    fn clear(&self, target: &ClearTarget) -> crate::Result<()> {
        let mut first_error = None;
        for backend in &self.chain {
            let result = match target {
                ClearTarget::Setting(key) => Self::apply_settings(
                    backend,
                    &|record: &mut SettingsRecord| record.remove(key).is_some(),
                    false,
                ),
                ClearTarget::Conversation(id) => backend
                    .remove_dir(&paths::conversation_dir(id))
                    .map(|removed| {
                        if removed {
                            info!(backend = %backend.kind(), conversation = %id, "conversation cleared");
                        }
                    }),
            };
            if let Err(e) = result {
                warn!(backend = %backend.kind(), ?target, error = %e, "clear failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn primary_failure(backend: &Backend, err: StoreError) -> StoreError {
    match err {
        StoreError::Validation(_) | StoreError::FatalStorage(_) => err,
        other => StoreError::FatalStorage(format!("{} backend: {}", backend.kind(), other)),
    }
}
