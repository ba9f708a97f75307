//! Conversation logs with size-bounded segments.
//!
//! A log is an `active` segment plus zero or more `archive-<timestamp>`
//! segments. Appends rewrite the whole active segment so it stays one sealed
//! envelope. When the next record would push the active segment past the
//! threshold, the active segment is first renamed to a new archive and a
//! fresh active segment is started; the record then lands in the new one.
//! Archives are never written or rotated again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::error::StoreError;
use crate::model::{Conversation, Message};
use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogSegment {
    conversation_id: String,
    created_at: DateTime<Utc>,
    records: Vec<Value>,
}

impl LogSegment {
    fn new(conversation_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            created_at,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Segment name the previous active segment was archived under, if a
    /// rotation happened before this append.
    pub archived: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RotationManager {
    threshold: u64,
}

impl RotationManager {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn append_record(
        &self,
        backend: &Backend,
        log_id: &str,
        message: &Message,
    ) -> crate::Result<AppendOutcome> {
        paths::validate_conversation_id(log_id)?;
        let active = paths::active_slot(log_id);
        let mut outcome = AppendOutcome::default();

        let mut segment = match load_segment(backend, &active) {
            Ok(Some(segment)) => segment,
            Ok(None) => LogSegment::new(log_id, Utc::now()),
            Err(e) if e.is_miss() => {
                // Keep the unreadable bytes as an archive instead of overwriting them.
                warn!(backend = %backend.kind(), conversation = log_id, error = %e, "active segment unreadable, moving it aside");
                outcome.archived = Some(self.archive_active(backend, log_id)?);
                LogSegment::new(log_id, Utc::now())
            }
            Err(e) => return Err(e),
        };

        // The threshold bounds the sealed file as stored, not the plaintext.
        let record = serde_json::to_value(message)?;
        segment.records.push(record);
        let mut body = serde_json::to_vec(&segment)?;
        let projected = backend.sealed_len(body.len())?;
        if segment.records.len() > 1 && projected > self.threshold {
            let record = segment.records.pop();
            let archived = self.archive_active(backend, log_id)?;
            info!(
                backend = %backend.kind(),
                conversation = log_id,
                records = segment.records.len(),
                projected_bytes = projected,
                archive = %archived,
                "rotated conversation log"
            );
            outcome.archived = Some(archived);
            segment = LogSegment::new(log_id, segment.created_at);
            segment.records.extend(record);
            body = serde_json::to_vec(&segment)?;
        }

        backend.write(&active, &body)?;
        Ok(outcome)
    }

    fn archive_active(&self, backend: &Backend, log_id: &str) -> crate::Result<String> {
        let existing = backend.children(&paths::conversation_dir(log_id))?;
        let stamp = format!(
            "{}{}",
            paths::ARCHIVE_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
        );
        let mut name = stamp.clone();
        let mut n = 1;
        while existing.contains(&name) {
            name = format!("{}-{:04}", stamp, n);
            n += 1;
        }
        backend.rename(
            &paths::active_slot(log_id),
            &paths::segment_slot(log_id, &name),
        )?;
        Ok(name)
    }

    /// Segment names of a log in read order: archives oldest first, then `active`.
    pub fn segments(backend: &Backend, log_id: &str) -> crate::Result<Vec<String>> {
        paths::validate_conversation_id(log_id)?;
        let children = backend.children(&paths::conversation_dir(log_id))?;
        let mut segments: Vec<String> = children
            .iter()
            .filter(|name| name.starts_with(paths::ARCHIVE_PREFIX))
            .cloned()
            .collect();
        segments.sort();
        if children.iter().any(|name| name == paths::ACTIVE_SEGMENT) {
            segments.push(paths::ACTIVE_SEGMENT.to_string());
        }
        Ok(segments)
    }

    /// Reassemble a whole conversation. Unreadable segments and malformed
    /// records are skipped with a log line; `Ok(None)` if no segment exists.
    pub fn read_log(backend: &Backend, log_id: &str) -> crate::Result<Option<Conversation>> {
        let segments = Self::segments(backend, log_id)?;
        if segments.is_empty() {
            return Ok(None);
        }

        let mut created_at: Option<DateTime<Utc>> = None;
        let mut messages = Vec::new();
        for name in &segments {
            let slot = paths::segment_slot(log_id, name);
            let segment = match load_segment(backend, &slot) {
                Ok(Some(segment)) => segment,
                Ok(None) => continue,
                Err(StoreError::Authentication(reason)) => {
                    error!(backend = %backend.kind(), conversation = log_id, segment = %name, %reason, "segment failed authentication, skipping");
                    continue;
                }
                Err(e) if e.is_miss() => {
                    warn!(backend = %backend.kind(), conversation = log_id, segment = %name, error = %e, "segment unreadable, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            created_at.get_or_insert(segment.created_at);
            for (index, record) in segment.records.iter().enumerate() {
                match Message::from_record(record) {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        warn!(conversation = log_id, segment = %name, index, error = %e, "dropping malformed record")
                    }
                }
            }
        }

        Ok(Some(Conversation {
            id: log_id.to_string(),
            created_at: created_at.unwrap_or_else(Utc::now),
            messages,
        }))
    }
}

fn load_segment(backend: &Backend, slot: &str) -> crate::Result<Option<LogSegment>> {
    let Some(bytes) = backend.read(slot)? else {
        return Ok(None);
    };
    let segment: LogSegment = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Validation(format!("segment {}: {}", slot, e)))?;
    Ok(Some(segment))
}
