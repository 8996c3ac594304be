//! Append-only JSON Lines log of terminal per-video outcomes.
//!
//! The file is read once when the store is opened and then only appended to.
//! Lines written by older tooling (keyed by `yt_id`, status `upload_failed`,
//! naive timestamps) are understood on load; malformed lines are ignored.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Success,
    Failed,
    /// Only produced by older tooling; never written by this crate.
    Skipped,
}

impl HistoryStatus {
    fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            // Legacy success lines carried no status at all.
            None | Some("success") | Some("uploaded") => Some(Self::Success),
            Some("failed") | Some("upload_failed") => Some(Self::Failed),
            Some("skipped") => Some(Self::Skipped),
            Some(_) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One line of the history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub source_id: String,
    pub status: HistoryStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HistoryRecord {
    pub fn success(source_id: impl Into<String>, destination_url: Option<String>) -> Self {
        Self::new(source_id, HistoryStatus::Success, destination_url)
    }

    pub fn failed(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut record = Self::new(source_id, HistoryStatus::Failed, None);
        record.reason = Some(reason.into());
        record
    }

    fn new(
        source_id: impl Into<String>,
        status: HistoryStatus,
        destination_url: Option<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            status,
            timestamp: Utc::now(),
            destination_url,
            source_url: None,
            title: None,
            task_id: None,
            reason: None,
        }
    }
}

/// Loosely parsed view of a history line, tolerant of legacy layouts.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub source_id: String,
    pub status: HistoryStatus,
    pub timestamp: Option<String>,
    pub destination_url: Option<String>,
}

impl HistoryEntry {
    fn from_value(value: &Value) -> Option<Self> {
        let source_id = ["source_id", "yt_id", "id"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|id| !id.is_empty())?
            .to_string();
        let status = HistoryStatus::parse(value.get("status").and_then(Value::as_str))?;
        let timestamp = ["timestamp", "uploaded_at"]
            .iter()
            .find_map(|key| value.get(*key).and_then(Value::as_str))
            .map(str::to_string);
        let destination_url = value
            .get("destination_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            source_id,
            status,
            timestamp,
            destination_url,
        })
    }
}

/// Reads every parseable entry in file order. A missing file has no entries.
pub fn scan_entries(path: &Path) -> Result<Vec<HistoryEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading history {}", path.display()));
        }
    };

    let entries = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|value| HistoryEntry::from_value(&value))
        .collect();
    Ok(entries)
}

/// Durable record of which source videos reached a terminal outcome.
///
/// Not safe to share between processes: two runs appending to the same file
/// concurrently need an external lock.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    index: HashMap<String, HistoryStatus>,
}

impl HistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut index: HashMap<String, HistoryStatus> = HashMap::new();
        for entry in scan_entries(&path)? {
            index
                .entry(entry.source_id)
                .and_modify(|status| {
                    if *status != HistoryStatus::Success {
                        *status = entry.status;
                    }
                })
                .or_insert(entry.status);
        }
        Ok(Self { path, index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff a `success` record exists for the id.
    pub fn has(&self, source_id: &str) -> bool {
        self.index.get(source_id) == Some(&HistoryStatus::Success)
    }

    /// True if any record exists for the id, whatever its status.
    pub fn has_any(&self, source_id: &str) -> bool {
        self.index.contains_key(source_id)
    }

    /// Number of distinct source ids seen.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Appends one line and flushes it to disk before returning.
    ///
    /// A second `success` for an id that already has one is dropped.
    pub fn append(&mut self, record: &HistoryRecord) -> Result<(), PipelineError> {
        if record.status == HistoryStatus::Success && self.has(&record.source_id) {
            warn!(
                source_id = %record.source_id,
                "history already holds a success record; not appending another"
            );
            return Ok(());
        }

        self.write_line(record)
            .map_err(|source| PipelineError::HistoryWrite {
                path: self.path.clone(),
                source,
            })?;

        let status = self
            .index
            .entry(record.source_id.clone())
            .or_insert(record.status);
        if *status != HistoryStatus::Success {
            *status = record.status;
        }
        Ok(())
    }

    fn write_line(&self, record: &HistoryRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
        line.push('\n');

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()
    }
}
