use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Suffix of metadata documents (`{file_id}.metadata.json`).
pub const METADATA_SUFFIX: &str = ".metadata.json";

/// Metadata document name for a file ID.
pub fn metadata_file_name(file_id: &str) -> String {
    format!("{}{}", file_id, METADATA_SUFFIX)
}

/// Lifecycle tag recorded with every upload event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Success,
    Uploading,
    Updating,
    Cancelled,
}

impl UploadStatus {
    /// True while an upload or update is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, UploadStatus::Uploading | UploadStatus::Updating)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Success => "success",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Updating => "updating",
            UploadStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a database's append-only upload history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEvent {
    /// Position in history (1-indexed, contiguous).
    pub sequence_id: u64,
    pub datetime: String,
    pub timestamp: i64,
    pub hash: String,
    pub size_bytes: u64,
    pub uploader: String,
    pub hostname: String,
    pub platform: String,
    pub tool_version: String,
    pub upload_duration_sec: f64,
    pub status: UploadStatus,
}

/// Versioned description of a database upload.
///
/// Remote documents carry the full event history; local anchors carry the
/// same fields with an empty history. The top-level fields always mirror the
/// latest event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub hash: String,
    pub timestamp: i64,
    pub size_bytes: u64,
    pub uploader: String,
    pub hostname: String,
    pub platform: String,
    pub tool_version: String,
    pub upload_duration_sec: f64,
    pub datetime: String,
    pub status: UploadStatus,
    #[serde(default)]
    pub events: Vec<MetadataEvent>,
}

impl Metadata {
    /// Build a record stamped with the current time and `identity`.
    pub fn new(
        file_id: &str,
        hash: &str,
        size_bytes: u64,
        identity: &Identity,
        upload_duration_sec: f64,
        status: UploadStatus,
    ) -> Self {
        let now = chrono::Local::now();
        Self {
            file_id: file_id.to_string(),
            hash: hash.to_string(),
            timestamp: now.timestamp(),
            size_bytes,
            uploader: identity.owner.clone(),
            hostname: identity.hostname.clone(),
            platform: identity.platform.clone(),
            tool_version: identity.tool_version.clone(),
            upload_duration_sec,
            datetime: format_datetime(now.timestamp()),
            status,
            events: Vec::new(),
        }
    }

    /// Snapshot the top-level fields as history entry `sequence_id`.
    pub fn to_event(&self, sequence_id: u64) -> MetadataEvent {
        MetadataEvent {
            sequence_id,
            datetime: self.datetime.clone(),
            timestamp: self.timestamp,
            hash: self.hash.clone(),
            size_bytes: self.size_bytes,
            uploader: self.uploader.clone(),
            hostname: self.hostname.clone(),
            platform: self.platform.clone(),
            tool_version: self.tool_version.clone(),
            upload_duration_sec: self.upload_duration_sec,
            status: self.status,
        }
    }

    /// Attach this record's snapshot as the next event after `existing`.
    ///
    /// Without prior history the record becomes event 1; otherwise the
    /// existing events are kept in order and the new event is numbered
    /// `existing.events.len() + 1`.
    pub fn appended_to(mut self, existing: Option<&Metadata>) -> Self {
        let mut events = existing.map(|m| m.events.clone()).unwrap_or_default();
        let next = events.len() as u64 + 1;
        events.push(self.to_event(next));
        self.events = events;
        self
    }

    /// Copy of this record with its history stripped.
    pub fn to_anchor(&self) -> Self {
        Self {
            events: Vec::new(),
            ..self.clone()
        }
    }

    pub fn latest_event(&self) -> Option<&MetadataEvent> {
        self.events.last()
    }
}

/// Metadata records keyed by file ID.
pub type MetadataMap = HashMap<String, Metadata>;

/// Human-readable local date for a Unix timestamp.
pub fn format_datetime(timestamp: i64) -> String {
    use chrono::TimeZone;
    chrono::Local
        .timestamp_opt(timestamp, 0)
        .earliest()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
