//! Download task records.
//!
//! One task per set id while active; terminal states are final and a retry
//! requires a fresh enqueue once the previous task has finished.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task state machine: `queued → running → {completed, failed, skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Terminal states are final; the id may be enqueued again afterwards.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Active tasks block re-enqueueing of the same id.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

/// Caller-supplied metadata seed for an enqueued set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataHint {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub artist_unicode: Option<String>,
    pub title_unicode: Option<String>,
}

/// One download task. Mutated by exactly one worker; snapshots of the whole
/// struct are what `status()` and the event bus expose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub set_id: u64,
    pub url: String,
    pub status: TaskStatus,
    pub message: String,
    pub archive_path: Option<PathBuf>,
    pub display_name: Option<String>,
    pub bytes_downloaded: u64,
    /// Unknown for transfers without a declared content length.
    pub total_bytes: Option<u64>,
    /// In `[0, 1)` while running (unknown-length transfers stay `None`);
    /// reaches 1.0 only at a terminal state.
    pub progress: Option<f64>,
    /// Exponentially smoothed transfer rate, bytes per second.
    pub speed_bps: Option<f64>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub artist_unicode: Option<String>,
    pub title_unicode: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    pub fn new(set_id: u64, url: String) -> Self {
        Self {
            set_id,
            url,
            status: TaskStatus::Queued,
            message: String::new(),
            archive_path: None,
            display_name: None,
            bytes_downloaded: 0,
            total_bytes: None,
            progress: Some(0.0),
            speed_bps: None,
            artist: None,
            title: None,
            artist_unicode: None,
            title_unicode: None,
            created_at: Utc::now(),
            started_at: None,
            updated_at: None,
        }
    }

    /// Seed provisional metadata from a caller hint.
    pub fn apply_hint(&mut self, hint: &MetadataHint) {
        self.artist = hint.artist.clone();
        self.title = hint.title.clone();
        self.artist_unicode = hint.artist_unicode.clone();
        self.title_unicode = hint.title_unicode.clone();
    }
}

/// Three-bucket snapshot of the task table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued: Vec<DownloadTask>,
    pub running: Vec<DownloadTask>,
    pub done: Vec<DownloadTask>,
}
