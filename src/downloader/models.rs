//! Data structures for the download manager
//!
//! This file contains the job record, its lifecycle states and the events the
//! manager publishes to whatever UI is listening.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Lifecycle state of a download job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// Job row exists but no transfer has been issued yet
    #[default]
    Pending,
    /// A transfer is streaming bytes to the destination
    Downloading,
    /// Transfer aborted, waiting for `resume`
    Paused,
    /// Stream ended cleanly
    Completed,
    /// Transport, HTTP or file error
    Failed,
    /// Cancelled by the caller, entry removed
    Cancelled,
}

impl DownloadState {
    /// Completed, Failed and Cancelled accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Paused => write!(f, "Paused"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Snapshot of one transfer as tracked by the manager.
///
/// The live transfer task is held next to this record inside the manager, never
/// in it, so snapshots can be cloned out to callers freely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    /// Running total across every pause/resume cycle
    pub bytes_downloaded: u64,
    /// Declared length of the full resource, 0 when the server did not say
    pub total_bytes: u64,
    pub state: DownloadState,
    /// Offset requested with `Range` on the next resume
    pub resume_offset: Option<u64>,
}

impl DownloadJob {
    pub fn new<P: AsRef<Path>>(id: impl Into<String>, url: impl Into<String>, destination: P) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            destination: destination.as_ref().to_path_buf(),
            bytes_downloaded: 0,
            total_bytes: 0,
            state: DownloadState::Pending,
            resume_offset: None,
        }
    }

    /// Fraction of the resource on disk, 0.0 when the total is unknown
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_downloaded as f64 / self.total_bytes as f64
        }
    }

    pub(crate) fn progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            id: self.id.clone(),
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.total_bytes,
            fraction: self.fraction(),
        }
    }

    pub(crate) fn status_event(&self, error_detail: Option<String>) -> StatusEvent {
        StatusEvent {
            id: self.id.clone(),
            state: self.state,
            error_detail,
        }
    }
}

/// Emitted for every chunk written while a job is downloading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub id: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub fraction: f64,
}

/// Emitted for every state transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub id: String,
    pub state: DownloadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "channel")]
pub enum DownloadEvent {
    #[serde(rename = "download:progress")]
    Progress(ProgressEvent),
    #[serde(rename = "download:status")]
    Status(StatusEvent),
}

impl DownloadEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Progress(progress) => &progress.id,
            Self::Status(status) => &status.id,
        }
    }
}

/// Immediate answer to a control call. The eventual outcome arrives as events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Ack {
    Accepted,
    NotApplicable,
}

impl Ack {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Per-state job counts
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadStats {
    pub total: usize,
    pub pending: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

impl DownloadStats {
    pub(crate) fn record(&mut self, state: DownloadState) {
        match state {
            DownloadState::Pending => self.pending += 1,
            DownloadState::Downloading => self.downloading += 1,
            DownloadState::Paused => self.paused += 1,
            DownloadState::Completed => self.completed += 1,
            DownloadState::Failed => self.failed += 1,
            // cancelled jobs leave the table, nothing to count
            DownloadState::Cancelled => return,
        }
        self.total += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_is_zero_when_total_unknown() {
        let mut job = DownloadJob::new("a", "https://host/file.bin", "/tmp/file.bin");
        job.bytes_downloaded = 400;
        assert_eq!(job.fraction(), 0.0);

        job.total_bytes = 1000;
        assert!((job.fraction() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn terminal_states() {
        assert!(DownloadState::Completed.is_terminal());
        assert!(DownloadState::Failed.is_terminal());
        assert!(DownloadState::Cancelled.is_terminal());
        assert!(!DownloadState::Pending.is_terminal());
        assert!(!DownloadState::Downloading.is_terminal());
        assert!(!DownloadState::Paused.is_terminal());
    }

    #[test]
    fn events_serialize_on_ui_channels() {
        let event = DownloadEvent::Progress(ProgressEvent {
            id: "a".into(),
            bytes_downloaded: 400,
            total_bytes: 1000,
            fraction: 0.4,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["channel"], "download:progress");
        assert_eq!(json["bytesDownloaded"], 400);
        assert_eq!(json["totalBytes"], 1000);

        let status = DownloadEvent::Status(StatusEvent {
            id: "a".into(),
            state: DownloadState::Completed,
            error_detail: None,
        });
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["channel"], "download:status");
        assert_eq!(json["state"], "completed");
        assert!(json.get("errorDetail").is_none());
    }

    #[test]
    fn events_and_acks_expose_their_essentials() {
        let job = DownloadJob::new("game-42", "https://host/file.bin", "/tmp/file.bin");
        assert_eq!(DownloadEvent::Progress(job.progress_event()).id(), "game-42");
        assert_eq!(DownloadEvent::Status(job.status_event(None)).id(), "game-42");

        assert!(Ack::Accepted.is_accepted());
        assert!(!Ack::NotApplicable.is_accepted());
    }

    #[test]
    fn stats_skip_cancelled() {
        let mut stats = DownloadStats::default();
        stats.record(DownloadState::Downloading);
        stats.record(DownloadState::Failed);
        stats.record(DownloadState::Cancelled);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.downloading, 1);
        assert_eq!(stats.failed, 1);
    }
}
