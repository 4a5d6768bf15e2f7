//! Module for downloading files from HTTP sources
//!
//! This module provides the download manager used by the desktop shell: it keeps
//! one job per caller-supplied id, streams each job's bytes to its destination
//! file, and supports pause/resume through HTTP range requests and cancellation
//! with cleanup of the partial file.

mod error;
mod http;
mod manager;
mod models;

// Re-export the public API
pub use error::{DownloadError, Result};
pub use manager::{DownloadManager, EventReceiver};
pub use models::{
    Ack, DownloadEvent, DownloadJob, DownloadState, DownloadStats, ProgressEvent, StatusEvent,
};
