//! Resumable HTTP download manager for the storefront desktop shell.
//!
//! The shell hands the manager a job id, a URL and a destination path; the
//! manager streams the file, reports progress and state changes as
//! [`DownloadEvent`](downloader::DownloadEvent)s, and supports pausing,
//! resuming with HTTP range requests, and cancelling with cleanup.

pub mod config;
pub mod downloader;
pub mod ipc;

#[cfg(test)]
mod testing;

pub use config::DownloaderConfig;
pub use downloader::{
    Ack, DownloadError, DownloadEvent, DownloadJob, DownloadManager, DownloadState, DownloadStats,
    EventReceiver, ProgressEvent, StatusEvent,
};
