//! Errors a transfer can end with.
//!
//! The `Display` text of every variant doubles as the `error_detail` carried by a
//! `Failed` status event, so keep the messages readable for end users.

use std::{io, path::PathBuf};

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    // Connection refused, DNS, TLS and mid-body read failures all land here
    #[error("{0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP Error {}", .0.as_u16())]
    Http(StatusCode),

    #[error("Server ignored the range request (status {}), refusing to append", .0.as_u16())]
    RangeIgnored(StatusCode),

    #[error("Server resumed at byte {actual}, expected byte {expected}")]
    RangeMismatch { expected: u64, actual: u64 },

    #[error("File error on {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl DownloadError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
