//! HTTP transfer implementation
//!
//! One [`Transfer`] streams one request's body into the destination file. It
//! reports back to the manager through generation-checked callbacks and stops at
//! the next chunk boundary once its cancellation token fires.

use std::{
    io::SeekFrom,
    path::PathBuf,
    sync::Arc,
};

use futures_util::StreamExt;
use reqwest::{
    Client, Response, StatusCode, Url,
    header::{self, HeaderMap},
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::error::{DownloadError, Result};
use super::manager::Shared;

/// How a transfer stopped when it did not fail
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Finished,
    /// Paused, cancelled or replaced; the job belongs to someone else now
    Superseded,
}

pub(crate) struct Transfer {
    pub id: String,
    pub url: Url,
    pub destination: PathBuf,
    pub generation: u64,
    /// Bytes already on disk that the server should skip
    pub resume_from: Option<u64>,
    /// Aborted transfer of the same job that may still be writing
    pub previous: Option<JoinHandle<()>>,
    pub cancel: CancellationToken,
}

impl Transfer {
    pub(crate) async fn run(mut self, client: Client, shared: Arc<Shared>) {
        if let Some(previous) = self.previous.take() {
            trace!("Waiting for superseded transfer to wind down");
            let _ = previous.await;
        }
        if self.cancel.is_cancelled() {
            trace!("Transfer cancelled before it began");
            return;
        }

        match self.stream(&client, &shared).await {
            Ok(Flow::Finished) => {
                shared.finish(&self.id, self.generation, Ok(()));
            }
            Ok(Flow::Superseded) => {
                debug!("Transfer superseded");
            }
            Err(e) => {
                shared.finish(&self.id, self.generation, Err(e));
            }
        }
    }

    async fn stream(&self, client: &Client, shared: &Shared) -> Result<Flow> {
        let mut file = self.open_destination().await?;
        let flow = self.pump(client, shared, &mut file).await;

        // make sure none of our writes can land after this task is gone
        let flushed = file
            .flush()
            .await
            .map_err(|e| DownloadError::file(&self.destination, e));
        let flow = flow?;
        flushed?;
        Ok(flow)
    }

    /// Truncate for a fresh transfer. When resuming, cut the file back to the
    /// resume offset and write from there: an aborted transfer may have written
    /// a chunk it never got to count. Not opened in append mode, Windows refuses
    /// `set_len` on append-only handles.
    async fn open_destination(&self) -> Result<File> {
        let path = &self.destination;
        let file_err = |e: std::io::Error| DownloadError::file(path, e);

        let Some(offset) = self.resume_from else {
            return File::create(path).await.map_err(file_err);
        };

        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(file_err)?;
        let on_disk = file.metadata().await.map_err(file_err)?.len();
        if on_disk < offset {
            return Err(file_err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("partial file holds {on_disk} bytes, cannot resume at {offset}"),
            )));
        }
        file.set_len(offset).await.map_err(file_err)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(file_err)?;
        Ok(file)
    }

    async fn pump(&self, client: &Client, shared: &Shared, file: &mut File) -> Result<Flow> {
        let mut request = client.get(self.url.clone());
        if let Some(offset) = self.resume_from {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
            info!(resume_from = offset, "Attempting to resume download");
        }

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Flow::Superseded),
            response = request.send() => response?,
        };
        trace!(status = %response.status(), "Got response");

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(DownloadError::Http(status));
        }

        match self.resume_from {
            Some(offset) => check_range(&response, offset)?,
            None => {
                let total = response.content_length().unwrap_or(0);
                if total > 0 {
                    info!(bytes = total, path = ?self.destination, "Starting download");
                } else {
                    info!(path = ?self.destination, "Starting download of unknown size");
                }
                if !shared.record_total(&self.id, self.generation, total) {
                    return Ok(Flow::Superseded);
                }
            }
        }

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Flow::Superseded),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(Flow::Finished);
            };
            let chunk = chunk?;

            // never cancelled halfway, the chunk is either fully on disk or not written
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::file(&self.destination, e))?;
            trace!(chunk_size = chunk.len(), "Received chunk");

            if !shared.record_chunk(&self.id, self.generation, chunk.len() as u64) {
                return Ok(Flow::Superseded);
            }
        }
    }
}

/// A resumed response must be partial content starting where we left off
fn check_range(response: &Response, offset: u64) -> Result<()> {
    let status = response.status();
    if status != StatusCode::PARTIAL_CONTENT {
        return Err(DownloadError::RangeIgnored(status));
    }
    match content_range_start(response.headers()) {
        Some(start) if start != offset => Err(DownloadError::RangeMismatch {
            expected: offset,
            actual: start,
        }),
        _ => Ok(()),
    }
}

/// First byte position of a `Content-Range: bytes <start>-<end>/<total>` header
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}
