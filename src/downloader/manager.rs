//! Download job table and control operations
//!
//! All job mutation goes through [`DownloadManager`]'s control calls or through the
//! callbacks its transfer tasks make into [`Shared`]. Each transfer carries a
//! generation number, and a callback only touches the job while that generation
//! is the one registered on the job, so an aborted transfer can never move a job
//! it no longer owns.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use reqwest::{Client, Url};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, trace, warn};

use super::error::{DownloadError, Result};
use super::http::Transfer;
use super::models::{Ack, DownloadEvent, DownloadJob, DownloadState, DownloadStats};
use crate::config::DownloaderConfig;

/// Receiving side of the manager's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<DownloadEvent>;

/// The live transfer of a downloading job
struct TransferHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TransferHandle {
    /// Stop the transfer. The returned task must finish before anyone else
    /// touches the destination file.
    fn abort(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.task
    }
}

struct JobEntry {
    job: DownloadJob,
    /// Present iff the job is downloading
    transfer: Option<TransferHandle>,
    /// Task of an aborted transfer that may still be flushing to the file
    settling: Option<JoinHandle<()>>,
}

impl JobEntry {
    fn wind_down(self) -> Option<JoinHandle<()>> {
        self.transfer.map(TransferHandle::abort).or(self.settling)
    }
}

/// State shared between the manager and its transfer tasks
pub(crate) struct Shared {
    jobs: Mutex<HashMap<String, JobEntry>>,
    events: mpsc::UnboundedSender<DownloadEvent>,
    next_generation: AtomicU64,
    cleanups: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        // a panic while holding the lock leaves the table itself intact
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DownloadEvent) {
        // nobody listening is not an error
        let _ = self.events.send(event);
    }

    fn emit_status(&self, job: &DownloadJob, error_detail: Option<String>) {
        self.emit(DownloadEvent::Status(job.status_event(error_detail)));
    }

    /// Run `f` on the job if `generation` is still its live transfer
    fn with_current<R>(
        &self,
        id: &str,
        generation: u64,
        f: impl FnOnce(&mut JobEntry) -> R,
    ) -> Option<R> {
        let mut jobs = self.table();
        let entry = jobs.get_mut(id)?;
        let owned = entry
            .transfer
            .as_ref()
            .is_some_and(|transfer| transfer.generation == generation);
        if !owned {
            trace!(id, generation, "Ignoring callback from superseded transfer");
            return None;
        }
        Some(f(entry))
    }

    /// Capture the declared length of a fresh transfer
    pub(crate) fn record_total(&self, id: &str, generation: u64, total_bytes: u64) -> bool {
        self.with_current(id, generation, |entry| {
            entry.job.total_bytes = total_bytes;
        })
        .is_some()
    }

    /// Count a chunk that has been written to the destination
    pub(crate) fn record_chunk(&self, id: &str, generation: u64, len: u64) -> bool {
        self.with_current(id, generation, |entry| {
            entry.job.bytes_downloaded += len;
            self.emit(DownloadEvent::Progress(entry.job.progress_event()));
        })
        .is_some()
    }

    /// Move the job to its terminal state once the stream is over
    pub(crate) fn finish(&self, id: &str, generation: u64, outcome: Result<()>) -> bool {
        self.with_current(id, generation, |entry| {
            // dropping our own handle just detaches the task that is calling us
            entry.transfer = None;
            match outcome {
                Ok(()) => {
                    entry.job.state = DownloadState::Completed;
                    info!(id, bytes = entry.job.bytes_downloaded, "Download completed");
                    self.emit_status(&entry.job, None);
                }
                Err(e) => {
                    entry.job.state = DownloadState::Failed;
                    warn!(id, error = %e, "Download failed");
                    self.emit_status(&entry.job, Some(e.to_string()));
                }
            }
        })
        .is_some()
    }

    fn track_cleanup(&self, task: JoinHandle<()>) {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(PoisonError::into_inner);
        cleanups.retain(|handle| !handle.is_finished());
        cleanups.push(task);
    }
}

/// Owns every download job of the process.
///
/// Cloning is cheap and every clone drives the same job table. The control calls
/// never wait on I/O, but they spawn onto the ambient tokio runtime and so must
/// be called from within one.
#[derive(Clone)]
pub struct DownloadManager {
    client: Client,
    shared: Arc<Shared>,
}

impl DownloadManager {
    pub fn new(config: &DownloaderConfig) -> Result<(Self, EventReceiver)> {
        let client = config.build_client()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            jobs: Mutex::new(HashMap::new()),
            events,
            next_generation: AtomicU64::new(1),
            cleanups: Mutex::new(Vec::new()),
        });
        (Self { client, shared }, receiver)
    }

    /// Start downloading `url` into `destination` under `id`.
    ///
    /// Always accepted. An existing job with the same id is aborted and replaced
    /// by a fresh one; its partial file is not removed, the new transfer
    /// truncates the destination anyway.
    pub fn start(
        &self,
        id: impl Into<String>,
        url: impl Into<String>,
        destination: impl AsRef<Path>,
    ) -> Ack {
        let id = id.into();
        let url = url.into();
        let mut job = DownloadJob::new(id.clone(), url.clone(), destination);

        let mut jobs = self.shared.table();
        let previous = jobs.remove(&id).and_then(|old| {
            info!(id = %id, state = %old.job.state, "Replacing existing download job");
            old.wind_down()
        });

        let url = match parse_download_url(&url) {
            Ok(url) => url,
            Err(e) => {
                warn!(id = %id, error = %e, "Rejecting download");
                job.state = DownloadState::Failed;
                self.shared.emit_status(&job, Some(e.to_string()));
                jobs.insert(
                    id,
                    JobEntry {
                        job,
                        transfer: None,
                        settling: previous,
                    },
                );
                return Ack::Accepted;
            }
        };

        info!(id = %id, url = %url, path = ?job.destination, "Starting download");
        let transfer = self.spawn_transfer(&job, url, None, previous);
        job.state = DownloadState::Downloading;
        self.shared.emit_status(&job, None);
        jobs.insert(
            id,
            JobEntry {
                job,
                transfer: Some(transfer),
                settling: None,
            },
        );
        Ack::Accepted
    }

    /// Abort the live transfer of a downloading job and remember where to resume
    pub fn pause(&self, id: &str) -> Ack {
        let mut jobs = self.shared.table();
        let Some(entry) = jobs.get_mut(id) else {
            debug!(id, "Pause ignored, unknown job");
            return Ack::NotApplicable;
        };
        if entry.job.state != DownloadState::Downloading {
            debug!(id, state = %entry.job.state, "Pause ignored");
            return Ack::NotApplicable;
        }
        let Some(transfer) = entry.transfer.take() else {
            return Ack::NotApplicable;
        };

        entry.settling = Some(transfer.abort());
        entry.job.state = DownloadState::Paused;
        entry.job.resume_offset = Some(entry.job.bytes_downloaded);
        info!(id, resume_offset = entry.job.bytes_downloaded, "Download paused");
        self.shared.emit_status(&entry.job, None);
        Ack::Accepted
    }

    /// Continue a paused job with a range request from its resume offset
    pub fn resume(&self, id: &str) -> Ack {
        let mut jobs = self.shared.table();
        let Some(entry) = jobs.get_mut(id) else {
            debug!(id, "Resume ignored, unknown job");
            return Ack::NotApplicable;
        };
        if entry.job.state != DownloadState::Paused {
            debug!(id, state = %entry.job.state, "Resume ignored");
            return Ack::NotApplicable;
        }
        // the url was validated when the job started
        let Ok(url) = parse_download_url(&entry.job.url) else {
            return Ack::NotApplicable;
        };

        let offset = entry.job.resume_offset.unwrap_or(entry.job.bytes_downloaded);
        let previous = entry.settling.take();
        let transfer = self.spawn_transfer(&entry.job, url, Some(offset), previous);
        entry.transfer = Some(transfer);
        entry.job.state = DownloadState::Downloading;
        info!(id, resume_offset = offset, "Download resumed");
        self.shared.emit_status(&entry.job, None);
        Ack::Accepted
    }

    /// Abort a non-terminal job, forget it and delete its partial file in the background
    pub fn cancel(&self, id: &str) -> Ack {
        let mut jobs = self.shared.table();
        match jobs.get(id) {
            Some(entry) if !entry.job.state.is_terminal() => {}
            Some(entry) => {
                debug!(id, state = %entry.job.state, "Cancel ignored");
                return Ack::NotApplicable;
            }
            None => {
                debug!(id, "Cancel ignored, unknown job");
                return Ack::NotApplicable;
            }
        }
        let Some(entry) = jobs.remove(id) else {
            return Ack::NotApplicable;
        };

        let JobEntry {
            mut job,
            transfer,
            settling,
        } = entry;
        let previous = transfer.map(TransferHandle::abort).or(settling);
        job.state = DownloadState::Cancelled;
        info!(id, bytes = job.bytes_downloaded, "Download cancelled");
        self.shared
            .emit_status(&job, Some("Download cancelled".to_string()));
        drop(jobs);

        let cleanup = tokio::spawn(remove_partial_file(job.destination, previous));
        self.shared.track_cleanup(cleanup);
        Ack::Accepted
    }

    /// Snapshot of one job
    pub fn job(&self, id: &str) -> Option<DownloadJob> {
        self.shared.table().get(id).map(|entry| entry.job.clone())
    }

    /// Snapshots of every job in the table, ordered by id
    pub fn jobs(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<_> = self
            .shared
            .table()
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn stats(&self) -> DownloadStats {
        let mut stats = DownloadStats::default();
        for entry in self.shared.table().values() {
            stats.record(entry.job.state);
        }
        stats
    }

    /// Drop completed and failed jobs from the table, leaving their files alone.
    /// Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut jobs = self.shared.table();
        let before = jobs.len();
        jobs.retain(|_, entry| !entry.job.state.is_terminal());
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, "Removed finished downloads");
        }
        removed
    }

    /// Wait until every partial-file deletion started by `cancel` has finished
    pub async fn wait_for_cleanup(&self) {
        let pending = {
            let mut cleanups = self
                .shared
                .cleanups
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *cleanups)
        };
        for task in pending {
            let _ = task.await;
        }
    }

    fn spawn_transfer(
        &self,
        job: &DownloadJob,
        url: Url,
        resume_from: Option<u64>,
        previous: Option<JoinHandle<()>>,
    ) -> TransferHandle {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let transfer = Transfer {
            id: job.id.clone(),
            url,
            destination: job.destination.clone(),
            generation,
            // nothing to skip, so a plain request will do
            resume_from: resume_from.filter(|offset| *offset > 0),
            previous,
            cancel: cancel.clone(),
        };

        let span = debug_span!("transfer", id = %job.id, generation);
        let task = tokio::spawn(
            transfer
                .run(self.client.clone(), Arc::clone(&self.shared))
                .instrument(span),
        );

        TransferHandle {
            generation,
            cancel,
            task,
        }
    }
}

fn parse_download_url(url: &str) -> Result<Url> {
    let url = Url::parse(url)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(DownloadError::UnsupportedScheme(other.to_string())),
    }
}

async fn remove_partial_file(path: PathBuf, previous: Option<JoinHandle<()>>) {
    if let Some(task) = previous {
        // the aborted transfer flushes before it exits
        let _ = task.await;
    }
    discard_file(&path).await;
}

/// Best-effort delete, failures are logged and swallowed
async fn discard_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = ?path, "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!(path = ?path, "No partial download to remove");
        }
        Err(e) => warn!(error = %e, path = ?path, "Failed to remove partial download"),
    }
}
