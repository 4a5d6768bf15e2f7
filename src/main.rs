use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use color_eyre::eyre::bail;
use storefront_downloader::{
    DownloadEvent, DownloadManager, DownloadState, DownloaderConfig, EventReceiver, ipc,
};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[clap(name = "sfdl", version, about = "Storefront download manager")]
struct Cli {
    #[clap(flatten)]
    downloader: DownloaderConfig,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a single file, Ctrl-C cancels and removes the partial file
    Get {
        url: String,
        dest: PathBuf,
        /// Job id, a fresh ULID when omitted
        #[clap(long)]
        id: Option<String>,
    },
    /// Answer JSON-lines requests on stdin, write responses and events to stdout
    Serve,
}

async fn get(
    manager: &DownloadManager,
    events: &mut EventReceiver,
    url: String,
    dest: PathBuf,
    id: Option<String>,
) -> color_eyre::Result<()> {
    let id = id.unwrap_or_else(|| Ulid::new().to_string());
    tracing::info!(id = %id, url = %url, path = ?dest, "Queueing download");
    manager.start(&id, url, &dest);

    let mut last_render: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if manager.cancel(&id).is_accepted() {
                    tracing::info!("Interrupted, cancelling download");
                } else {
                    tracing::debug!("Interrupted, nothing left to cancel");
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("Download manager stopped unexpectedly");
                };
                if event.id() != id {
                    continue;
                }
                match event {
                    DownloadEvent::Progress(progress) => {
                        if last_render.is_some_and(|at| at.elapsed() < PROGRESS_INTERVAL) {
                            continue;
                        }
                        last_render = Some(Instant::now());
                        if progress.total_bytes > 0 {
                            eprint!(
                                "\r{} / {} ({:.1}%)   ",
                                ByteSize::b(progress.bytes_downloaded),
                                ByteSize::b(progress.total_bytes),
                                progress.fraction * 100.0
                            );
                        } else {
                            eprint!("\r{}   ", ByteSize::b(progress.bytes_downloaded));
                        }
                    }
                    DownloadEvent::Status(status) => match status.state {
                        DownloadState::Completed => {
                            eprintln!();
                            let size = manager.job(&id).map(|job| job.bytes_downloaded).unwrap_or(0);
                            tracing::info!(path = ?dest, size = %ByteSize::b(size), "Download complete");
                            return Ok(());
                        }
                        DownloadState::Failed => {
                            eprintln!();
                            bail!(
                                "Download failed: {}",
                                status.error_detail.unwrap_or_else(|| "unknown error".to_string())
                            );
                        }
                        DownloadState::Cancelled => {
                            eprintln!();
                            manager.wait_for_cleanup().await;
                            bail!("Download cancelled");
                        }
                        state => tracing::debug!(state = %state, "Download state changed"),
                    },
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    // stdout carries the IPC protocol, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    color_eyre::install()?;

    let cli = Cli::parse();
    let (manager, mut events) = DownloadManager::new(&cli.downloader)?;

    match cli.command {
        Command::Get { url, dest, id } => get(&manager, &mut events, url, dest, id).await?,
        Command::Serve => {
            tracing::info!("Serving download requests on stdin");
            ipc::serve(
                &manager,
                &mut events,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await?;
        }
    }

    Ok(())
}
