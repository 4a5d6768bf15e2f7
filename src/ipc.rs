//! JSON-lines bridge between the desktop shell's UI process and the download manager.
//!
//! Requests arrive one JSON object per line:
//!
//! ```text
//! {"cmd":"start","id":"game-42","url":"https://cdn.example.com/game.zip","savePath":"/games/game.zip"}
//! {"cmd":"pause","id":"game-42"}
//! {"cmd":"list"}
//! ```
//!
//! Every request gets exactly one response line. Download events are written to
//! the same output as they happen, tagged with their `channel`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::downloader::{Ack, DownloadJob, DownloadManager, DownloadStats, EventReceiver};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum IpcRequest {
    Start {
        id: String,
        url: String,
        #[serde(rename = "savePath")]
        save_path: PathBuf,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    Cancel {
        id: String,
    },
    List,
    Stats,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IpcResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<Ack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<DownloadJob>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<DownloadStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn ack(ack: Ack) -> Self {
        Self {
            success: true,
            ack: Some(ack),
            ..Default::default()
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

pub fn dispatch(manager: &DownloadManager, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::Start { id, url, save_path } => {
            IpcResponse::ack(manager.start(id, url, save_path))
        }
        IpcRequest::Pause { id } => IpcResponse::ack(manager.pause(&id)),
        IpcRequest::Resume { id } => IpcResponse::ack(manager.resume(&id)),
        IpcRequest::Cancel { id } => IpcResponse::ack(manager.cancel(&id)),
        IpcRequest::List => IpcResponse {
            success: true,
            jobs: Some(manager.jobs()),
            ..Default::default()
        },
        IpcRequest::Stats => IpcResponse {
            success: true,
            stats: Some(manager.stats()),
            ..Default::default()
        },
    }
}

/// Parse and run one request line. Malformed input is answered, never fatal.
pub fn handle_line(manager: &DownloadManager, line: &str) -> IpcResponse {
    match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => {
            debug!(request = ?request, "IPC request");
            dispatch(manager, request)
        }
        Err(e) => {
            warn!(error = %e, "Malformed IPC request");
            IpcResponse::error(format!("Malformed request: {e}"))
        }
    }
}

/// Serve requests from `input` until it closes, interleaving download events
/// into `output`.
pub async fn serve<R, W>(
    manager: &DownloadManager,
    events: &mut EventReceiver,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        tokio::select! {
            // requests before events
            biased;
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("IPC input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(manager, &line);
                write_line(&mut output, &response).await?;
            }
            Some(event) = events.recv() => {
                trace!(id = event.id(), "Forwarding download event");
                write_line(&mut output, &event).await?;
            }
        }
    }
    output.flush().await
}

async fn write_line<W, T>(output: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloaderConfig;
    use crate::downloader::DownloadEvent;

    fn manager() -> (DownloadManager, EventReceiver) {
        DownloadManager::new(&DownloaderConfig::default()).unwrap()
    }

    #[test]
    fn parses_start_request() {
        let request: IpcRequest = serde_json::from_str(
            r#"{"cmd":"start","id":"a","url":"https://host/file.bin","savePath":"/tmp/file.bin"}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            IpcRequest::Start {
                id: "a".into(),
                url: "https://host/file.bin".into(),
                save_path: PathBuf::from("/tmp/file.bin"),
            }
        );
    }

    #[tokio::test]
    async fn control_calls_on_unknown_ids_still_succeed() {
        let (manager, _events) = manager();
        let response = handle_line(&manager, r#"{"cmd":"pause","id":"x"}"#);
        assert!(response.success);
        assert_eq!(response.ack, Some(Ack::NotApplicable));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ack"], "notApplicable");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn malformed_lines_are_reported() {
        let (manager, _events) = manager();
        let response = handle_line(&manager, r#"{"cmd":"explode"}"#);
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Malformed request"));

        let response = handle_line(&manager, "not json");
        assert!(!response.success);
    }

    #[tokio::test]
    async fn serve_answers_every_line() {
        let (manager, mut events) = manager();
        let input = b"{\"cmd\":\"stats\"}\n\n{\"cmd\":\"list\"}\n{\"cmd\":\"resume\",\"id\":\"x\"}\n";
        let mut output = Vec::new();

        serve(&manager, &mut events, &input[..], &mut output)
            .await
            .unwrap();

        let lines: Vec<serde_json::Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["stats"]["total"], 0);
        assert_eq!(lines[1]["jobs"], serde_json::json!([]));
        assert_eq!(lines[2]["ack"], "notApplicable");
    }

    #[tokio::test]
    async fn serve_forwards_download_events() {
        let (manager, mut events) = manager();
        let dir = tempfile::tempdir().unwrap();
        manager.start("a", "ftp://host/a.bin", dir.path().join("a.bin"));

        // input stays open, so serve only ever sees the queued event
        let (input, _keep_open) = tokio::io::duplex(64);
        let mut output = Vec::new();
        let served = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            serve(
                &manager,
                &mut events,
                tokio::io::BufReader::new(input),
                &mut output,
            ),
        )
        .await;
        assert!(served.is_err(), "serve returned while input was open");

        let event: serde_json::Value =
            serde_json::from_str(String::from_utf8(output).unwrap().trim()).unwrap();
        assert_eq!(event["channel"], "download:status");
        assert_eq!(event["id"], "a");
        assert_eq!(event["state"], "failed");
        assert_eq!(event["errorDetail"], "Unsupported URL scheme: ftp");

        let typed: DownloadEvent = serde_json::from_value(event).unwrap();
        assert_eq!(typed.id(), "a");
    }
}
