use anyhow::Result;
use common::{Command, Response, WallpaperError};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::scheduler::Request;

/// Accept clients on the daemon socket until `shutdown` flips to true
pub async fn start(
    requests: mpsc::UnboundedSender<Request>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    serve(&common::get_socket_path(), requests, shutdown).await
}

pub async fn serve(
    socket_path: &Path,
    requests: mpsc::UnboundedSender<Request>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    // Remove old socket if it exists
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    log::info!("IPC server listening on: {}", socket_path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, requests).await {
                            log::error!("Error handling client: {}", e);
                        }
                    });
                }
                Err(e) => log::error!("Error accepting connection: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Clean up socket
    let _ = std::fs::remove_file(socket_path);
    log::info!("IPC server stopped");
    Ok(())
}

async fn handle_client(stream: UnixStream, requests: mpsc::UnboundedSender<Request>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(command) => handle_command(command, &requests).await,
            Err(e) => {
                log::warn!("Invalid command: {}", e);
                Response::Error(WallpaperError::Ipc(format!("Invalid command: {}", e)))
            }
        };

        // Send response
        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

async fn handle_command(command: Command, requests: &mpsc::UnboundedSender<Request>) -> Response {
    // Liveness checks should not queue behind library work
    if matches!(command, Command::Ping) {
        return Response::Pong;
    }

    let (reply, response) = oneshot::channel();
    if requests.send(Request { command, reply }).is_err() {
        return Response::Error(WallpaperError::Ipc(
            "Daemon is shutting down".to_string(),
        ));
    }

    response.await.unwrap_or_else(|_| {
        Response::Error(WallpaperError::Ipc(
            "Request dropped without a reply".to_string(),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(path: &Path) -> UnixStream {
        for _ in 0..100 {
            if let Ok(stream) = UnixStream::connect(path).await {
                return stream;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("server never came up at {}", path.display());
    }

    async fn roundtrip(stream: &mut UnixStream, line: &str) -> Response {
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }

    #[tokio::test]
    async fn test_commands_are_forwarded_and_answered() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("loopwall.sock");
        let (requests_tx, mut requests) = mpsc::unbounded_channel::<Request>();
        let (shutdown_tx, shutdown) = watch::channel(false);

        let server = tokio::spawn({
            let socket = socket.clone();
            async move { serve(&socket, requests_tx, shutdown).await }
        });

        // Stand-in scheduler answering every request with an empty library
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let response = match request.command {
                    Command::ListLibrary => Response::Library(Vec::new()),
                    _ => Response::Ok,
                };
                let _ = request.reply.send(response);
            }
        });

        let mut stream = connect(&socket).await;
        let ping = serde_json::to_string(&Command::Ping).unwrap();
        assert!(matches!(roundtrip(&mut stream, &ping).await, Response::Pong));

        let list = serde_json::to_string(&Command::ListLibrary).unwrap();
        assert!(matches!(
            roundtrip(&mut stream, &list).await,
            Response::Library(entries) if entries.is_empty()
        ));

        assert!(matches!(
            roundtrip(&mut stream, "{not json").await,
            Response::Error(WallpaperError::Ipc(_))
        ));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_closed_scheduler_reports_shutdown() {
        let (requests_tx, requests) = mpsc::unbounded_channel::<Request>();
        drop(requests);

        let response = handle_command(Command::ListLibrary, &requests_tx).await;
        assert!(matches!(response, Response::Error(WallpaperError::Ipc(_))));
    }
}
