//! C8: CLI-side counterpart to the bridge daemon's per-connection IPC
//! handling. One instance per socket connection; owns the pending-request
//! map and the background task that reads response/notification frames.
//! Grounded on the teacher's `socket_proxy.rs` for the "one reader task
//! feeding a map of oneshot senders" shape, adapted from its HTTP-over-
//! socket proxying to this spec's flat request/response/notification
//! frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::McpcError;
use crate::ipc::{read_message, write_message, AuthCredentials, IpcMessage, Notification};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, McpcError>>>>>;

#[cfg(unix)]
type WriteHalf = tokio::net::unix::OwnedWriteHalf;
#[cfg(unix)]
type ReadHalf = tokio::net::unix::OwnedReadHalf;

#[cfg(windows)]
type WriteHalf = tokio::io::WriteHalf<tokio::net::windows::named_pipe::NamedPipeClient>;
#[cfg(windows)]
type ReadHalf = tokio::io::ReadHalf<tokio::net::windows::named_pipe::NamedPipeClient>;

#[cfg(unix)]
async fn dial(socket_path: &std::path::Path) -> std::io::Result<(ReadHalf, WriteHalf)> {
    let stream = tokio::net::UnixStream::connect(socket_path).await?;
    Ok(stream.into_split())
}

#[cfg(windows)]
async fn dial(socket_path: &std::path::Path) -> std::io::Result<(ReadHalf, WriteHalf)> {
    use tokio::net::windows::named_pipe::ClientOptions;
    let pipe_name = socket_path.to_string_lossy().to_string();
    let client = ClientOptions::new().open(&pipe_name)?;
    Ok(tokio::io::split(client))
}

pub struct BridgeClient {
    writer: Mutex<WriteHalf>,
    pending: PendingMap,
    next_id: std::sync::atomic::AtomicU64,
    reader_task: tokio::task::JoinHandle<()>,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl BridgeClient {
    pub async fn connect(socket_path: &std::path::Path) -> Result<Self, McpcError> {
        let (read_half, write_half) = tokio::time::timeout(CONNECT_TIMEOUT, dial(socket_path))
            .await
            .map_err(|_| McpcError::Network(format!("connect timed out: {}", socket_path.display())))?
            .map_err(|e| McpcError::Network(e.to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();

        let pending_for_reader = pending.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(IpcMessage::Response { id, result, error })) => {
                        if let Some(tx) = pending_for_reader.lock().await.remove(&id) {
                            let outcome = match error {
                                Some(e) => Err(McpcError::from_code(e.code, e.message)),
                                None => Ok(result.unwrap_or(serde_json::Value::Null)),
                            };
                            let _ = tx.send(outcome);
                        }
                    }
                    Ok(Some(IpcMessage::Notification { notification })) => {
                        let _ = notif_tx.send(notification);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
            // Socket closed: fail every still-pending request as a network error.
            for (_, tx) in pending_for_reader.lock().await.drain() {
                let _ = tx.send(Err(McpcError::Network("bridge connection closed".to_string())));
            }
        });

        Ok(Self {
            writer: Mutex::new(write_half),
            pending,
            next_id: std::sync::atomic::AtomicU64::new(0),
            reader_task,
            notifications: notif_rx,
        })
    }

    pub fn notifications(&mut self) -> &mut mpsc::UnboundedReceiver<Notification> {
        &mut self.notifications
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpcError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let msg = IpcMessage::Request { id: id.clone(), method: method.to_string(), params };
        {
            let mut writer = self.writer.lock().await;
            if write_message(&mut *writer, &msg).await.is_err() {
                self.pending.lock().await.remove(&id);
                return Err(McpcError::Network("failed to write request".to_string()));
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpcError::Network("bridge connection closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpcError::Network(format!("request {method} timed out after 180s")))
            }
        }
    }

    pub async fn send_auth_credentials(&self, credentials: AuthCredentials) -> Result<(), McpcError> {
        let msg = IpcMessage::SetAuthCredentials { auth_credentials: credentials };
        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, &msg)
            .await
            .map_err(|e| McpcError::Network(e.to_string()))
    }

    pub async fn close(self) {
        self.reader_task.abort();
        let mut writer = self.writer.into_inner();
        let _ = writer.shutdown().await;
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(McpcError::Network("client closed".to_string())));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::paths::TempPathProvider;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn request_roundtrips_over_unix_socket() {
        let pp = TempPathProvider::new("bridge-client-roundtrip");
        let socket_path = pp.base.join("test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            if let Ok(Some(IpcMessage::Request { id, .. })) = read_message(&mut reader).await {
                let resp = IpcMessage::Response {
                    id,
                    result: Some(serde_json::json!({"ok": true})),
                    error: None,
                };
                write_message(&mut write_half, &resp).await.unwrap();
            }
        });

        let client = BridgeClient::connect(&socket_path).await.unwrap();
        let result = client.request("ping", None).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_response_maps_to_typed_error() {
        let pp = TempPathProvider::new("bridge-client-error");
        let socket_path = pp.base.join("test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            if let Ok(Some(IpcMessage::Request { id, .. })) = read_message(&mut reader).await {
                let resp = IpcMessage::Response {
                    id,
                    result: None,
                    error: Some(crate::ipc::IpcError { code: 4, message: "session expired".to_string() }),
                };
                write_message(&mut write_half, &resp).await.unwrap();
            }
        });

        let client = BridgeClient::connect(&socket_path).await.unwrap();
        let err = client.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpcError::Auth(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_server_fails_pending_request_with_network_error() {
        let pp = TempPathProvider::new("bridge-client-close");
        let socket_path = pp.base.join("test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = BridgeClient::connect(&socket_path).await.unwrap();
        server.await.unwrap();
        let err = client.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpcError::Network(_)));
    }
}
