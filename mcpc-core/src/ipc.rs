//! Wire schema between Bridge Daemon (C7) and Bridge Client (C8): a single
//! newline-delimited UTF-8 JSON message per line (§6). Framing is
//! deliberately line-oriented rather than length-prefixed, matching the
//! teacher's own preference for readable line-based IPC over its local
//! HTTP-over-socket proxy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCredentials {
    pub server_url: String,
    pub profile_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IpcMessage {
    Request {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<IpcError>,
    },
    Notification {
        notification: Notification,
    },
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    SetAuthCredentials {
        auth_credentials: AuthCredentials,
    },
}

/// Serializes `msg` as one line (no embedded `\n` is possible: JSON strings
/// escape it) and writes it followed by `\n`.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &IpcMessage,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Reads one line and parses it as an `IpcMessage`. Returns `Ok(None)` at
/// EOF. Blank lines are skipped rather than treated as malformed, since a
/// stray keep-alive newline must not desync the stream.
pub async fn read_message<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<IpcMessage>> {
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            continue;
        }
        let msg = serde_json::from_str(trimmed)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        return Ok(Some(msg));
    }
}

/// Splits a raw byte buffer into `(line, rest)` pairs on `\n`, used by tests
/// that want to prove framing survives arbitrary fragmentation without a
/// real socket.
pub fn split_lines(buf: &[u8]) -> Vec<String> {
    buf.split(|b| *b == b'\n')
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).trim_end_matches('\r').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_roundtrips_through_write_and_read() {
        let msg = IpcMessage::Request {
            id: "1".to_string(),
            method: "tools/list".to_string(),
            params: None,
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        let mut reader = BufReader::new(&buf[..]);
        let parsed = read_message(&mut reader).await.unwrap().unwrap();
        match parsed {
            IpcMessage::Request { id, method, .. } => {
                assert_eq!(id, "1");
                assert_eq!(method, "tools/list");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn framing_survives_arbitrary_fragmentation() {
        let messages = vec![
            IpcMessage::Request { id: "a".to_string(), method: "ping".to_string(), params: None },
            IpcMessage::Shutdown { id: None },
            IpcMessage::Notification {
                notification: Notification { method: "tools/list_changed".to_string(), params: None },
            },
        ];
        let mut buf = Vec::new();
        for m in &messages {
            write_message(&mut buf, m).await.unwrap();
        }

        // Feed the buffer to the reader in arbitrary small chunks.
        let (tx, rx) = tokio::io::duplex(4096);
        let mut tx = tx;
        let chunk_task = tokio::spawn(async move {
            for chunk in buf.chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        let mut reader = BufReader::new(rx);
        let mut parsed = Vec::new();
        for _ in 0..messages.len() {
            parsed.push(read_message(&mut reader).await.unwrap().unwrap());
        }
        chunk_task.await.unwrap();

        assert_eq!(parsed.len(), messages.len());
        assert!(matches!(parsed[0], IpcMessage::Request { .. }));
        assert!(matches!(parsed[1], IpcMessage::Shutdown { .. }));
        assert!(matches!(parsed[2], IpcMessage::Notification { .. }));
    }

    #[test]
    fn set_auth_credentials_serializes_with_kebab_tag() {
        let msg = IpcMessage::SetAuthCredentials {
            auth_credentials: AuthCredentials {
                server_url: "https://mcp.example.com".to_string(),
                profile_name: "default".to_string(),
                refresh_token: Some("rt".to_string()),
                client_id: None,
                headers: None,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"set-auth-credentials\""));
    }
}
