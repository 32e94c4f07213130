//! §7 error taxonomy. Each variant maps to an IPC error code (§6) and a
//! process exit code; the mapping is the single source of truth both the
//! bridge daemon and the CLI boundary consult.

use std::fmt;

#[derive(Debug)]
pub enum McpcError {
    /// Malformed input, unknown method, queue full, lock timeout.
    Client(String),
    /// MCP server returned an error for a valid request.
    Server(String),
    /// Transport failed, reconnection exhausted, IPC disconnect.
    Network(String),
    /// Refresh failed non-retryably, session expired, profile missing.
    Auth(String),
    /// Cannot bind socket, cannot spawn bridge, corrupt registry file.
    Fatal(String),
}

impl McpcError {
    pub fn io(e: std::io::Error) -> Self {
        McpcError::Fatal(e.to_string())
    }

    pub fn code(&self) -> u8 {
        match self {
            McpcError::Client(_) => 1,
            McpcError::Server(_) => 2,
            McpcError::Network(_) => 3,
            McpcError::Auth(_) => 4,
            // Fatal errors are reported to the caller as exit code 1; they
            // never cross the IPC wire because the daemon exits before
            // producing a response for anything but the original caller.
            McpcError::Fatal(_) => 1,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            McpcError::Client(_) => 1,
            McpcError::Server(_) => 2,
            McpcError::Network(_) => 3,
            McpcError::Auth(_) => 4,
            McpcError::Fatal(_) => 1,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            McpcError::Client(m)
            | McpcError::Server(m)
            | McpcError::Network(m)
            | McpcError::Auth(m)
            | McpcError::Fatal(m) => m,
        }
    }

    /// Reconstruct a typed error from a wire error code + message (§6).
    pub fn from_code(code: i64, message: String) -> Self {
        match code {
            1 => McpcError::Client(message),
            2 => McpcError::Server(message),
            3 => McpcError::Network(message),
            4 => McpcError::Auth(message),
            _ => McpcError::Client(message),
        }
    }
}

impl fmt::Display for McpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            McpcError::Client(_) => "client",
            McpcError::Server(_) => "server",
            McpcError::Network(_) => "network",
            McpcError::Auth(_) => "auth",
            McpcError::Fatal(_) => "fatal",
        };
        write!(f, "{kind} error: {}", self.message())
    }
}

impl std::error::Error for McpcError {}

impl From<anyhow::Error> for McpcError {
    fn from(e: anyhow::Error) -> Self {
        McpcError::Client(e.to_string())
    }
}
