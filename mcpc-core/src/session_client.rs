//! C10: the CLI-facing facade. Each one-shot operation ensures the bridge is
//! healthy, opens a connection, issues exactly one request, and closes; a
//! sustained caller (`mcpc session shell`) keeps one connection open for the
//! duration instead. Grounded on the teacher's `ensure_rmcp_client` as the
//! "resolve-then-use" shape, but resolving a bridge process instead of an
//! in-process `rmcp` service.

use std::path::PathBuf;

use crate::bridge_client::BridgeClient;
use crate::bridge_manager::{self, StartedBridge};
use crate::error::McpcError;
use crate::keychain::KeychainStore;
use crate::paths::PathProvider;
use crate::registry::{self, SessionRecord};

pub struct SessionClient<'a> {
    pp: &'a dyn PathProvider,
    keychain: &'a dyn KeychainStore,
    bridge_executable: PathBuf,
}

impl<'a> SessionClient<'a> {
    pub fn new(pp: &'a dyn PathProvider, keychain: &'a dyn KeychainStore, bridge_executable: PathBuf) -> Self {
        Self { pp, keychain, bridge_executable }
    }

    async fn healthy_bridge(&self, name: &str) -> Result<(SessionRecord, StartedBridge), McpcError> {
        let record = registry::get(self.pp, name)?
            .ok_or_else(|| McpcError::Client(format!("no such session: {name}")))?;
        if record.status == registry::SessionStatus::Expired {
            return Err(McpcError::Auth(format!(
                "session {name} has expired; reconnect with `connect`"
            )));
        }
        let started = bridge_manager::ensure_bridge_healthy(
            self.pp,
            self.keychain,
            &self.bridge_executable,
            &record,
        )
        .await?;
        if started.pid != record.pid.unwrap_or(0) {
            registry::update(self.pp, name, |r| r.pid = Some(started.pid))?;
        }
        Ok((record, started))
    }

    /// Runs one MCP method against `name`, opening and closing a dedicated
    /// connection. This is the shape every non-interactive subcommand uses.
    pub async fn call(
        &self,
        name: &str,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpcError> {
        let (_, started) = self.healthy_bridge(name).await?;
        let client = BridgeClient::connect(&started.socket_path).await?;
        let result = client.request(method, params).await;
        client.close().await;
        let result = result?;
        registry::update(self.pp, name, |r| r.last_seen_at = chrono::Utc::now())?;
        Ok(result)
    }

    /// Opens a connection for a sustained caller (interactive shell) and
    /// returns it to the caller to reuse for the session's duration.
    pub async fn open_sustained(&self, name: &str) -> Result<BridgeClient, McpcError> {
        let (_, started) = self.healthy_bridge(name).await?;
        BridgeClient::connect(&started.socket_path).await
    }

    pub async fn close_session(&self, name: &str) -> Result<(), McpcError> {
        let record = registry::get(self.pp, name)?;
        if let Some(record) = record {
            if let Some(pid) = record.pid {
                bridge_manager::stop_bridge(pid).await;
            }
            let socket = record.socket_path(self.pp);
            let _ = std::fs::remove_file(&socket);
            let _ = self.keychain.delete(
                crate::keychain::Namespace::SessionHeaders,
                &crate::keychain::headers_key(name),
            );
        }
        registry::delete(self.pp, name)
    }

    pub async fn stop_bridge_only(&self, name: &str) -> Result<(), McpcError> {
        if let Some(record) = registry::get(self.pp, name)? {
            if let Some(pid) = record.pid {
                bridge_manager::stop_bridge(pid).await;
            }
            registry::update(self.pp, name, |r| r.pid = None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychainStore;
    use crate::paths::TempPathProvider;
    use crate::registry::{ServerDescriptor, SessionStatus};

    fn sample_record(name: &str) -> SessionRecord {
        let now = chrono::Utc::now();
        SessionRecord {
            name: name.to_string(),
            server: ServerDescriptor::Http {
                url: "https://mcp.example.com".to_string(),
                headers: None,
                timeout_seconds: None,
            },
            pid: None,
            profile_name: None,
            header_count: 0,
            created_at: now,
            last_seen_at: now,
            status: SessionStatus::Active,
            protocol_version: None,
        }
    }

    #[tokio::test]
    async fn call_against_unknown_session_is_client_error() {
        let pp = TempPathProvider::new("session-client-unknown");
        let keychain = MemoryKeychainStore::new();
        let client = SessionClient::new(&pp, &keychain, PathBuf::from("mcpc-bridge"));
        let err = client.call("@missing", "ping", None).await.unwrap_err();
        assert!(matches!(err, McpcError::Client(_)));
    }

    #[tokio::test]
    async fn call_against_expired_session_is_auth_error() {
        let pp = TempPathProvider::new("session-client-expired");
        let keychain = MemoryKeychainStore::new();
        let mut record = sample_record("@x");
        record.status = SessionStatus::Expired;
        registry::save(&pp, record).unwrap();
        let client = SessionClient::new(&pp, &keychain, PathBuf::from("mcpc-bridge"));
        let err = client.call("@x", "ping", None).await.unwrap_err();
        assert!(matches!(err, McpcError::Auth(_)));
    }

    #[tokio::test]
    async fn close_session_removes_record_and_is_idempotent() {
        let pp = TempPathProvider::new("session-client-close");
        let keychain = MemoryKeychainStore::new();
        registry::save(&pp, sample_record("@x")).unwrap();
        let client = SessionClient::new(&pp, &keychain, PathBuf::from("mcpc-bridge"));
        client.close_session("@x").await.unwrap();
        client.close_session("@x").await.unwrap();
        assert!(registry::get(&pp, "@x").unwrap().is_none());
    }
}
