//! C9: spawns the bridge executable as a detached child, waits for it to
//! become ready, and diagnoses/restarts it. Grounded on the teacher's own
//! process lifecycle instincts in `client.rs` (cancellation-token-driven
//! shutdown) generalized from an in-process `rmcp` service to an
//! out-of-process bridge binary, since this spec's architecture runs one
//! OS process per session rather than one task per server inside a single
//! GUI process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::McpcError;
use crate::ipc::AuthCredentials;
use crate::keychain::{tokens_key, KeychainStore, Namespace};
use crate::paths::{pid_is_alive, socket_path, PathProvider};
use crate::registry::ServerDescriptor;

const SOCKET_READY_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(1);

pub struct StartBridgeRequest<'a> {
    pub name: &'a str,
    pub server: &'a ServerDescriptor,
    pub verbose: bool,
    pub profile_name: Option<&'a str>,
    pub headers: Option<&'a HashMap<String, String>>,
}

pub struct StartedBridge {
    pub pid: u32,
    pub socket_path: PathBuf,
}

/// Strips any HTTP headers from the descriptor before it is serialized onto
/// a child process's argv; secrets never appear in a ps listing.
fn sanitize(server: &ServerDescriptor) -> ServerDescriptor {
    match server {
        ServerDescriptor::Http { url, timeout_seconds, .. } => ServerDescriptor::Http {
            url: url.clone(),
            headers: None,
            timeout_seconds: *timeout_seconds,
        },
        ServerDescriptor::Stdio { command, args, env } => ServerDescriptor::Stdio {
            command: command.clone(),
            args: args.clone(),
            env: env.clone(),
        },
    }
}

pub async fn start_bridge(
    pp: &dyn PathProvider,
    keychain: &dyn KeychainStore,
    bridge_executable: &std::path::Path,
    req: StartBridgeRequest<'_>,
) -> Result<StartedBridge, McpcError> {
    let socket = socket_path(pp, req.name);
    let sanitized = sanitize(req.server);
    let sanitized_json =
        serde_json::to_string(&sanitized).map_err(|e| McpcError::Fatal(e.to_string()))?;

    let mut cmd = tokio::process::Command::new(bridge_executable);
    cmd.arg(req.name).arg(&socket).arg(&sanitized_json);
    if req.verbose {
        cmd.arg("--verbose");
    }
    if let Some(profile) = req.profile_name {
        cmd.arg("--profile").arg(profile);
    }
    if req.headers.is_some() {
        cmd.arg("--has-headers");
    }
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());

    let child = cmd.spawn().map_err(|e| McpcError::Fatal(format!("spawning bridge: {e}")))?;
    let pid = child.id().ok_or_else(|| McpcError::Fatal("bridge exited immediately".to_string()))?;
    // `kill_on_drop` defaults to false, so dropping the handle here detaches
    // the bridge: it outlives this process and is tracked by pid from then on.
    drop(child);

    if !wait_for_socket(&socket).await {
        terminate(pid);
        return Err(McpcError::Client(format!(
            "bridge for {} did not become ready within {:?}",
            req.name, SOCKET_READY_TIMEOUT
        )));
    }

    if req.profile_name.is_some() || req.headers.is_some() {
        deliver_auth_credentials(keychain, &socket, req.server, req.profile_name, req.headers).await?;
    }

    Ok(StartedBridge { pid, socket_path: socket })
}

async fn wait_for_socket(socket: &std::path::Path) -> bool {
    let deadline = tokio::time::Instant::now() + SOCKET_READY_TIMEOUT;
    loop {
        if socket.exists() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
}

async fn deliver_auth_credentials(
    keychain: &dyn KeychainStore,
    socket: &std::path::Path,
    server: &ServerDescriptor,
    profile_name: Option<&str>,
    headers: Option<&HashMap<String, String>>,
) -> Result<(), McpcError> {
    let server_url = match server {
        ServerDescriptor::Http { url, .. } => url.clone(),
        ServerDescriptor::Stdio { .. } => String::new(),
    };
    let refresh_token = match profile_name {
        Some(profile) => {
            let host = crate::keychain::canonical_host(&server_url);
            keychain
                .get(Namespace::AuthTokens, &tokens_key(&host, profile))
                .map_err(|e| McpcError::Fatal(e.to_string()))?
        }
        None => None,
    };

    let client = crate::bridge_client::BridgeClient::connect(socket).await?;
    client
        .send_auth_credentials(AuthCredentials {
            server_url,
            profile_name: profile_name.unwrap_or_default().to_string(),
            refresh_token,
            client_id: None,
            headers: headers.cloned(),
        })
        .await?;
    client.close().await;
    Ok(())
}

fn terminate(pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output();
    }
}

/// Sends SIGTERM, waits up to a second, then SIGKILL. Never touches the
/// session record or header bundle: that is `closeSession`'s job, so
/// failover (`ensureBridgeHealthy`) can restart with the same identity.
pub async fn stop_bridge(pid: u32) {
    if !pid_is_alive(pid) {
        return;
    }
    terminate(pid);
    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if pid_is_alive(pid) {
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        #[cfg(windows)]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/F"])
                .output();
        }
    }
}

/// `pid` alive AND socket file present. No ping: liveness only, not
/// protocol health, which belongs to the daemon's own keepalive loop.
pub fn is_bridge_healthy(pid: Option<u32>, socket: &std::path::Path) -> bool {
    pid.is_some_and(pid_is_alive) && socket.exists()
}

/// If the session's bridge is not healthy, stops it (best-effort), reloads
/// the header bundle from the keychain, and restarts with the same
/// identity. A header-count mismatch is a hard error: the caller must close
/// and recreate rather than silently dropping headers the record claims to
/// have.
pub async fn ensure_bridge_healthy(
    pp: &dyn PathProvider,
    keychain: &dyn KeychainStore,
    bridge_executable: &std::path::Path,
    record: &crate::registry::SessionRecord,
) -> Result<StartedBridge, McpcError> {
    let socket = socket_path(pp, &record.name);
    if is_bridge_healthy(record.pid, &socket) {
        return Ok(StartedBridge {
            pid: record.pid.expect("checked by is_bridge_healthy"),
            socket_path: socket,
        });
    }

    if let Some(pid) = record.pid {
        stop_bridge(pid).await;
    }

    let headers = if record.header_count > 0 {
        let key = crate::keychain::headers_key(&record.name);
        let raw = keychain
            .get(Namespace::SessionHeaders, &key)
            .map_err(|e| McpcError::Fatal(e.to_string()))?
            .ok_or_else(|| {
                McpcError::Fatal(format!(
                    "session {} expects {} headers but none are in the keychain",
                    record.name, record.header_count
                ))
            })?;
        let map: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|e| McpcError::Fatal(e.to_string()))?;
        if map.len() as u32 != record.header_count {
            return Err(McpcError::Fatal(format!(
                "session {} header count mismatch: record says {}, keychain has {}",
                record.name,
                record.header_count,
                map.len()
            )));
        }
        Some(map)
    } else {
        None
    };

    start_bridge(
        pp,
        keychain,
        bridge_executable,
        StartBridgeRequest {
            name: &record.name,
            server: &record.server,
            verbose: false,
            profile_name: record.profile_name.as_deref(),
            headers: headers.as_ref(),
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_http_headers() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer secret".to_string());
        let server = ServerDescriptor::Http {
            url: "https://mcp.example.com".to_string(),
            headers: Some(headers),
            timeout_seconds: Some(30),
        };
        let sanitized = sanitize(&server);
        match sanitized {
            ServerDescriptor::Http { headers, timeout_seconds, .. } => {
                assert!(headers.is_none());
                assert_eq!(timeout_seconds, Some(30));
            }
            _ => panic!("expected http descriptor"),
        }
    }

    #[test]
    fn sanitize_leaves_stdio_descriptor_untouched() {
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "secret".to_string());
        let server = ServerDescriptor::Stdio {
            command: "my-server".to_string(),
            args: Some(vec!["--flag".to_string()]),
            env: Some(env.clone()),
        };
        let sanitized = sanitize(&server);
        match sanitized {
            ServerDescriptor::Stdio { env: got_env, .. } => assert_eq!(got_env, Some(env)),
            _ => panic!("expected stdio descriptor"),
        }
    }

    #[test]
    fn is_bridge_healthy_requires_both_pid_and_socket() {
        let missing_socket = std::env::temp_dir().join("definitely-absent.sock");
        assert!(!is_bridge_healthy(Some(std::process::id()), &missing_socket));
        assert!(!is_bridge_healthy(None, &missing_socket));
    }
}
