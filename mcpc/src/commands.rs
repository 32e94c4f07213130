//! Subcommand implementations: each one builds the C1/C3 seams, drives
//! `SessionClient` (C10) or the registry/profile/login modules directly for
//! the supplemented commands, and returns a `(summary, value)` pair for the
//! presentation layer.

use std::collections::HashMap;
use std::path::PathBuf;

use mcpc_core::error::McpcError;
use mcpc_core::keychain::{headers_key, KeychainStore, Namespace, OsKeychainStore};
use mcpc_core::paths::{is_valid_session_name, socket_path, OsPathProvider, PathProvider};
use mcpc_core::registry::{self, ServerDescriptor, SessionRecord, SessionStatus};
use mcpc_core::session_client::SessionClient;

use crate::cli::ServerTarget;

pub struct Context {
    pub pp: OsPathProvider,
    pub keychain: OsKeychainStore,
    pub bridge_executable: PathBuf,
}

impl Context {
    pub fn new(bridge_executable: PathBuf) -> Self {
        let pp = OsPathProvider;
        let fallback_dir = pp.home_dir();
        Self { pp, keychain: OsKeychainStore::new(fallback_dir), bridge_executable }
    }

    fn session_client(&self) -> SessionClient<'_> {
        SessionClient::new(&self.pp, &self.keychain, self.bridge_executable.clone())
    }
}

fn parse_header(raw: &str) -> Result<(String, String), McpcError> {
    let (k, v) = raw
        .split_once(':')
        .ok_or_else(|| McpcError::Client(format!("invalid --header {raw:?}, expected \"Key: Value\"")))?;
    Ok((k.trim().to_string(), v.trim().to_string()))
}

fn parse_env(raw: &str) -> Result<(String, String), McpcError> {
    let (k, v) = raw
        .split_once('=')
        .ok_or_else(|| McpcError::Client(format!("invalid --env {raw:?}, expected KEY=VALUE")))?;
    Ok((k.to_string(), v.to_string()))
}

fn build_server(target: &ServerTarget) -> Result<ServerDescriptor, McpcError> {
    match (&target.url, &target.command) {
        (Some(_), Some(_)) => Err(McpcError::Client("pass either a url or --command, not both".to_string())),
        (None, None) => Err(McpcError::Client("connect requires a url or --command".to_string())),
        (Some(url), None) => {
            let mut headers = HashMap::new();
            for raw in &target.headers {
                let (k, v) = parse_header(raw)?;
                headers.insert(k, v);
            }
            Ok(ServerDescriptor::Http {
                url: url.clone(),
                headers: if headers.is_empty() { None } else { Some(headers) },
                timeout_seconds: target.timeout_seconds,
            })
        }
        (None, Some(command)) => {
            let mut env = HashMap::new();
            for raw in &target.env {
                let (k, v) = parse_env(raw)?;
                env.insert(k, v);
            }
            Ok(ServerDescriptor::Stdio {
                command: command.clone(),
                args: if target.args.is_empty() { None } else { Some(target.args.clone()) },
                env: if env.is_empty() { None } else { Some(env) },
            })
        }
    }
}

/// Creates or replaces a session's registry record and starts its bridge,
/// delivering auth credentials over IPC per C9 step 5. Headers (if any) are
/// stashed in the keychain before the bridge spawns, never on its argv.
pub async fn connect(ctx: &Context, name: &str, target: &ServerTarget) -> Result<serde_json::Value, McpcError> {
    if !is_valid_session_name(name) {
        return Err(McpcError::Client(format!("invalid session name: {name}")));
    }
    let server = build_server(target)?;

    if let Some(profile) = &target.profile {
        if mcpc_core::profile::get(&ctx.pp, profile)?.is_none() {
            return Err(McpcError::Client(format!("no such profile: {profile}; run `mcpc login {profile} <url>` first")));
        }
    }

    let header_map = match &server {
        ServerDescriptor::Http { headers: Some(h), .. } if !h.is_empty() => Some(h.clone()),
        _ => None,
    };
    let header_count = header_map.as_ref().map(|h| h.len() as u32).unwrap_or(0);
    if let Some(headers) = &header_map {
        let json = serde_json::to_string(headers).map_err(|e| McpcError::Fatal(e.to_string()))?;
        ctx.keychain
            .put(Namespace::SessionHeaders, &headers_key(name), &json)
            .map_err(|e| McpcError::Fatal(e.to_string()))?;
    }

    let started = mcpc_core::bridge_manager::start_bridge(
        &ctx.pp,
        &ctx.keychain,
        &ctx.bridge_executable,
        mcpc_core::bridge_manager::StartBridgeRequest {
            name,
            server: &server,
            verbose: false,
            profile_name: target.profile.as_deref(),
            headers: header_map.as_ref(),
        },
    )
    .await?;

    let now = chrono::Utc::now();
    let record = SessionRecord {
        name: name.to_string(),
        server,
        pid: Some(started.pid),
        profile_name: target.profile.clone(),
        header_count,
        created_at: now,
        last_seen_at: now,
        status: SessionStatus::Active,
        protocol_version: None,
    };
    registry::save(&ctx.pp, record)?;

    Ok(serde_json::json!({"name": name, "pid": started.pid, "socketPath": started.socket_path.display().to_string()}))
}

pub async fn call(ctx: &Context, name: &str, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value, McpcError> {
    ctx.session_client().call(name, method, params).await
}

pub async fn close(ctx: &Context, name: &str) -> Result<serde_json::Value, McpcError> {
    ctx.session_client().close_session(name).await?;
    Ok(serde_json::json!({"name": name, "closed": true}))
}

pub async fn stop(ctx: &Context, name: &str) -> Result<serde_json::Value, McpcError> {
    ctx.session_client().stop_bridge_only(name).await?;
    Ok(serde_json::json!({"name": name, "stopped": true}))
}

pub fn clean(ctx: &Context) -> Result<serde_json::Value, McpcError> {
    let counts = registry::consolidate(&ctx.pp, &ctx.keychain, true)?;
    Ok(serde_json::json!({
        "deadBridges": counts.dead_bridges,
        "expiredSessions": counts.expired_sessions,
        "staleSockets": counts.stale_sockets,
    }))
}

/// Read-only diagnostic: a non-destructive consolidation pass followed by a
/// liveness/status snapshot, optionally narrowed to one session.
pub fn status(ctx: &Context, name: Option<&str>) -> Result<serde_json::Value, McpcError> {
    registry::consolidate(&ctx.pp, &ctx.keychain, false)?;
    let sessions = registry::load(&ctx.pp)?;
    let mut rows = Vec::new();
    for record in sessions.values() {
        if let Some(want) = name {
            if record.name != want {
                continue;
            }
        }
        let socket = socket_path(&ctx.pp, &record.name);
        let alive = record.pid.is_some_and(mcpc_core::paths::pid_is_alive) && socket.exists();
        let mut row = serde_json::json!({
            "name": record.name,
            "status": match record.status { SessionStatus::Active => "active", SessionStatus::Expired => "expired", SessionStatus::DeadBridge => "deadBridge" },
            "transport": record.server.transport(),
            "bridgeAlive": alive,
            "lastSeenAt": record.last_seen_at.to_rfc3339(),
        });
        if let Some(profile_name) = &record.profile_name {
            if let Some(profile) = mcpc_core::profile::get(&ctx.pp, profile_name)? {
                row["profile"] = serde_json::json!({
                    "name": profile.name,
                    "authenticatedAt": profile.authenticated_at.to_rfc3339(),
                    "refreshedAt": profile.refreshed_at.map(|t| t.to_rfc3339()),
                });
            }
        }
        rows.push(row);
    }
    Ok(serde_json::Value::Array(rows))
}

pub async fn login(ctx: &Context, name: &str, url: &str, scopes: Vec<String>) -> Result<serde_json::Value, McpcError> {
    let browser = mcpc_core::login::SystemBrowser;
    let scopes = if scopes.is_empty() { None } else { Some(scopes) };
    let profile = mcpc_core::login::login(&ctx.pp, &ctx.keychain, &browser, name, url, scopes).await?;
    Ok(serde_json::json!({"name": profile.name, "serverUrl": profile.server_url}))
}

pub fn logout(ctx: &Context, name: &str) -> Result<serde_json::Value, McpcError> {
    mcpc_core::login::logout(&ctx.pp, &ctx.keychain, name)?;
    Ok(serde_json::json!({"name": name, "loggedOut": true}))
}

/// Sustained caller mode (§4.8): one Bridge Client connection kept open for
/// the process's lifetime, reading newline-delimited `{method, params?}`
/// requests from stdin and writing `{result}`/`{notification}` lines to
/// stdout.
pub async fn session_shell(ctx: &Context, name: &str) -> Result<(), McpcError> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut client = ctx.session_client().open_sustained(name).await?;

    let notif_task = {
        let notifications = client.notifications();
        let mut notifications = std::mem::replace(notifications, tokio::sync::mpsc::unbounded_channel().1);
        tokio::spawn(async move {
            while let Some(n) = notifications.recv().await {
                let line = serde_json::json!({"notification": n});
                println!("{}", serde_json::to_string(&line).unwrap_or_default());
            }
        })
    };

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await.map_err(McpcError::io)? {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                println!("{}", serde_json::json!({"error": format!("invalid json: {e}"), "code": 1}));
                continue;
            }
        };
        let method = parsed.get("method").and_then(|m| m.as_str()).unwrap_or_default().to_string();
        let params = parsed.get("params").cloned();
        match client.request(&method, params).await {
            Ok(result) => println!("{}", serde_json::json!({"result": result})),
            Err(e) => println!("{}", serde_json::json!({"error": e.message(), "code": e.code()})),
        }
    }

    notif_task.abort();
    client.close().await;
    Ok(())
}
