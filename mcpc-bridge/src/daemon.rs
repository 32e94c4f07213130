//! C7 bridge daemon body: owns the single MCP connection for one session,
//! the IPC server its clients dial into, and the keepalive loop that
//! detects both bridge death and server-side session expiry. `main.rs`
//! parses argv and sets up logging; everything from socket bind onward
//! lives here so it can be reasoned about (and, eventually, tested) as one
//! state machine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcpc_core::error::McpcError;
use mcpc_core::events::SessionEvent;
use mcpc_core::ipc::{read_message, write_message, AuthCredentials, IpcError, IpcMessage};
use mcpc_core::keychain::{canonical_host, tokens_key, KeychainStore, Namespace, OsKeychainStore};
use mcpc_core::oauth::{OAuthTokenManager, OnBeforeRefresh, OnTokenRefresh, TokenSnapshot};
use mcpc_core::paths::{logs_dir, OsPathProvider, PathProvider};
use mcpc_core::registry::{ServerDescriptor, SessionStatus};
use mcpc_core::transport::{self, HttpAuth, McpService};
use rmcp::model::ServerNotification;
use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock, Semaphore};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const AUTH_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const FAILED_CONNECT_GRACE: Duration = Duration::from_secs(10);

/// §5's per-bridge request cap: dispatched concurrently, queued waiting for
/// a slot, and the point past which a new request fails fast instead of
/// queuing at all.
const MAX_INFLIGHT_REQUESTS: usize = 10;
const MAX_QUEUED_REQUESTS: usize = 100;

/// Below this much remaining lifetime, the keepalive loop proactively
/// refreshes the access token via C5 rather than waiting for a 401.
const OAUTH_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Clone)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

struct Shared {
    session_name: String,
    pp: OsPathProvider,
    descriptor: ServerDescriptor,
    notify_tx: mpsc::UnboundedSender<ServerNotification>,
    service: RwLock<Option<McpService>>,
    readiness: watch::Sender<Readiness>,
    clients: Mutex<Vec<mpsc::UnboundedSender<IpcMessage>>>,
    exit: watch::Sender<Option<i32>>,
    request_gate: Semaphore,
    queued_requests: AtomicUsize,
    oauth: Mutex<Option<Arc<OAuthTokenManager>>>,
    static_headers: Mutex<Option<std::collections::HashMap<String, String>>>,
}

/// Runs the daemon to completion and returns the process exit code. Never
/// panics on a bad connection; only a malformed `serverJson` or a socket
/// bind failure are treated as immediately fatal. `expect_credentials` is
/// set by `main.rs` whenever the bridge manager is about to deliver a
/// `SetAuthCredentials` IPC message — for an OAuth profile *or* a
/// headers-only HTTP connect, since both travel over that same message.
pub async fn run(
    session_name: String,
    socket_path: PathBuf,
    server_json: String,
    profile: Option<String>,
    expect_credentials: bool,
) -> i32 {
    let descriptor: ServerDescriptor = match serde_json::from_str(&server_json) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("invalid server descriptor: {e}");
            return 1;
        }
    };

    let (readiness_tx, _readiness_rx) = watch::channel(Readiness::Pending);
    let (exit_tx, mut exit_rx) = watch::channel(None);
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<ServerNotification>();
    let (auth_tx, auth_rx) = oneshot::channel::<AuthCredentials>();
    let auth_tx = Arc::new(Mutex::new(Some(auth_tx)));

    let shared = Arc::new(Shared {
        session_name: session_name.clone(),
        pp: OsPathProvider,
        descriptor: descriptor.clone(),
        notify_tx: notify_tx.clone(),
        service: RwLock::new(None),
        readiness: readiness_tx,
        clients: Mutex::new(Vec::new()),
        exit: exit_tx.clone(),
        request_gate: Semaphore::new(MAX_INFLIGHT_REQUESTS),
        queued_requests: AtomicUsize::new(0),
        oauth: Mutex::new(None),
        static_headers: Mutex::new(None),
    });

    let ipc_task = match start_ipc_server(socket_path.clone(), shared.clone(), auth_tx.clone()) {
        Ok(task) => task,
        Err(e) => {
            tracing::error!("binding ipc socket: {e}");
            return 1;
        }
    };

    {
        let shared = shared.clone();
        tokio::spawn(async move {
            while let Some(n) = notify_rx.recv().await {
                broadcast(&shared, &SessionEvent::from_server_notification(&n)).await;
            }
        });
    }

    if profile.is_some() || expect_credentials {
        match tokio::time::timeout(AUTH_WAIT_TIMEOUT, auth_rx).await {
            Ok(Ok(creds)) => {
                if let Err(e) = connect_with_auth(&shared, &descriptor, creds, notify_tx).await {
                    enter_failed_grace(&shared, e.to_string()).await;
                    return 1;
                }
            }
            _ => {
                tracing::error!("timed out waiting for auth credentials from the bridge manager");
                return 1;
            }
        }
    } else {
        match transport::connect(&descriptor, None, None, notify_tx).await {
            Ok(service) => {
                *shared.service.write().await = Some(service);
                let _ = shared.readiness.send(Readiness::Ready);
            }
            Err(e) => {
                enter_failed_grace(&shared, e.to_string()).await;
                return 1;
            }
        }
    }

    {
        let shared = shared.clone();
        tokio::spawn(async move { keepalive_loop(shared).await });
    }
    {
        let session_name = session_name.clone();
        tokio::task::spawn_blocking(move || gc_orphan_logs(&OsPathProvider, &session_name));
    }

    let code = wait_for_exit(&mut exit_rx).await;
    ipc_task.abort();
    shutdown_sequence(&shared, &socket_path).await;
    code
}

/// Wires both halves of an IPC-delivered `SetAuthCredentials` message onto
/// the live HTTP connection: `creds.headers` goes straight onto the
/// transport, and an OAuth profile's `client_id`/`refresh_token` pair is
/// handed to a fresh `OAuthTokenManager` (C5) whose resolved access token
/// becomes the `Authorization` header instead of seeding `rmcp`'s own
/// authorization manager directly.
async fn connect_with_auth(
    shared: &Arc<Shared>,
    descriptor: &ServerDescriptor,
    creds: AuthCredentials,
    notify_tx: mpsc::UnboundedSender<ServerNotification>,
) -> Result<(), McpcError> {
    let auth = match (descriptor, creds.client_id, creds.refresh_token) {
        (ServerDescriptor::Http { url, .. }, Some(client_id), Some(refresh_token)) => {
            let manager = build_oauth_manager(&shared.pp, url, &creds.profile_name, client_id, refresh_token);
            let access_token = manager.get_valid_access_token().await?;
            *shared.oauth.lock().await = Some(manager);
            Some(HttpAuth { access_token })
        }
        _ => None,
    };
    *shared.static_headers.lock().await = creds.headers.clone();
    let service = transport::connect(descriptor, creds.headers, auth, notify_tx)
        .await
        .map_err(|e| McpcError::Network(e.to_string()))?;
    *shared.service.write().await = Some(service);
    let _ = shared.readiness.send(Readiness::Ready);
    Ok(())
}

fn build_oauth_manager(
    pp: &OsPathProvider,
    url: &str,
    profile_name: &str,
    client_id: String,
    refresh_token: String,
) -> Arc<OAuthTokenManager> {
    let hooks = KeychainRefreshHooks {
        keychain: OsKeychainStore::new(pp.home_dir()),
        host: canonical_host(url),
        profile: profile_name.to_string(),
    };
    Arc::new(OAuthTokenManager::new(
        token_endpoint_guess(url),
        client_id,
        refresh_token,
        Arc::new(hooks.clone()),
        Arc::new(hooks),
    ))
}

/// The daemon has no OAuth-server-metadata discovery of its own (that lives
/// in `login.rs`'s `rmcp::transport::auth::OAuthState` PKCE flow, which this
/// code path deliberately doesn't reuse — see DESIGN.md). Falls back to the
/// `{issuer}/token` convention most minimal OAuth deployments follow.
fn token_endpoint_guess(url: &str) -> String {
    let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
    let host_end = url[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i)
        .unwrap_or(url.len());
    format!("{}/token", &url[..host_end])
}

/// `latest()` is the rotation-adoption hook C5 uses to pick up a refresh
/// token another bridge already rotated without hitting the network. The
/// keychain here only ever holds the bare refresh-token string (see
/// `login.rs`'s correctness note on `...:tokens`), not a full
/// access-token-plus-expiry snapshot, so there is nothing to adopt from it;
/// this always returns `None` and relies on the normal refresh-with-backoff
/// path instead.
#[derive(Clone)]
struct KeychainRefreshHooks {
    keychain: OsKeychainStore,
    host: String,
    profile: String,
}

#[async_trait::async_trait]
impl OnBeforeRefresh for KeychainRefreshHooks {
    async fn latest(&self) -> Option<TokenSnapshot> {
        None
    }
}

#[async_trait::async_trait]
impl OnTokenRefresh for KeychainRefreshHooks {
    async fn persist(&self, snapshot: &TokenSnapshot) -> Result<(), McpcError> {
        if let Some(refresh_token) = &snapshot.refresh_token {
            self.keychain
                .put(Namespace::AuthTokens, &tokens_key(&self.host, &self.profile), refresh_token)
                .map_err(|e| McpcError::Fatal(e.to_string()))?;
        }
        Ok(())
    }
}

/// A failed initial connect is not reported immediately: callers racing the
/// bridge manager's 5-second ready-poll get a real error instead of a
/// connection refused, so the 10-second window here outlives that poll.
async fn enter_failed_grace(shared: &Arc<Shared>, message: String) {
    tracing::error!("mcp connect failed: {message}");
    let _ = shared.readiness.send(Readiness::Failed(message));
    tokio::time::sleep(FAILED_CONNECT_GRACE).await;
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<i32>>) -> i32 {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("installing sigterm handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("installing sigint handler");
        tokio::select! {
            _ = sigterm.recv() => 0,
            _ = sigint.recv() => 0,
            _ = exit_rx.changed() => exit_rx.borrow().unwrap_or(0),
        }
    }
    #[cfg(windows)]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => 0,
            _ = exit_rx.changed() => exit_rx.borrow().unwrap_or(0),
        }
    }
}

/// Idempotent: notifies connected clients, cancels the MCP service, and
/// unlinks the socket file. Safe to call even if nothing ever connected.
async fn shutdown_sequence(shared: &Arc<Shared>, socket_path: &Path) {
    tracing::info!(session = %shared.session_name, "bridge shutting down");
    for tx in shared.clients.lock().await.drain(..) {
        let _ = tx.send(IpcMessage::Shutdown { id: None });
    }
    if let Some(service) = shared.service.write().await.take() {
        service.cancellation_token().cancel();
    }
    #[cfg(unix)]
    let _ = std::fs::remove_file(socket_path);
    #[cfg(not(unix))]
    let _ = socket_path;
}

async fn keepalive_loop(shared: Arc<Shared>) {
    loop {
        tokio::time::sleep(KEEPALIVE_INTERVAL).await;
        if !is_ready(&shared) {
            continue;
        }
        maybe_refresh_oauth(&shared).await;
        let result = {
            let guard = shared.service.read().await;
            match guard.as_ref() {
                Some(service) => transport::ping(service).await,
                None => continue,
            }
        };
        match result {
            Ok(()) => {
                let pp = shared.pp;
                let session_name = shared.session_name.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    mcpc_core::registry::update(&pp, &session_name, |r| {
                        r.last_seen_at = chrono::Utc::now();
                    })
                })
                .await;
            }
            Err(e) => {
                let message = e.to_string();
                if is_session_expired_signature(&message) {
                    mark_expired_and_exit(&shared).await;
                    return;
                }
                tracing::warn!("keepalive ping failed: {message}");
            }
        }
    }
}

/// `reqwest::Client`'s default headers can't be swapped after the transport
/// is built, so the only way to rotate a live connection's bearer token is
/// to reconnect with a fresh one. Runs every keepalive tick but only acts
/// once the token is within `OAUTH_REFRESH_MARGIN_SECS` of expiry (or its
/// lifetime is unknown, which C5 treats the same way).
async fn maybe_refresh_oauth(shared: &Arc<Shared>) {
    let manager = shared.oauth.lock().await.clone();
    let Some(manager) = manager else { return };
    let needs_refresh = !matches!(
        manager.seconds_until_expiry().await,
        Some(secs) if secs > OAUTH_REFRESH_MARGIN_SECS
    );
    if !needs_refresh {
        return;
    }
    let access_token = match manager.get_valid_access_token().await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!("oauth token refresh failed: {e}");
            return;
        }
    };
    let auth = Some(HttpAuth { access_token });
    let headers = shared.static_headers.lock().await.clone();
    match transport::connect(&shared.descriptor, headers, auth, shared.notify_tx.clone()).await {
        Ok(new_service) => {
            if let Some(old) = shared.service.write().await.replace(new_service) {
                old.cancellation_token().cancel();
            }
            tracing::info!(session = %shared.session_name, "reconnected with a refreshed oauth token");
        }
        Err(e) => tracing::warn!("reconnecting with a refreshed oauth token failed: {e}"),
    }
}

/// §4.5's expiry heuristic: either a literal expiry phrase from the server,
/// or an HTTP 404 that isn't about a missing tool (a 404 naming a tool is a
/// normal `tools/call` error, not a dead session).
fn is_session_expired_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    if lower.contains("session expired")
        || lower.contains("session not found")
        || lower.contains("invalid session")
        || lower.contains("session is no longer valid")
    {
        return true;
    }
    lower.contains("404") && !lower.contains("tool")
}

async fn mark_expired_and_exit(shared: &Arc<Shared>) {
    tracing::warn!(session = %shared.session_name, "session expired; shutting down");
    let pp = shared.pp;
    let session_name = shared.session_name.clone();
    let _ = tokio::task::spawn_blocking(move || {
        mcpc_core::registry::update(&pp, &session_name, |r| {
            r.status = SessionStatus::Expired;
            r.pid = None;
        })
    })
    .await;
    // §4.5: the shutdown sequence itself always exits 0; the expiry signal
    // is observable to callers via SessionRecord.status, not the exit code.
    let _ = shared.exit.send(Some(0));
}

fn is_ready(shared: &Arc<Shared>) -> bool {
    matches!(&*shared.readiness.subscribe().borrow(), Readiness::Ready)
}

async fn wait_ready(shared: &Arc<Shared>) -> Result<(), McpcError> {
    let mut rx = shared.readiness.subscribe();
    loop {
        let current = rx.borrow().clone();
        match current {
            Readiness::Ready => return Ok(()),
            Readiness::Failed(msg) => return Err(McpcError::Network(msg)),
            Readiness::Pending => {
                if rx.changed().await.is_err() {
                    return Err(McpcError::Fatal("readiness channel closed".to_string()));
                }
            }
        }
    }
}

async fn handle_request(
    shared: &Arc<Shared>,
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, McpcError> {
    let _permit = acquire_request_slot(shared).await?;
    wait_ready(shared).await?;
    let guard = shared.service.read().await;
    let service = guard
        .as_ref()
        .ok_or_else(|| McpcError::Fatal("mcp service not connected".to_string()))?;
    transport::dispatch(service, method, params).await
}

/// Fails fast once `MAX_INFLIGHT_REQUESTS` are dispatched and
/// `MAX_QUEUED_REQUESTS` more are already waiting; otherwise waits for a
/// slot, which is how a burst of concurrent callers gets naturally
/// serialized without a caller-visible difference from an ordinary MCP
/// round trip.
async fn acquire_request_slot(shared: &Arc<Shared>) -> Result<tokio::sync::SemaphorePermit<'_>, McpcError> {
    if let Ok(permit) = shared.request_gate.try_acquire() {
        return Ok(permit);
    }
    if shared.queued_requests.fetch_add(1, Ordering::SeqCst) >= MAX_QUEUED_REQUESTS {
        shared.queued_requests.fetch_sub(1, Ordering::SeqCst);
        return Err(McpcError::Client("queue full".to_string()));
    }
    let result = shared
        .request_gate
        .acquire()
        .await
        .map_err(|_| McpcError::Fatal("request semaphore closed".to_string()));
    shared.queued_requests.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn broadcast(shared: &Arc<Shared>, event: &SessionEvent) {
    let msg = IpcMessage::Notification { notification: event.to_notification() };
    let clients = shared.clients.lock().await;
    for tx in clients.iter() {
        let _ = tx.send(msg.clone());
    }
}

fn response_message(id: String, result: Result<serde_json::Value, McpcError>) -> IpcMessage {
    match result {
        Ok(v) => IpcMessage::Response { id, result: Some(v), error: None },
        Err(e) => IpcMessage::Response {
            id,
            result: None,
            error: Some(IpcError { code: e.code() as i64, message: e.message().to_string() }),
        },
    }
}

type AuthSender = Arc<Mutex<Option<oneshot::Sender<AuthCredentials>>>>;

fn start_ipc_server(
    socket_path: PathBuf,
    shared: Arc<Shared>,
    auth_tx: AuthSender,
) -> Result<tokio::task::JoinHandle<()>, McpcError> {
    #[cfg(unix)]
    {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(McpcError::io)?;
        }
        let _ = std::fs::remove_file(&socket_path);
        let listener = tokio::net::UnixListener::bind(&socket_path).map_err(McpcError::io)?;
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let (read_half, write_half) = stream.into_split();
                        spawn_connection(shared.clone(), auth_tx.clone(), read_half, write_half);
                    }
                    Err(e) => {
                        tracing::warn!("ipc accept failed: {e}");
                        break;
                    }
                }
            }
        }))
    }
    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ServerOptions;
        let pipe_name = socket_path.to_string_lossy().to_string();
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)
            .map_err(McpcError::io)?;
        Ok(tokio::spawn(async move {
            loop {
                if server.connect().await.is_err() {
                    break;
                }
                let connected = server;
                server = match ServerOptions::new().create(&pipe_name) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("creating next named pipe instance: {e}");
                        break;
                    }
                };
                let (read_half, write_half) = tokio::io::split(connected);
                spawn_connection(shared.clone(), auth_tx.clone(), read_half, write_half);
            }
        }))
    }
}

fn spawn_connection<R, W>(shared: Arc<Shared>, auth_tx: AuthSender, read_half: R, write_half: W)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        handle_connection(shared, auth_tx, read_half, write_half).await;
    });
}

async fn handle_connection<R, W>(shared: Arc<Shared>, auth_tx: AuthSender, read_half: R, mut write_half: W)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<IpcMessage>();
    shared.clients.lock().await.push(out_tx.clone());

    let mut reader = BufReader::new(read_half);
    loop {
        tokio::select! {
            msg = read_message(&mut reader) => {
                match msg {
                    Ok(Some(IpcMessage::Request { id, method, params })) => {
                        let response = handle_request(&shared, &method, params).await;
                        let _ = out_tx.send(response_message(id, response));
                    }
                    Ok(Some(IpcMessage::Shutdown { id })) => {
                        let _ = out_tx.send(IpcMessage::Response {
                            id: id.unwrap_or_default(),
                            result: Some(serde_json::Value::Null),
                            error: None,
                        });
                        let _ = shared.exit.send(Some(0));
                        break;
                    }
                    Ok(Some(IpcMessage::SetAuthCredentials { auth_credentials })) => {
                        match auth_tx.lock().await.take() {
                            Some(tx) => { let _ = tx.send(auth_credentials); }
                            None => tracing::warn!(
                                "received set-auth-credentials on an already-connected bridge; ignoring"
                            ),
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
            Some(out) = out_rx.recv() => {
                if write_message(&mut write_half, &out).await.is_err() {
                    break;
                }
            }
        }
    }

    shared.clients.lock().await.retain(|tx| !tx.same_channel(&out_tx));
}

/// Best-effort: removes bridge log files whose session no longer exists in
/// the registry. Never blocks startup and never fails the daemon.
pub fn gc_orphan_logs(pp: &dyn PathProvider, session_name: &str) {
    let dir = logs_dir(pp);
    let Ok(entries) = std::fs::read_dir(&dir) else { return };
    let sessions = mcpc_core::registry::load(pp).unwrap_or_default();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(stem) = file_name
            .to_str()
            .and_then(|s| s.strip_prefix("bridge-"))
            .and_then(|s| s.strip_suffix(".log"))
        else {
            continue;
        };
        let candidate = format!("@{stem}");
        if candidate == session_name || sessions.contains_key(&candidate) {
            continue;
        }
        let _ = std::fs::remove_file(entry.path());
    }
}
