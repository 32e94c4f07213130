//! C6: thin seam over `rmcp`'s transports. Builds a running MCP service
//! from a `ServerDescriptor`, attaching a bearer token (resolved by the
//! caller via C5) or static headers for HTTP, or spawning a child process
//! for stdio. Grounded directly on the teacher's `ensure_rmcp_client` in
//! `mcp-bouncer-core/src/client.rs`, narrowed to the two transports this
//! spec names (the teacher also supports plain SSE, which is dropped here).

use std::collections::HashMap;

use anyhow::{Context, Result};
use rmcp::model::{ClientCapabilities, ClientInfo, Implementation, ProtocolVersion, ServerNotification, ServerRequest};
use rmcp::service::{NotificationContext, RequestContext, RoleClient};
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{ErrorData, ServiceExt};
use tokio::sync::mpsc;

use crate::registry::ServerDescriptor;

pub type McpService = rmcp::service::RunningService<RoleClient, NotificationForwarder>;

/// An access token C5 (`OAuthTokenManager`) has already validated; `transport`
/// never talks to the token endpoint itself, keeping that concern at C5.
pub struct HttpAuth {
    pub access_token: String,
}

/// Client-role `rmcp::Service` forwarding every server-initiated notification
/// (list-changed, messages) to the daemon's fan-out channel. Grounded on the
/// teacher's `UpstreamBridge` in `socket_proxy.rs`, narrowed to this spec's
/// one-directional need: the daemon never relays server-initiated requests.
#[derive(Clone)]
pub struct NotificationForwarder {
    tx: mpsc::UnboundedSender<ServerNotification>,
}

impl NotificationForwarder {
    pub fn new(tx: mpsc::UnboundedSender<ServerNotification>) -> Self {
        Self { tx }
    }
}

impl rmcp::service::Service<RoleClient> for NotificationForwarder {
    fn handle_request(
        &self,
        _request: ServerRequest,
        _context: RequestContext<RoleClient>,
    ) -> impl std::future::Future<Output = Result<rmcp::model::ClientResult, ErrorData>> + Send {
        async move {
            Err(ErrorData::internal_error(
                "mcpc bridge does not accept server-initiated requests",
                None,
            ))
        }
    }

    fn handle_notification(
        &self,
        notification: ServerNotification,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = Result<(), ErrorData>> + Send {
        let tx = self.tx.clone();
        async move {
            let _ = tx.send(notification);
            Ok(())
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "mcpc".into(),
                title: Some("mcpc bridge".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
        }
    }
}

/// `headers` is the caller-resolved header bundle (from the keychain or an
/// IPC-delivered `AuthCredentials`, never from `descriptor` itself — the
/// bridge manager always hands the daemon a sanitized, header-stripped
/// descriptor so secrets never sit on a spawned process's argv).
pub async fn connect(
    descriptor: &ServerDescriptor,
    headers: Option<HashMap<String, String>>,
    auth: Option<HttpAuth>,
    notify_tx: mpsc::UnboundedSender<ServerNotification>,
) -> Result<McpService> {
    match descriptor {
        ServerDescriptor::Http { url, .. } => connect_http(url, headers, auth, notify_tx).await,
        ServerDescriptor::Stdio { command, args, env } => {
            connect_stdio(command, args, env, notify_tx).await
        }
    }
}

async fn connect_http(
    url: &str,
    headers: Option<HashMap<String, String>>,
    auth: Option<HttpAuth>,
    notify_tx: mpsc::UnboundedSender<ServerNotification>,
) -> Result<McpService> {
    let handler = NotificationForwarder::new(notify_tx);
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in headers.unwrap_or_default() {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .with_context(|| format!("invalid header name {k}"))?;
        let val = reqwest::header::HeaderValue::from_str(&v)
            .with_context(|| format!("invalid header value for {k}"))?;
        map.insert(name, val);
    }
    if let Some(auth) = auth {
        let mut val = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", auth.access_token))
            .context("building bearer authorization header")?;
        val.set_sensitive(true);
        map.insert(reqwest::header::AUTHORIZATION, val);
    }
    let client = reqwest::Client::builder()
        .default_headers(map)
        .build()
        .context("building http client")?;
    let transport = StreamableHttpClientTransport::with_client(
        client,
        StreamableHttpClientTransportConfig::with_uri(url.to_string()),
    );
    let service = handler.serve(transport).await.context("mcp initialize handshake")?;
    Ok(service)
}

async fn connect_stdio(
    command: &str,
    args: &Option<Vec<String>>,
    env: &Option<HashMap<String, String>>,
    notify_tx: mpsc::UnboundedSender<ServerNotification>,
) -> Result<McpService> {
    let mut cmd = tokio::process::Command::new(command);
    if let Some(args) = args {
        cmd.args(args);
    }
    if let Some(env) = env {
        for (k, v) in env {
            cmd.env(k, v);
        }
    }
    let transport = TokioChildProcess::new(cmd).context("spawning stdio server")?;
    let handler = NotificationForwarder::new(notify_tx);
    let service = handler.serve(transport).await.context("mcp initialize handshake")?;
    Ok(service)
}

/// Every MCP operation this spec's CLI surface needs: ping for the keepalive
/// loop, the three list operations, and tool invocation. Resource/prompt
/// read and argument/payload shapes are passthrough per the spec's own
/// out-of-scope note.
pub async fn ping(service: &McpService) -> Result<()> {
    service.peer().list_tools(Default::default()).await.map(|_| ()).context("ping via list_tools")
}

/// Routes one IPC `request.method` to the matching `rmcp` peer call,
/// deserializing `params` into the expected request type and serializing
/// the result back to JSON. Unknown methods are a client error, not a
/// transport error: the bridge never forwards a method it doesn't know.
pub async fn dispatch(
    service: &McpService,
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, crate::error::McpcError> {
    use crate::error::McpcError;
    let to_client_err = |e: serde_json::Error| McpcError::Client(format!("invalid params: {e}"));
    let to_server_err = |e: rmcp::ServiceError| McpcError::Server(e.to_string());

    let value = match method {
        "ping" => {
            ping(service).await.map_err(|e| McpcError::Server(e.to_string()))?;
            serde_json::Value::Null
        }
        "tools/list" => {
            let req = parse_optional(params).map_err(to_client_err)?;
            let result = service.peer().list_tools(req).await.map_err(to_server_err)?;
            serde_json::to_value(result).map_err(|e| McpcError::Fatal(e.to_string()))?
        }
        "resources/list" => {
            let req = parse_optional(params).map_err(to_client_err)?;
            let result = service.peer().list_resources(req).await.map_err(to_server_err)?;
            serde_json::to_value(result).map_err(|e| McpcError::Fatal(e.to_string()))?
        }
        "prompts/list" => {
            let req = parse_optional(params).map_err(to_client_err)?;
            let result = service.peer().list_prompts(req).await.map_err(to_server_err)?;
            serde_json::to_value(result).map_err(|e| McpcError::Fatal(e.to_string()))?
        }
        "tools/call" => {
            let req: rmcp::model::CallToolRequestParam = serde_json::from_value(
                params.ok_or_else(|| McpcError::Client("tools/call requires params".to_string()))?,
            )
            .map_err(to_client_err)?;
            let result = service.peer().call_tool(req).await.map_err(to_server_err)?;
            serde_json::to_value(result).map_err(|e| McpcError::Fatal(e.to_string()))?
        }
        other => return Err(McpcError::Client(format!("unknown method: {other}"))),
    };
    Ok(value)
}

fn parse_optional<T: serde::de::DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> Result<Option<T>, serde_json::Error> {
    match params {
        Some(v) if !v.is_null() => Ok(Some(serde_json::from_value(v)?)),
        _ => Ok(None),
    }
}
