//! Supplemented companion to C5: the browser-based OAuth bootstrap spec.md
//! treats as an external collaborator ("specified only at the interface the
//! token manager consumes"). Grounded directly on the teacher's
//! `start_oauth_for_server` in `oauth.rs` — bind an ephemeral loopback
//! listener, open the system browser, await the callback, exchange the code
//! — adapted from the teacher's flat `oauth.json` file to this spec's
//! `AuthProfile` record plus keychain-held token material.

use std::sync::Mutex;

use axum::extract::Query;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use oauth2::TokenResponse;
use rmcp::transport::auth::OAuthState;

use crate::error::McpcError;
use crate::keychain::{canonical_host, client_key, tokens_key, KeychainStore, Namespace};
use crate::paths::PathProvider;
use crate::profile::{self, AuthProfile};

/// Swappable seam so unit tests never bind a real loopback listener or spawn
/// a browser, mirroring `PathProvider`'s test-substitution role for C1.
#[async_trait::async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn open(&self, url: &str) -> Result<(), McpcError>;
}

pub struct SystemBrowser;

#[async_trait::async_trait]
impl BrowserLauncher for SystemBrowser {
    async fn open(&self, url: &str) -> Result<(), McpcError> {
        open::that_detached(url).map_err(|e| McpcError::Fatal(format!("opening browser: {e}")))
    }
}

#[derive(Debug, serde::Deserialize)]
struct CallbackQuery {
    code: String,
    #[serde(default)]
    state: Option<String>,
}

const DEFAULT_SCOPE: &str = "mcp";

/// Runs the full PKCE + dynamic-registration + browser round trip for
/// `server_url`, then persists an `AuthProfile` record plus keychain-held
/// tokens under `name`. Returns the saved profile.
pub async fn login(
    pp: &dyn PathProvider,
    keychain: &dyn KeychainStore,
    browser: &dyn BrowserLauncher,
    name: &str,
    server_url: &str,
    scopes: Option<Vec<String>>,
) -> Result<AuthProfile, McpcError> {
    let parsed = reqwest::Url::parse(server_url)
        .map_err(|e| McpcError::Client(format!("invalid server url: {e}")))?;
    let mut base = parsed.clone();
    base.set_path("");

    let mut state = OAuthState::new(base.as_str(), None)
        .await
        .map_err(|e| McpcError::Network(format!("oauth discovery: {e}")))?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(McpcError::io)?;
    let addr = listener.local_addr().map_err(McpcError::io)?;
    let redirect_uri = format!("http://{addr}/callback");

    let scopes = scopes.unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]);
    let scope_refs: Vec<&str> = scopes.iter().map(String::as_str).collect();
    state
        .start_authorization(&scope_refs, &redirect_uri, Some(name))
        .await
        .map_err(|e| McpcError::Network(format!("starting authorization: {e}")))?;
    let auth_url = state
        .get_authorization_url()
        .await
        .map_err(|e| McpcError::Network(format!("building authorization url: {e}")))?;

    let (tx, rx) = tokio::sync::oneshot::channel::<CallbackQuery>();
    let tx_shared = std::sync::Arc::new(Mutex::new(Some(tx)));
    let app = Router::new().route(
        "/callback",
        get(move |Query(q): Query<CallbackQuery>| {
            let tx_shared = tx_shared.clone();
            async move {
                if let Some(sender) = tx_shared.lock().unwrap().take() {
                    let _ = sender.send(q);
                }
                Html("<html><body>Authorization complete. You can close this window.</body></html>")
            }
        }),
    );
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(target = "login", "callback server error: {e}");
        }
    });
    drop(server); // detach: the listener is single-shot, the task exits once the process does

    browser.open(&auth_url).await?;

    let callback = rx
        .await
        .map_err(|_| McpcError::Network("oauth callback channel closed before a request arrived".to_string()))?;

    state
        .handle_callback(&callback.code, callback.state.as_deref().unwrap_or(""))
        .await
        .map_err(|e| McpcError::Auth(format!("oauth code exchange failed: {e}")))?;

    let (client_id, creds) = state
        .get_credentials()
        .await
        .map_err(|e| McpcError::Network(format!("fetching oauth credentials: {e}")))?;
    let creds = creds.ok_or_else(|| McpcError::Auth("oauth exchange produced no credentials".to_string()))?;

    let host = canonical_host(server_url);
    let now = Utc::now();
    // `auth:<host>:<profile>:tokens` holds the bare refresh token (the value
    // `bridge_manager::deliver_auth_credentials` reads and forwards verbatim
    // over IPC as `AuthCredentials.refreshToken`); the daemon's own transport
    // exchanges it for access tokens via `rmcp`'s `AuthorizationManager`.
    let refresh_token = creds
        .refresh_token()
        .map(|t| t.secret().clone())
        .ok_or_else(|| McpcError::Auth("oauth exchange produced no refresh token".to_string()))?;
    keychain
        .put(Namespace::AuthTokens, &tokens_key(&host, name), &refresh_token)
        .map_err(|e| McpcError::Fatal(e.to_string()))?;
    keychain
        .put(Namespace::AuthClient, &client_key(&host, name), &client_id)
        .map_err(|e| McpcError::Fatal(e.to_string()))?;

    let profile = AuthProfile {
        name: name.to_string(),
        server_url: server_url.to_string(),
        oauth_issuer: base.to_string(),
        scopes: Some(scopes),
        created_at: now,
        authenticated_at: now,
        refreshed_at: None,
    };
    profile::save(pp, profile.clone())?;
    Ok(profile)
}

/// Removes the profile record and its keychain-held tokens/client
/// registration (§3 AuthProfile invariant). Idempotent: logging out of a
/// profile that was never created, or already removed, succeeds.
pub fn logout(pp: &dyn PathProvider, keychain: &dyn KeychainStore, name: &str) -> Result<(), McpcError> {
    let host = profile::get(pp, name)?
        .map(|p| canonical_host(&p.server_url))
        .unwrap_or_default();
    profile::remove(pp, keychain, &host, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychainStore;
    use crate::paths::TempPathProvider;

    #[test]
    fn logout_on_missing_profile_is_idempotent() {
        let pp = TempPathProvider::new("login-logout-missing");
        let keychain = MemoryKeychainStore::new();
        logout(&pp, &keychain, "default").unwrap();
        logout(&pp, &keychain, "default").unwrap();
    }

    #[test]
    fn logout_removes_saved_profile() {
        let pp = TempPathProvider::new("login-logout-saved");
        let keychain = MemoryKeychainStore::new();
        let now = Utc::now();
        profile::save(
            &pp,
            AuthProfile {
                name: "default".to_string(),
                server_url: "https://mcp.example.com".to_string(),
                oauth_issuer: "https://mcp.example.com".to_string(),
                scopes: None,
                created_at: now,
                authenticated_at: now,
                refreshed_at: None,
            },
        )
        .unwrap();
        keychain
            .put(Namespace::AuthTokens, &tokens_key("mcp.example.com", "default"), "{}")
            .unwrap();
        logout(&pp, &keychain, "default").unwrap();
        assert!(profile::get(&pp, "default").unwrap().is_none());
        assert!(keychain
            .get(Namespace::AuthTokens, &tokens_key("mcp.example.com", "default"))
            .unwrap()
            .is_none());
    }
}
