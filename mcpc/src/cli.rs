//! Argument parsing (out of scope for the core per spec.md, named here as
//! the "thin human/JSON presentation layer" the workspace shape describes).
//! Clap derive mirrors the subcommand surface C10 exposes plus the
//! supplemented `login`/`logout`/`status`/`session shell` commands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mcpc", about = "Command-line client for the Model Context Protocol")]
pub struct Cli {
    /// Emit machine-readable JSON instead of human-formatted text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose logging to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct ServerTarget {
    /// HTTP(S) URL of the MCP server (mutually exclusive with `--command`).
    pub url: Option<String>,

    /// Launch a stdio MCP server instead of connecting over HTTP.
    #[arg(long)]
    pub command: Option<String>,

    /// Argument for the stdio server command; may be repeated.
    #[arg(long = "arg")]
    pub args: Vec<String>,

    /// `KEY=VALUE` environment variable for the stdio server; may be repeated.
    #[arg(long)]
    pub env: Vec<String>,

    /// `Header: value` to attach to every HTTP request; may be repeated.
    /// Never written to the session registry or the bridge's argv.
    #[arg(long = "header")]
    pub headers: Vec<String>,

    /// HTTP request timeout in seconds.
    #[arg(long)]
    pub timeout_seconds: Option<u64>,

    /// Name of a profile created by `mcpc login` to supply OAuth credentials.
    #[arg(long)]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create or reconnect a named session against an MCP server.
    Connect {
        /// Session name, e.g. `@x`.
        name: String,
        #[command(flatten)]
        server: ServerTarget,
    },
    /// List the tools exposed by a session's MCP server.
    ToolsList { name: String },
    /// Invoke a tool on a session's MCP server.
    ToolsCall {
        name: String,
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long)]
        arguments: Option<String>,
    },
    /// List the resources exposed by a session's MCP server.
    ResourcesList { name: String },
    /// List the prompts exposed by a session's MCP server.
    PromptsList { name: String },
    /// Stop a session's bridge and remove it from the registry.
    Close { name: String },
    /// Stop a session's bridge but keep the registry record and credentials.
    Stop { name: String },
    /// Run a non-destructive consolidation pass and report registry health.
    Status {
        /// Limit the report to one session.
        name: Option<String>,
    },
    /// Run a destructive consolidation pass, purging expired sessions.
    Clean,
    /// Run the OAuth 2.1 browser flow and save the resulting profile.
    Login {
        /// Profile name to save the credentials under.
        name: String,
        /// MCP server URL whose issuer will be discovered.
        url: String,
        /// OAuth scope to request; may be repeated. Defaults to `mcp`.
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },
    /// Remove a profile and its keychain-held credentials.
    Logout { name: String },
    /// Open a sustained connection to a session and exchange newline-delimited
    /// JSON-RPC-shaped requests/responses over stdin/stdout.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
pub enum SessionAction {
    Shell { name: String },
}

/// Resolves the `mcpc-bridge` binary as a sibling of the running `mcpc`
/// executable, overridable for development via `MCPC_BRIDGE_PATH`.
pub fn bridge_executable_path() -> PathBuf {
    if let Ok(p) = std::env::var("MCPC_BRIDGE_PATH") {
        return PathBuf::from(p);
    }
    let name = if cfg!(windows) { "mcpc-bridge.exe" } else { "mcpc-bridge" };
    match std::env::current_exe() {
        Ok(mut exe) => {
            exe.pop();
            exe.join(name)
        }
        Err(_) => PathBuf::from(name),
    }
}
