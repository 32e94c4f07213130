//! CLI entry point (C10's driver). Argument parsing and presentation are
//! out of scope for the core per spec.md; this binary is the thin layer
//! that wires `clap` to `mcpc-core`'s session/registry/login surface.

use clap::Parser;

use mcpc::cli::{self, Cli, Command, SessionAction};
use mcpc::commands;
use mcpc::output::Output;

fn main() {
    let cli = Cli::parse();
    mcpc_logging::init_stderr_logging(cli.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building tokio runtime");

    let output = Output { json: cli.json, verbose: cli.verbose };
    let exit_code = runtime.block_on(run(cli.command, &output));
    std::process::exit(exit_code);
}

async fn run(command: Command, output: &Output) -> i32 {
    let ctx = commands::Context::new(cli::bridge_executable_path());

    let result: Result<(String, serde_json::Value), mcpc_core::error::McpcError> = match command {
        Command::Connect { name, server } => commands::connect(&ctx, &name, &server)
            .await
            .map(|v| (format!("connected {name}"), v)),
        Command::ToolsList { name } => commands::call(&ctx, &name, "tools/list", None)
            .await
            .map(|v| ("tools".to_string(), v)),
        Command::ToolsCall { name, tool, arguments } => {
            let args = match arguments.map(|raw| serde_json::from_str::<serde_json::Value>(&raw)) {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    let err = mcpc_core::error::McpcError::Client(format!("invalid --arguments json: {e}"));
                    return output.failure(&err);
                }
                None => serde_json::json!({}),
            };
            let params = serde_json::json!({"name": tool, "arguments": args});
            commands::call(&ctx, &name, "tools/call", Some(params))
                .await
                .map(|v| (format!("called {tool}"), v))
        }
        Command::ResourcesList { name } => commands::call(&ctx, &name, "resources/list", None)
            .await
            .map(|v| ("resources".to_string(), v)),
        Command::PromptsList { name } => commands::call(&ctx, &name, "prompts/list", None)
            .await
            .map(|v| ("prompts".to_string(), v)),
        Command::Close { name } => commands::close(&ctx, &name).await.map(|v| (format!("closed {name}"), v)),
        Command::Stop { name } => commands::stop(&ctx, &name).await.map(|v| (format!("stopped {name}"), v)),
        Command::Clean => commands::clean(&ctx).map(|v| ("cleaned".to_string(), v)),
        Command::Status { name } => commands::status(&ctx, name.as_deref()).map(|v| ("status".to_string(), v)),
        Command::Login { name, url, scopes } => commands::login(&ctx, &name, &url, scopes)
            .await
            .map(|v| (format!("logged in {name}"), v)),
        Command::Logout { name } => commands::logout(&ctx, &name).map(|v| (format!("logged out {name}"), v)),
        Command::Session { action } => {
            let name = match action {
                SessionAction::Shell { name } => name,
            };
            match commands::session_shell(&ctx, &name).await {
                Ok(()) => Ok((format!("session {name} closed"), serde_json::Value::Null)),
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok((summary, value)) => {
            output.success(&summary, &value);
            0
        }
        Err(e) => output.failure(&e),
    }
}
