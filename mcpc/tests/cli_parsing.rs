//! Integration test for the `clap` derive surface (C10's argument parsing).
//! Exercises the CLI end to end through `Cli::try_parse_from` rather than
//! unit-testing `cli.rs` in isolation, the same way the teacher's own
//! `tests/*.rs` drive whole commands rather than their internal helpers.

use clap::Parser;
use mcpc::cli::{Cli, Command, SessionAction};

fn parse(args: &[&str]) -> Cli {
    let mut full = vec!["mcpc"];
    full.extend_from_slice(args);
    Cli::try_parse_from(full).expect("expected these arguments to parse")
}

#[test]
fn connect_with_a_positional_url_flattens_alongside_the_session_name() {
    let cli = parse(&["connect", "@x", "https://mcp.example.com"]);
    match cli.command {
        Command::Connect { name, server } => {
            assert_eq!(name, "@x");
            assert_eq!(server.url.as_deref(), Some("https://mcp.example.com"));
            assert!(server.command.is_none());
        }
        _ => panic!("expected Connect"),
    }
}

#[test]
fn connect_with_a_stdio_command_and_repeated_args_and_env() {
    let cli = parse(&[
        "connect",
        "@x",
        "--command",
        "my-server",
        "--arg",
        "serve",
        "--arg",
        "fast",
        "--env",
        "FOO=bar",
    ]);
    match cli.command {
        Command::Connect { name, server } => {
            assert_eq!(name, "@x");
            assert!(server.url.is_none());
            assert_eq!(server.command.as_deref(), Some("my-server"));
            assert_eq!(server.args, vec!["serve", "fast"]);
            assert_eq!(server.env, vec!["FOO=bar"]);
        }
        _ => panic!("expected Connect"),
    }
}

#[test]
fn connect_with_repeated_headers_and_a_timeout() {
    let cli = parse(&[
        "connect",
        "@x",
        "https://mcp.example.com",
        "--header",
        "Authorization: Bearer abc",
        "--header",
        "X-Trace: 1",
        "--timeout-seconds",
        "30",
        "--profile",
        "work",
    ]);
    match cli.command {
        Command::Connect { server, .. } => {
            assert_eq!(server.headers, vec!["Authorization: Bearer abc", "X-Trace: 1"]);
            assert_eq!(server.timeout_seconds, Some(30));
            assert_eq!(server.profile.as_deref(), Some("work"));
        }
        _ => panic!("expected Connect"),
    }
}

#[test]
fn global_flags_parse_before_and_after_the_subcommand() {
    let before = parse(&["--json", "--verbose", "tools-list", "@x"]);
    assert!(before.json);
    assert!(before.verbose);

    let after = parse(&["tools-list", "@x", "--json"]);
    assert!(after.json);
}

#[test]
fn tools_call_accepts_an_optional_arguments_json_blob() {
    let cli = parse(&["tools-call", "@x", "search", "--arguments", "{\"query\":\"rust\"}"]);
    match cli.command {
        Command::ToolsCall { name, tool, arguments } => {
            assert_eq!(name, "@x");
            assert_eq!(tool, "search");
            assert_eq!(arguments.as_deref(), Some("{\"query\":\"rust\"}"));
        }
        _ => panic!("expected ToolsCall"),
    }
}

#[test]
fn session_shell_is_a_nested_subcommand() {
    let cli = parse(&["session", "shell", "@x"]);
    match cli.command {
        Command::Session { action: SessionAction::Shell { name } } => assert_eq!(name, "@x"),
        _ => panic!("expected Session::Shell"),
    }
}

#[test]
fn login_collects_repeated_scope_flags() {
    let cli = parse(&["login", "work", "https://mcp.example.com", "--scope", "mcp", "--scope", "offline_access"]);
    match cli.command {
        Command::Login { name, url, scopes } => {
            assert_eq!(name, "work");
            assert_eq!(url, "https://mcp.example.com");
            assert_eq!(scopes, vec!["mcp", "offline_access"]);
        }
        _ => panic!("expected Login"),
    }
}

#[test]
fn clean_and_status_take_no_or_optional_arguments() {
    assert!(matches!(parse(&["clean"]).command, Command::Clean));
    match parse(&["status"]).command {
        Command::Status { name } => assert!(name.is_none()),
        _ => panic!("expected Status"),
    }
    match parse(&["status", "@x"]).command {
        Command::Status { name } => assert_eq!(name.as_deref(), Some("@x")),
        _ => panic!("expected Status"),
    }
}
