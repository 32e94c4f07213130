//! Bridge daemon entry point (C7). Argv: `<sessionName> <socketPath>
//! <serverJson> [--verbose] [--profile <name>] [--has-headers]`. Spawned
//! detached by the Bridge Manager (C9); never invoked directly by a human.

use std::path::PathBuf;

use mcpc_bridge::daemon;
use mcpc_core::paths::OsPathProvider;

struct Args {
    session_name: String,
    socket_path: PathBuf,
    server_json: String,
    verbose: bool,
    profile: Option<String>,
    has_headers: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let session_name = args.next().ok_or("missing sessionName")?;
    let socket_path = args.next().ok_or("missing socketPath")?;
    let server_json = args.next().ok_or("missing serverJson")?;
    let mut verbose = false;
    let mut profile = None;
    let mut has_headers = false;
    let rest: Vec<String> = args.collect();
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--verbose" => verbose = true,
            "--has-headers" => has_headers = true,
            "--profile" => {
                i += 1;
                profile = rest.get(i).cloned();
            }
            other => return Err(format!("unrecognized argument: {other}")),
        }
        i += 1;
    }
    Ok(Args {
        session_name,
        socket_path: PathBuf::from(socket_path),
        server_json,
        verbose,
        profile,
        has_headers,
    })
}

fn main() {
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("mcpc-bridge: {e}");
            std::process::exit(1);
        }
    };

    let pp = OsPathProvider;
    let log_path = mcpc_core::paths::log_path(&pp, &args.session_name);
    if mcpc_logging::init_file_logging(&log_path, args.verbose).is_err() {
        // Logging failure is not fatal on its own; fall back to stderr so the
        // daemon still produces diagnostics for its 10-second grace window.
        mcpc_logging::init_stderr_logging(args.verbose);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building tokio runtime");

    let exit_code = runtime.block_on(daemon::run(
        args.session_name,
        args.socket_path,
        args.server_json,
        args.profile,
        args.has_headers,
    ));
    std::process::exit(exit_code);
}
