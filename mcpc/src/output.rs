//! Presentation layer (§7 "user-visible failure", out of scope for the core
//! per spec.md). MCP payload pretty-printing is intentionally shallow: JSON
//! mode dumps the raw `serde_json::Value` result, human mode prints a short
//! summary line plus indented JSON.

use mcpc_core::error::McpcError;

pub struct Output {
    pub json: bool,
    pub verbose: bool,
}

impl Output {
    pub fn success(&self, summary: &str, value: &serde_json::Value) {
        if self.json {
            println!("{}", serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()));
        } else {
            println!("{summary}");
            if !value.is_null() {
                println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
            }
        }
    }

    /// Prints the failure and returns the process exit code (§6: 0 success,
    /// 1 client, 2 server, 3 network, 4 auth; fatal errors also exit 1).
    /// The extra detail `Display` adds over `message()` (e.g. a wrapped
    /// network cause) only surfaces in human mode when `--verbose` was
    /// passed.
    pub fn failure(&self, err: &McpcError) -> i32 {
        if self.json {
            let payload = serde_json::json!({"error": err.message(), "code": err.code()});
            eprintln!("{}", serde_json::to_string(&payload).unwrap_or_default());
        } else if self.verbose {
            eprintln!("\x1b[31merror:\x1b[0m {err}");
        } else {
            eprintln!("\x1b[31merror:\x1b[0m {}", err.message());
        }
        err.exit_code()
    }
}
