//! initminal-run CLI
//!
//! Single-shot mode:
//!   initminal-run <module.js> [deps.json] [arg-json] [export] [timeout-ms]
//!
//! Server mode (persistent process, reads from stdin):
//!   initminal-run --server
//!
//! Protocol (server mode):
//!   Request (stdin, one JSON object per line):
//!     {"source":"export const initminal = (n) => n * 2","arg":21}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:27
//!
//!     {"success":true,"value":42}
//!
//!   Error response:
//!     Status:Error
//!     Length:55
//!
//!     {"success":false,"error":{"kind":"error-eval-timeout"}}
//!
//! Sandbox settings come from `INITMINAL_*` environment variables; logs go
//! to stderr and are filtered with `RUST_LOG`.

use anyhow::{anyhow, Context, Result};
use initminal_run::{create_sandbox, Dependencies, EvalResult, Job, Sandbox, SandboxConfig};
use serde::Deserialize;
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("initminal-run - Evaluate untrusted ES modules in a whitelisted V8 isolate");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  initminal-run <module.js> [deps.json] [arg-json] [export] [timeout-ms]");
    eprintln!();
    eprintln!("Server mode (persistent process, one JSON job per stdin line):");
    eprintln!("  initminal-run --server");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  initminal-run ./double.js '' '21'");
    eprintln!("  initminal-run ./chunk.js ./deps.json '[[\"a\",\"b\",\"c\"],2]' main 5000");
}

/// One job in server mode.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerRequest {
    source: String,
    #[serde(default)]
    dependencies: Dependencies,
    #[serde(default)]
    arg: Option<Value>,
    #[serde(default)]
    call_target: Option<String>,
    /// Milliseconds
    #[serde(default)]
    timeout: Option<u64>,
}

impl ServerRequest {
    fn into_job(self) -> Job {
        let mut job = Job::new(self.source).dependencies(self.dependencies);
        if let Some(arg) = self.arg {
            job = job.arg(arg);
        }
        if let Some(call_target) = self.call_target {
            job = job.call_target(call_target);
        }
        if let Some(ms) = self.timeout {
            job = job.timeout(Duration::from_millis(ms));
        }
        job
    }
}

/// Read a `{"name": "location or source"}` JSON file.
fn load_dependencies(path: &Path) -> Result<Dependencies> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dependencies file '{}'", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("Invalid dependencies JSON in '{}': {}", path.display(), e))
}

/// Run in single-shot mode
async fn run_single_shot(sandbox: &Sandbox, args: &[String]) -> Result<bool> {
    let module_path = Path::new(&args[0]);
    let source = std::fs::read_to_string(module_path)
        .with_context(|| format!("Failed to read module '{}'", module_path.display()))?;

    let mut job = Job::new(source);

    if let Some(deps_path) = args.get(1).filter(|p| !p.is_empty()) {
        job = job.dependencies(load_dependencies(Path::new(deps_path))?);
    }
    if let Some(arg_json) = args.get(2).filter(|a| !a.is_empty()) {
        let arg: Value = serde_json::from_str(arg_json).map_err(|e| anyhow!("Invalid arg JSON: {}", e))?;
        job = job.arg(arg);
    }
    if let Some(export) = args.get(3).filter(|e| !e.is_empty()) {
        job = job.call_target(export.as_str());
    }
    if let Some(ms) = args.get(4) {
        let ms: u64 = ms.parse().map_err(|e| anyhow!("Invalid timeout '{}': {}", ms, e))?;
        job = job.timeout(Duration::from_millis(ms));
    }

    let result = sandbox.run(job).await;
    println!("{}", serde_json::to_string(&result)?);

    Ok(result.is_success())
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server(sandbox: &Sandbox) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    tracing::info!("server ready, reading from stdin");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: ServerRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let error_msg = format!("Invalid request JSON: {}", e);
                write_response(&mut stdout, false, &error_msg)?;
                continue;
            }
        };

        let result: EvalResult = sandbox.run(request.into_job()).await;
        write_response(&mut stdout, result.is_success(), &serde_json::to_string(&result)?)?;
    }

    tracing::info!("server shutting down");
    sandbox.terminate();
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(out: &mut impl Write, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };
    let length = body.len();

    writeln!(out, "Status:{}", status)?;
    writeln!(out, "Length:{}", length)?;
    writeln!(out)?; // Empty line separator
    write!(out, "{}", body)?;
    out.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("initminal_run=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() {
        print_usage();
        return Err(anyhow!("Missing required arguments"));
    }

    let config = SandboxConfig::from_env()?;
    let sandbox = create_sandbox(config)?;

    // Check for server mode
    if args[0] == "--server" {
        return run_server(&sandbox).await;
    }

    if args[0].starts_with('-') {
        print_usage();
        return Err(anyhow!("Unknown option '{}'", args[0]));
    }

    if !run_single_shot(&sandbox, &args).await? {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_server_request_defaults() {
        let request: ServerRequest = serde_json::from_str(r#"{"source":"export const initminal = 1"}"#).unwrap();
        let job = request.into_job();
        assert_eq!(job.call_target, "initminal");
        assert!(job.dependencies.is_empty());
        assert!(job.timeout.is_none());
    }

    #[test]
    fn test_server_request_fields() {
        let request: ServerRequest = serde_json::from_str(
            r#"{"source":"s","dependencies":{"lodash":"https://cdn.example.com/lodash.js"},"arg":[1,2],"callTarget":"main","timeout":50}"#,
        )
        .unwrap();
        let job = request.into_job();
        assert_eq!(job.arg, Some(json!([1, 2])));
        assert_eq!(job.call_target, "main");
        assert_eq!(job.timeout, Some(Duration::from_millis(50)));
        assert_eq!(job.dependencies.len(), 1);
    }

    #[test]
    fn test_load_dependencies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.json");
        fs::write(&path, r#"{"lodash": "https://cdn.example.com/lodash.js"}"#).unwrap();

        let deps = load_dependencies(&path).unwrap();
        assert_eq!(deps.get("lodash").map(String::as_str), Some("https://cdn.example.com/lodash.js"));
    }

    #[test]
    fn test_load_dependencies_rejects_bad_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deps.json");
        fs::write(&path, "[1, 2]").unwrap();

        assert!(load_dependencies(&path).is_err());
        assert!(load_dependencies(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_write_response_framing() {
        let mut out = Vec::new();
        write_response(&mut out, true, r#"{"success":true,"value":42}"#).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Status:Ok\nLength:27\n\n{\"success\":true,\"value\":42}"
        );
    }
}
