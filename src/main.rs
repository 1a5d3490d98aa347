mod artifacts;
mod config;
mod db;
mod error;
mod grading;
mod ipc;
mod jobs;
mod locks;
mod render;
mod results;
mod scales;
mod scope;
mod sources;

use std::io::{self, BufRead, Write};
use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, util::SubscriberInitExt};

const LOG_ENV: &str = "RESULTSD_LOG";

fn init_logging() {
    // stdout carries the protocol; diagnostics go to stderr only.
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| Level::from_str(v.trim()).ok())
        .unwrap_or(Level::INFO);
    let fmt = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_target(false);
    tracing_subscriber::registry()
        .with(fmt)
        .with(LevelFilter::from_level(level))
        .init();
}

fn main() {
    init_logging();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "resultsd starting");

    let mut state = ipc::AppState::default();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id; report and move on.
                tracing::warn!(error = %e, "malformed request line");
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed, shutting down");
}
