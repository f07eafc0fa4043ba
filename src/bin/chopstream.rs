//! chopstream daemon.
//!
//! Usage: chopstream <mode> <up_address> (<down_address> <steg>)...
//!
//!   mode ~ client|socks|server
//!
//! One steganographer name is required per downstream address. Default
//! ports: 48988 (client), 23548 (socks), 11253 (server).

use std::env;
use std::process::ExitCode;

use chopstream::config::USAGE;
use chopstream::net::Daemon;
use chopstream::Config;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(level_from_env())
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    let cfg = match Config::from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(mode = ?cfg.mode, up = %cfg.up_addr, downstreams = cfg.downstreams.len(), "starting");

    match Daemon::new(cfg).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn level_from_env() -> tracing::Level {
    match env::var("CHOPSTREAM_LOG").ok().as_deref() {
        Some("trace") => tracing::Level::TRACE,
        Some("debug") => tracing::Level::DEBUG,
        Some("warn") => tracing::Level::WARN,
        Some("error") => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
