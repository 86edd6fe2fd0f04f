use anyhow::Context;
use clap::Parser;
use loadwise::proxy::server::WORKER_THREADS;
use loadwise::{Blacklist, Level, Logger, ProxyContext, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;

const LOG_PATH: &str = "./log";

/// HTTPS CONNECT tunnelling proxy.
#[derive(Parser)]
#[command(name = "proxy")]
struct Args {
    /// Listen port on all interfaces.
    port: u16,
    /// Per-tunnel telemetry on stdout: 0 (disabled) or 1 (enabled).
    #[arg(value_parser = parse_telemetry)]
    telemetry: Option<bool>,
    /// Hostname blacklist file, one substring per line.
    blacklist: Option<PathBuf>,
    /// Minimum level written to the log file: debug | info | warn | error.
    log_level: Option<Level>,
}

fn parse_telemetry(value: &str) -> Result<bool, String> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(String::from("telemetry must be 0 (disabled) or 1 (enabled)")),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let logger = Logger::open(LOG_PATH, args.log_level.unwrap_or(Level::Info))
        .context("failed to open the log file")?;
    let blacklist = match &args.blacklist {
        Some(path) => Blacklist::from_file(path)
            .with_context(|| format!("blacklist file not found: {}", path.display()))?,
        None => Blacklist::new(),
    };
    let ctx = Arc::new(ProxyContext {
        logger,
        blacklist,
        telemetry: args.telemetry.unwrap_or(false),
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(WORKER_THREADS)
        .enable_all()
        .build()
        .context("failed to build the proxy runtime")?;

    runtime.block_on(async {
        let server =
            ProxyServer::bind(args.port, ctx.clone()).context("failed to bind the listen socket")?;
        server.listen().await;
        Ok::<(), anyhow::Error>(())
    })?;

    ctx.logger.info("Gracefully stopped proxy.");
    Ok(())
}
