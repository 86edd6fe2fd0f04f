use anyhow::Context;
use clap::Parser;
use loadwise::scheduler::control;
use loadwise::{Level, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const LOG_PATH: &str = "./log";

/// Size-aware job-dispatch scheduler speaking the dispatcher control
/// socket on localhost.
#[derive(Parser)]
#[command(name = "scheduler")]
struct Args {
    /// Dispatcher control-socket port on 127.0.0.1.
    port: u16,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
        .context("failed to install the interrupt handler")?;

    let logger = Logger::open(LOG_PATH, Level::Info).context("failed to open the log file")?;
    let timers =
        control::run(args.port, &logger, &shutdown).context("control socket failure")?;

    println!("{timers}");
    Ok(())
}
