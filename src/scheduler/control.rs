//! Blocking control-socket event loop driving the scheduler.
//!
//! The dispatcher owns the connection: it greets with the server-name list,
//! then streams newline-delimited events. A token containing `F` is a
//! completion (name = the token with every `F` removed); anything else is a
//! `"name,size"` submission. The loop is deliberately single-threaded; its
//! only suspension point is the socket read, bounded by a short timeout.

use crate::logger::Logger;
use crate::scheduler::core::{now_ms, Scheduler};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const RECV_BUFFER_SIZE: usize = 4096;
const SOCKET_TIMEOUT: Duration = Duration::from_micros(100);
const YIELD_SLEEP: Duration = Duration::from_micros(10);
const TIMEOUT_CHECK_INTERVAL: u64 = 10;

/// Cumulative time spent inside scheduling decisions, reported as the
/// final diagnostic when the loop shuts down.
#[derive(Debug, Default, Clone)]
pub struct DispatchTimers {
    pub next_calls: u64,
    pub next_nanos: u128,
    pub timeout_calls: u64,
    pub timeout_nanos: u128,
}

impl fmt::Display for DispatchTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatch: {} calls in {:.3} ms, timeout: {} calls in {:.3} ms",
            self.next_calls,
            self.next_nanos as f64 / 1e6,
            self.timeout_calls,
            self.timeout_nanos as f64 / 1e6,
        )
    }
}

/// Drives the scheduler against the dispatcher at `127.0.0.1:port` until
/// the peer closes or `shutdown` is raised. Only connection setup can
/// fail; everything after is logged and survived.
pub fn run(port: u16, logger: &Logger, shutdown: &AtomicBool) -> io::Result<DispatchTimers> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))?;
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;

    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    let Some(names) = read_greeting(&mut stream, &mut buffer, shutdown)? else {
        return Ok(DispatchTimers::default());
    };
    logger.info(&format!("Scheduling for servers: {}", names.join(",")));

    let mut scheduler = Scheduler::new(names, now_ms());
    let mut timers = DispatchTimers::default();
    let mut iteration: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(len) => handle_batch(&buffer[..len], &mut scheduler, &mut stream, logger, &mut timers),
            Err(error) if retriable(&error) => {}
            Err(error) => logger.warn(&format!("Receive failed: {error}")),
        }

        iteration += 1;
        if iteration % TIMEOUT_CHECK_INTERVAL == 0 {
            let started = Instant::now();
            let line = scheduler.handle_timeout(now_ms());
            timers.timeout_calls += 1;
            timers.timeout_nanos += started.elapsed().as_nanos();
            if let Some(line) = line {
                send(&mut stream, line.as_bytes(), logger);
            }
        }

        thread::sleep(YIELD_SLEEP);
    }

    Ok(timers)
}

/// Waits for the dispatcher's comma-delimited server-name list. Returns
/// `None` when shutdown is raised before the greeting arrives.
fn read_greeting(
    stream: &mut TcpStream,
    buffer: &mut [u8],
    shutdown: &AtomicBool,
) -> io::Result<Option<Vec<String>>> {
    while !shutdown.load(Ordering::Relaxed) {
        match stream.read(buffer) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "dispatcher closed before greeting",
                ))
            }
            Ok(len) => return Ok(Some(parse_greeting(&buffer[..len]))),
            Err(error) if retriable(&error) => thread::sleep(YIELD_SLEEP),
            Err(error) => return Err(error),
        }
    }
    Ok(None)
}

/// Every non-empty name, including the tail with no trailing delimiter.
fn parse_greeting(bytes: &[u8]) -> Vec<String> {
    match simdutf8::basic::from_utf8(bytes) {
        Ok(text) => text
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Ingests one received chunk: completions and submissions first, then one
/// dispatch attempt per token, batched into a single write. Completions
/// made visible here can release servers the same batch's dispatches use.
fn handle_batch(
    bytes: &[u8],
    scheduler: &mut Scheduler,
    stream: &mut TcpStream,
    logger: &Logger,
    timers: &mut DispatchTimers,
) {
    let Ok(text) = simdutf8::basic::from_utf8(bytes) else {
        logger.warn("Dropped a non-UTF-8 event batch");
        return;
    };
    let now = now_ms();
    let tokens: Vec<&str> = text
        .split('\n')
        .map(|token| token.trim_end_matches('\r'))
        .filter(|token| !token.is_empty())
        .collect();

    for token in &tokens {
        match token.contains('F') {
            true => scheduler.complete(&token.replace('F', ""), now),
            false => scheduler.submit(token, now),
        }
    }

    let mut assignments = String::new();
    for _ in 0..tokens.len() {
        let started = Instant::now();
        let line = scheduler.handle_next(now);
        timers.next_calls += 1;
        timers.next_nanos += started.elapsed().as_nanos();
        if let Some(line) = line {
            assignments.push_str(&line);
        }
    }
    if !assignments.is_empty() {
        send(stream, assignments.as_bytes(), logger);
    }
}

/// One write per batch; failures are logged, never retried: the
/// dispatcher is the authority on delivery.
fn send(stream: &mut TcpStream, bytes: &[u8], logger: &Logger) {
    if let Err(error) = stream.write_all(bytes) {
        logger.warn(&format!("Send failed: {error}"));
    }
}

fn retriable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
