//! Accept loop and tunnel worker pool.
//!
//! The accept loop only admits connections; a fixed set of worker tasks
//! drains them from a shared queue and runs the tunnels. Workers are
//! created once at startup, so a connection burst costs no task spawns.

use crate::proxy::{context::ProxyContext, tunnel};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

/// Threads backing the tunnel executor.
pub const WORKER_THREADS: usize = 7;

const TUNNEL_WORKERS: usize = 100;
const LISTEN_BACKLOG: i32 = 1024;
const POLL_SLEEP: Duration = Duration::from_micros(50);

type StreamQueue = Arc<SegQueue<TcpStream>>;

/// The proxy's listening end.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    /// Binds `0.0.0.0:port` with reuse-address set. Failure here is fatal
    /// for the caller; everything later is survived.
    pub fn bind(port: u16, ctx: Arc<ProxyContext>) -> io::Result<ProxyServer> {
        let address = SocketAddr::from(([0, 0, 0, 0], port));
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&address.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(socket.into())?;

        ctx.logger.info("Server created.");
        Ok(ProxyServer { listener, ctx })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts forever. A failed accept is logged and skipped; nothing
    /// tears the loop down.
    pub async fn listen(self) {
        let queue: StreamQueue = Arc::new(SegQueue::new());
        for _ in 0..TUNNEL_WORKERS {
            Self::spawn_worker(&queue, &self.ctx);
        }
        if let Ok(address) = self.listener.local_addr() {
            self.ctx
                .logger
                .debug(&format!("Listening on port {}", address.port()));
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    self.ctx
                        .logger
                        .info(&format!("Accepted connection from {peer}."));
                    queue.push(stream);
                }
                Err(error) => self.ctx.logger.error(&error.to_string()),
            }
        }
    }

    fn spawn_worker(queue: &StreamQueue, ctx: &Arc<ProxyContext>) {
        let queue = queue.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            loop {
                match queue.pop() {
                    Some(stream) => tunnel::serve(ctx.clone(), stream).await,
                    None => sleep(POLL_SLEEP).await,
                }
            }
        });
    }
}
