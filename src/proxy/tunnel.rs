//! Per-connection CONNECT tunnel: validate, resolve, splice, account.

use crate::proxy::{
    context::ProxyContext,
    errors::TunnelError,
    header::{self, ConnectRequest, Version},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

const RELAY_BUFFER_SIZE: usize = 8192;
const HEADER_LIMIT: usize = 8192;

/// Runs one client connection to completion. Failures are logged here;
/// nothing propagates to the accept loop.
pub(crate) async fn serve(ctx: Arc<ProxyContext>, mut client: TcpStream) {
    if let Err(error) = tunnel(&ctx, &mut client).await {
        ctx.logger.warn_in("tunnel", &error.to_string());
    }
}

async fn tunnel(ctx: &ProxyContext, client: &mut TcpStream) -> Result<(), TunnelError> {
    let (header, residual) = read_header(client).await?;
    let request = match ConnectRequest::parse(&header) {
        Ok(request) => request,
        Err(error) => {
            // Echo the client's declared version on rejections; the
            // unsupported-version reply itself is pinned to 1.1.
            let version = match error {
                TunnelError::VersionNotSupported => Version::Http11,
                _ => header::echo_version(&header),
            };
            let _ = client.write_all(error.as_http(version)).await;
            return Err(error);
        }
    };
    ctx.logger.info(&format!(
        "Connecting to: {}:{}",
        request.hostname(),
        request.port()
    ));

    if ctx.blacklist.is_blocked(request.hostname()) {
        let error = TunnelError::Blocked(request.hostname().to_owned());
        let _ = client.write_all(error.as_http(request.version())).await;
        return Err(error);
    }

    let endpoint = match resolve(request.hostname(), request.port()).await {
        Ok(endpoint) => endpoint,
        Err(error) => {
            ctx.logger.warn_in("tunnel", &error.to_string());
            let _ = client.write_all(error.as_http(request.version())).await;
            return Err(error);
        }
    };
    let mut origin = match TcpStream::connect(endpoint).await {
        Ok(origin) => origin,
        Err(source) => {
            let error = TunnelError::ConnectFailed {
                host: request.hostname().to_owned(),
                source,
            };
            ctx.logger.warn_in("tunnel", &error.to_string());
            let _ = client.write_all(error.as_http(request.version())).await;
            return Err(error);
        }
    };

    let established = format!(
        "HTTP/1.{} 200 Connection established\r\n\r\n",
        request.version().minor()
    );
    client.write_all(established.as_bytes()).await?;
    if !residual.is_empty() {
        origin.write_all(&residual).await?;
    }

    let started = Instant::now();
    let (client_read, client_write) = client.split();
    let (origin_read, origin_write) = origin.split();
    let (sent, received) = tokio::join!(
        relay_half(client_read, origin_write),
        relay_half(origin_read, client_write),
    );

    let total = sent + received + residual.len() as u64;
    let telemetry = format!(
        "Hostname: {}, Size: {} bytes, Time: {:.3} sec",
        request.hostname(),
        total,
        started.elapsed().as_secs_f64()
    );
    ctx.logger.info(&telemetry);
    if ctx.telemetry {
        println!("{telemetry}");
    }
    Ok(())
}

/// Reads through the end of the header block; anything received past the
/// blank line is returned for forwarding to the origin.
async fn read_header(client: &mut TcpStream) -> Result<(String, Vec<u8>), TunnelError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let read = client.read(&mut chunk).await?;
        if read == 0 {
            return Err(TunnelError::BadRequest);
        }
        buffer.extend_from_slice(&chunk[..read]);

        if let Some(end) = header::header_end(&buffer) {
            let residual = buffer.split_off(end);
            let header = match simdutf8::basic::from_utf8(&buffer) {
                Ok(text) => text.to_owned(),
                Err(_) => return Err(TunnelError::BadRequest),
            };
            return Ok((header, residual));
        }
        if buffer.len() > HEADER_LIMIT {
            return Err(TunnelError::BadRequest);
        }
    }
}

/// First resolved address wins, as with a resolver query iterator.
async fn resolve(hostname: &str, port: u16) -> Result<SocketAddr, TunnelError> {
    let mut addresses = lookup_host((hostname, port))
        .await
        .map_err(|error| TunnelError::NameResolution(format!("{hostname}|{error}")))?;
    addresses
        .next()
        .ok_or_else(|| TunnelError::NameResolution(hostname.to_owned()))
}

/// Copies one direction until EOF or error, then propagates the shutdown
/// to the peer's write half. Returns the bytes moved.
async fn relay_half<R, W>(mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        if writer.write_all(&buffer[..read]).await.is_err() {
            break;
        }
        total += read as u64;
    }
    let _ = writer.shutdown().await;
    total
}
