//! CONNECT request-header validation and parsing.

use crate::proxy::errors::TunnelError;
use memchr::memmem;
use std::collections::HashMap;

/// Default tunnel port when the CONNECT target names none.
pub(crate) const HTTPS_PORT: u16 = 443;

/// HTTP versions the tunnel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// Minor digit for `HTTP/1.x` response lines.
    pub(crate) const fn minor(self) -> u8 {
        match self {
            Version::Http10 => 0,
            Version::Http11 => 1,
        }
    }
}

/// Byte offset one past the terminating blank line, if present.
#[inline]
pub(crate) fn header_end(buffer: &[u8]) -> Option<usize> {
    memmem::find(buffer, b"\r\n\r\n").map(|index| index + 4)
}

/// Best-effort version for rejection responses: scans the raw header for
/// an `HTTP/1.x` token and echoes the minor digit, defaulting to 1.1 when
/// none is parseable. Rejected requests never reach [`ConnectRequest`], so
/// the echo works off the bytes as received.
pub(crate) fn echo_version(header: &str) -> Version {
    let bytes = header.as_bytes();
    match memmem::find(bytes, b"HTTP/1.") {
        Some(index) if bytes.get(index + 7) == Some(&b'0') => Version::Http10,
        _ => Version::Http11,
    }
}

/// A validated CONNECT request: target endpoint, protocol version, and
/// the header fields with lowercased names.
#[derive(Debug)]
pub struct ConnectRequest {
    hostname: String,
    port: u16,
    version: Version,
    options: HashMap<String, String>,
}

impl ConnectRequest {
    /// Parses a complete header block, through the terminating blank line.
    ///
    /// Rejections are ordered so the most specific status wins: a
    /// malformed block is a bad request, a well-formed non-CONNECT method
    /// is not allowed, and an unknown `HTTP/1.x` version is unsupported.
    pub fn parse(header: &str) -> Result<ConnectRequest, TunnelError> {
        let block = header
            .strip_suffix("\r\n\r\n")
            .ok_or(TunnelError::BadRequest)?;
        let mut lines = block.split("\r\n");
        let request_line = lines.next().ok_or(TunnelError::BadRequest)?;

        let mut parts = request_line.split(' ');
        let method = parts.next().ok_or(TunnelError::BadRequest)?;
        let target = parts.next().ok_or(TunnelError::BadRequest)?;
        let protocol = parts.next().ok_or(TunnelError::BadRequest)?;
        if parts.next().is_some() {
            return Err(TunnelError::BadRequest);
        }

        if method.is_empty() || !method.bytes().all(|byte| byte.is_ascii_uppercase()) {
            return Err(TunnelError::BadRequest);
        }
        let version_text = protocol
            .strip_prefix("HTTP/")
            .filter(|text| !text.is_empty())
            .ok_or(TunnelError::BadRequest)?;

        if method != "CONNECT" {
            return Err(TunnelError::MethodNotAllowed);
        }
        let version = match version_text {
            "1.1" => Version::Http11,
            "1.0" => Version::Http10,
            _ => return Err(TunnelError::VersionNotSupported),
        };

        let (hostname, port) = match target.split_once(':') {
            Some((host, port_text)) => {
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| TunnelError::BadRequest)?;
                (host, port)
            }
            None => (target, HTTPS_PORT),
        };
        if hostname.is_empty() {
            return Err(TunnelError::BadRequest);
        }

        let mut options = HashMap::new();
        for line in lines {
            let (key, value) = line.split_once(':').ok_or(TunnelError::BadRequest)?;
            let key = key.trim();
            if key.is_empty() {
                return Err(TunnelError::BadRequest);
            }
            options.insert(key.to_ascii_lowercase(), value.trim().to_owned());
        }

        Ok(ConnectRequest {
            hostname: hostname.to_owned(),
            port,
            version,
            options,
        })
    }

    #[inline]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[inline]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Header field lookup, case-insensitive per HTTP.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}
