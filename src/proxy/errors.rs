//! Tunnel failure taxonomy and canned client responses.

use crate::proxy::header::Version;
use std::io;

/// Everything that can end a tunnel before the relay starts.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("bad request")]
    BadRequest,
    #[error("HTTP method not supported")]
    MethodNotAllowed,
    #[error("HTTP version unsupported")]
    VersionNotSupported,
    #[error("website blocked: {0}")]
    Blocked(String),
    #[error("failed to resolve: {0}")]
    NameResolution(String),
    #[error("failed to connect: {host}")]
    ConnectFailed {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

macro_rules! canned_responses {
    ($($variant:ident: $status:literal;)*) => {
        /// Status line written to the client before closing, matched to
        /// the request's HTTP version.
        pub(crate) const fn as_http(&self, version: Version) -> &'static [u8] {
            match (self, version) { $(
                (Self::$variant { .. }, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status, "\r\n\r\n"
                ),
                (Self::$variant { .. }, Version::Http11) => concat!(
                    "HTTP/1.1 ", $status, "\r\n\r\n"
                ),
            )* }.as_bytes()
        }
    };
}

impl TunnelError {
    canned_responses! {
        BadRequest: "400 Bad Request";
        MethodNotAllowed: "405 Method Not Allowed";
        VersionNotSupported: "505 HTTP Version Not Supported";
        Blocked: "403 Forbidden";
        NameResolution: "404 Not Found";
        ConnectFailed: "502 Bad Gateway";
        Io: "502 Bad Gateway";
    }
}
