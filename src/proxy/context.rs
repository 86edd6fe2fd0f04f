//! Shared proxy state, assembled once at startup.

use crate::{logger::Logger, proxy::blacklist::Blacklist};

/// Construction-time context shared by the accept loop and every tunnel.
/// The blacklist is read-only after construction and the logger serialises
/// its own writes, so the whole value is shared as-is across tasks.
pub struct ProxyContext {
    pub logger: Logger,
    pub blacklist: Blacklist,
    /// Mirror per-tunnel telemetry records to stdout.
    pub telemetry: bool,
}
