//! Structured log records emitted on the server's log channel.

use std::fmt;
use std::net::SocketAddr;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// One server event: a severity, the operation it happened in, and
/// optionally the peer it concerns and the error that caused it.
///
/// The channel imposes no format; render these however the embedder likes.
/// Delivery is lossy: entries are dropped when the channel is full.
#[derive(Debug)]
pub struct LogEntry {
    pub severity: Severity,
    pub op: &'static str,
    pub endpoint: Option<SocketAddr>,
    pub cause: Option<Error>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " {}", endpoint)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}
