//! A SOCKS5 server core that owns wire framing, connection lifecycle,
//! timeouts and relaying, but hands every policy decision to the embedder:
//! method selection, subnegotiation, outbound dialing, UDP association and
//! BIND listener management all happen outside the library, through bounded
//! handoff channels.
//!
//! Start a [`Server`], take its [`Server::handshake_channel`] and
//! [`Server::request_channel`] receivers, and answer the [`Handshake`] and
//! [`Request`] objects they deliver. Anything left unanswered is denied on a
//! timer, so a slow or absent policy layer can never wedge a connection.
//!
//! This split is useful when you need multi-homed BIND or UDP processing,
//! custom subnegotiation and encryption, or want to attach a special outbound
//! connection to CONNECT requests.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod auth;
mod closers;
mod driver;
mod handshake;
pub mod log;
pub mod protocol;
mod relay;
mod request;
mod server;

pub use handshake::Handshake;
pub use request::{AssociateRequest, Association, BindRequest, BoundBind, ConnectRequest, Request};
pub use server::{Config, Server};

/// Capacity of the log, handshake and request channels.
pub const CHAN_CAP: usize = 64;

/// Grace period between committing a failure reply and tearing the
/// connection down, so the client has a chance to read the reply.
pub const PERIOD_CLOSE: Duration = Duration::from_secs(3);

/// How long an undecided handshake or request waits for the policy layer
/// before it is denied.
pub const PERIOD_AUTO_DENY: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The peer violated the wire protocol.
    #[error("malformed {0}")]
    Malformed(&'static str),

    /// Subnegotiation rejected the client.
    #[error("authentication failed")]
    AuthFailed,

    /// A read or write on the underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// No policy layer answered the handoff, either because no channel was
    /// attached, the channel was full, or the decision timed out.
    #[error("{what} not handled (timeout: {timeout})")]
    NotHandled { what: &'static str, timeout: bool },

    /// The client asked for a command the server does not relay.
    #[error("command {0:#04x} not supported")]
    CmdNotSupported(u8),

    /// Operation on a handle the closer registry already evicted.
    #[error("handle already closed")]
    Closed,
}

/// A byte stream the server can negotiate and relay over.
///
/// Inbound connections, outbound connections attached by the policy layer,
/// and capsulated streams returned by subnegotiators are all [`BoxConn`].
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxConn = Box<dyn Conn>;
