//! The subnegotiation seam.
//!
//! The server core implements no authentication method itself. When the
//! policy layer accepts a handshake it may attach a [`Subnegotiator`], which
//! runs the method-specific exchange and returns the capsulated stream all
//! later control traffic goes through. Accepting with `None` is the method
//! `0x00` convention: no subnegotiation, identity capsulation.

use async_trait::async_trait;

use crate::{BoxConn, Result};

/// Runs a method subnegotiation over a freshly method-selected connection.
///
/// Implementations own the stream for the duration of the call. On success
/// they return the stream to use from here on, either the original one
/// (identity capsulation) or a wrapper that frames or transforms the bytes.
///
/// Errors are classified through [`crate::Error`]: `AuthFailed` when the
/// client's credentials were rejected, `Malformed` when it violated the
/// subnegotiation framing, anything else as `Transport`. Subnegotiation owns
/// its error framing: flush any method-specific failure message before
/// returning an error, because the server sends no SOCKS5 reply of its own
/// and closes the connection a grace period later.
#[async_trait]
pub trait Subnegotiator: Send {
    async fn negotiate(self: Box<Self>, stream: BoxConn) -> Result<BoxConn>;
}
