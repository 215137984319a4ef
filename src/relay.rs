//! Bidirectional byte relay between the capsulated client stream and the
//! outbound connection.

use std::io;

use crate::BoxConn;

/// Copies both directions until either one finishes, then drops (and thereby
/// closes) both streams.
///
/// The outcome of the first direction to finish is the relay's single
/// result: `None` for a clean EOF, `Some(err)` otherwise. Whatever happens
/// to the second direction afterwards is suppressed. The relay imposes no
/// timeout of its own; idle handling belongs to whoever dialed the outbound
/// side.
pub(crate) async fn run(client: BoxConn, outbound: BoxConn) -> Option<io::Error> {
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut outbound_rd, mut outbound_wr) = tokio::io::split(outbound);

    let outcome = tokio::select! {
        res = tokio::io::copy(&mut client_rd, &mut outbound_wr) => res,
        res = tokio::io::copy(&mut outbound_rd, &mut client_wr) => res,
    };

    outcome.err()
}
