use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::auth::Subnegotiator;
use crate::protocol::AuthMethod;

/// A handshake's outcome, carried back to the connection driver.
pub(crate) enum HandshakeDecision {
    Accept {
        method: AuthMethod,
        negotiator: Option<Box<dyn Subnegotiator>>,
    },
    Deny,
}

/// A client greeting handed to the policy layer for method selection.
///
/// Received on [`crate::Server::handshake_channel`]. Answer it with
/// [`accept`](Handshake::accept) or [`deny`](Handshake::deny); both consume
/// the handshake, so exactly one decision can ever take effect. A handshake
/// that is dropped, or answered after the server's auto-deny window has
/// elapsed, counts as denied.
pub struct Handshake {
    methods: Vec<AuthMethod>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    decision: oneshot::Sender<HandshakeDecision>,
}

impl Handshake {
    pub(crate) fn new(
        methods: Vec<AuthMethod>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> (Self, oneshot::Receiver<HandshakeDecision>) {
        let (tx, rx) = oneshot::channel();
        let handshake = Handshake {
            methods,
            local_addr,
            remote_addr,
            decision: tx,
        };
        (handshake, rx)
    }

    /// The methods the client offered, in the order it offered them.
    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods
    }

    /// Local address of the connection carrying this greeting.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The client's address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Chooses `method` and attaches the subnegotiator that will run it.
    ///
    /// `None` means no subnegotiation and identity capsulation, the method
    /// `0x00` convention. A method the client did not offer degrades to a
    /// deny, as does accepting `NoAcceptableMethods` itself.
    pub fn accept(self, method: AuthMethod, negotiator: Option<Box<dyn Subnegotiator>>) {
        let decision = if self.methods.contains(&method) && method != AuthMethod::NoAcceptableMethods
        {
            HandshakeDecision::Accept { method, negotiator }
        } else {
            HandshakeDecision::Deny
        };
        // A driver that already timed out has dropped its receiver; the
        // late decision is a no-op.
        let _ = self.decision.send(decision);
    }

    /// Rejects every offered method. The client gets the `0xFF` reply.
    pub fn deny(self) {
        let _ = self.decision.send(HandshakeDecision::Deny);
    }
}
