use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::protocol::{Address, Reply};
use crate::BoxConn;

/// Fields every request carries regardless of command.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub(crate) dst: Address,
    pub(crate) local_addr: SocketAddr,
    pub(crate) remote_addr: SocketAddr,
}

/// A decoded SOCKS5 request handed to the policy layer, tagged by command.
///
/// Received on [`crate::Server::request_channel`]. Every variant's accept and
/// deny operations consume the request object, so exactly one decision takes
/// effect; a request that is dropped or answered after the auto-deny window
/// counts as denied with `general failure`.
pub enum Request {
    Connect(ConnectRequest),
    Bind(BindRequest),
    Associate(AssociateRequest),
}

impl Request {
    /// Destination address, exactly as the client sent it.
    pub fn dst(&self) -> &Address {
        &self.head().dst
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.head().local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.head().remote_addr
    }

    fn head(&self) -> &RequestHead {
        match self {
            Request::Connect(r) => &r.head,
            Request::Bind(r) => &r.head,
            Request::Associate(r) => &r.head,
        }
    }
}

fn deny_reply(reply: Reply) -> Reply {
    // A deny must not commit a success code.
    if reply == Reply::Success {
        Reply::GeneralFailure
    } else {
        reply
    }
}

// ---- CONNECT ----

pub(crate) enum ConnectDecision {
    Accept { bound: Address, conn: BoxConn },
    Deny { reply: Reply, bound: Address },
}

/// A CONNECT request. Dial the destination however you see fit and attach
/// the outbound connection with [`accept`](ConnectRequest::accept).
pub struct ConnectRequest {
    pub(crate) head: RequestHead,
    decision: oneshot::Sender<ConnectDecision>,
}

impl ConnectRequest {
    pub(crate) fn new(head: RequestHead) -> (Self, oneshot::Receiver<ConnectDecision>) {
        let (tx, rx) = oneshot::channel();
        (ConnectRequest { head, decision: tx }, rx)
    }

    pub fn dst(&self) -> &Address {
        &self.head.dst
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.head.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.head.remote_addr
    }

    /// Commits a success reply advertising `bound` and hands `conn` to the
    /// server, which owns it from here on and relays through it.
    ///
    /// If the server already gave up on this request, `conn` is dropped and
    /// thereby closed.
    pub fn accept(self, bound: Address, conn: BoxConn) {
        let _ = self.decision.send(ConnectDecision::Accept { bound, conn });
    }

    /// Commits a failure reply. `Reply::from(&io::Error)` maps dial errors
    /// to a fitting code.
    pub fn deny(self, reply: Reply, bound: Address) {
        let _ = self.decision.send(ConnectDecision::Deny {
            reply: deny_reply(reply),
            bound,
        });
    }
}

// ---- BIND ----

pub(crate) enum BindFirstDecision {
    Accept { bound: Address },
    Deny { reply: Reply, bound: Address },
}

pub(crate) enum BindSecondDecision {
    Bind { peer: Address, conn: BoxConn },
    Deny { reply: Reply, bound: Address },
}

/// A BIND request. Two-phase: [`accept`](BindRequest::accept) commits the
/// first reply with the address your listener is bound on and returns the
/// [`BoundBind`] for the second phase.
pub struct BindRequest {
    pub(crate) head: RequestHead,
    first: oneshot::Sender<BindFirstDecision>,
    second: oneshot::Sender<BindSecondDecision>,
}

impl BindRequest {
    pub(crate) fn new(
        head: RequestHead,
    ) -> (
        Self,
        oneshot::Receiver<BindFirstDecision>,
        oneshot::Receiver<BindSecondDecision>,
    ) {
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        let request = BindRequest {
            head,
            first: first_tx,
            second: second_tx,
        };
        (request, first_rx, second_rx)
    }

    pub fn dst(&self) -> &Address {
        &self.head.dst
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.head.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.head.remote_addr
    }

    /// Commits the first reply: `bound` is the address the proxy listens on
    /// for the peer's inbound connection.
    ///
    /// The second phase runs under its own auto-deny window starting now, so
    /// a long listener wait needs the embedder to answer within it.
    pub fn accept(self, bound: Address) -> BoundBind {
        let _ = self.first.send(BindFirstDecision::Accept { bound });
        BoundBind {
            second: self.second,
        }
    }

    pub fn deny(self, reply: Reply, bound: Address) {
        let _ = self.first.send(BindFirstDecision::Deny {
            reply: deny_reply(reply),
            bound,
        });
    }
}

/// Second phase of an accepted BIND: the peer connection is awaited.
pub struct BoundBind {
    second: oneshot::Sender<BindSecondDecision>,
}

impl BoundBind {
    /// Commits the second reply advertising the connected peer's address and
    /// hands its connection to the server for relaying.
    pub fn bind(self, peer: Address, conn: BoxConn) {
        let _ = self.second.send(BindSecondDecision::Bind { peer, conn });
    }

    /// Fails the second phase; the client gets a failure reply and the
    /// connection is torn down.
    pub fn deny(self, reply: Reply, bound: Address) {
        let _ = self.second.send(BindSecondDecision::Deny {
            reply: deny_reply(reply),
            bound,
        });
    }
}

// ---- ASSOCIATE ----

/// Fires a callback exactly once, on explicit notification or on drop,
/// whichever comes first.
pub(crate) struct Notifier(Option<Box<dyn FnOnce() + Send>>);

impl Notifier {
    fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Notifier(Some(Box::new(f)))
    }

    pub(crate) fn notify(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

pub(crate) enum AssociateDecision {
    Accept { bound: Address, notify: Notifier },
    Deny { reply: Reply, bound: Address },
}

/// A UDP ASSOCIATE request. The core only keeps the TCP control connection
/// open; the UDP relay itself is the embedder's.
pub struct AssociateRequest {
    pub(crate) head: RequestHead,
    decision: oneshot::Sender<AssociateDecision>,
    terminate: oneshot::Sender<()>,
}

impl AssociateRequest {
    pub(crate) fn new(
        head: RequestHead,
    ) -> (
        Self,
        oneshot::Receiver<AssociateDecision>,
        oneshot::Receiver<()>,
    ) {
        let (decision_tx, decision_rx) = oneshot::channel();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let request = AssociateRequest {
            head,
            decision: decision_tx,
            terminate: terminate_tx,
        };
        (request, decision_rx, terminate_rx)
    }

    pub fn dst(&self) -> &Address {
        &self.head.dst
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.head.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.head.remote_addr
    }

    /// Commits a success reply advertising the UDP relay endpoint `bound`.
    ///
    /// `notify` fires exactly once when the control connection ends for any
    /// reason: client EOF, a transport error, `close_all`, or
    /// [`Association::terminate`]. Tear the UDP relay down when it does.
    pub fn accept(self, bound: Address, notify: impl FnOnce() + Send + 'static) -> Association {
        let _ = self.decision.send(AssociateDecision::Accept {
            bound,
            notify: Notifier::new(notify),
        });
        Association {
            terminate: self.terminate,
        }
    }

    pub fn deny(self, reply: Reply, bound: Address) {
        let _ = self.decision.send(AssociateDecision::Deny {
            reply: deny_reply(reply),
            bound,
        });
    }
}

/// Embedder-side handle to a live association. Dropping it is fine; the
/// association then lives until the control connection ends on its own.
pub struct Association {
    terminate: oneshot::Sender<()>,
}

impl Association {
    /// Ends the association: the control connection is closed and the
    /// notifier fires.
    pub fn terminate(self) {
        let _ = self.terminate.send(());
    }
}
