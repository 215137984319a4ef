use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::closers::{CloserKind, Closers};
use crate::driver::Driver;
use crate::handshake::Handshake;
use crate::log::{LogEntry, Severity};
use crate::request::Request;
use crate::{Error, Result, CHAN_CAP, PERIOD_AUTO_DENY, PERIOD_CLOSE};

/// Server policy knobs. The defaults are the crate constants; embedders with
/// different decision windows override them before starting the server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the log, handshake and request channels.
    pub chan_cap: usize,
    /// Grace between a committed failure reply and the connection teardown.
    pub period_close: Duration,
    /// How long an undecided handshake or request phase waits before it is
    /// denied.
    pub period_auto_deny: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chan_cap: CHAN_CAP,
            period_close: PERIOD_CLOSE,
            period_auto_deny: PERIOD_AUTO_DENY,
        }
    }
}

/// A lazily created channel whose receiver is handed out once.
struct ChannelSlot<T> {
    tx: Option<mpsc::Sender<T>>,
    rx: Option<mpsc::Receiver<T>>,
}

impl<T> Default for ChannelSlot<T> {
    fn default() -> Self {
        ChannelSlot { tx: None, rx: None }
    }
}

impl<T> ChannelSlot<T> {
    fn take_receiver(&mut self, cap: usize) -> Option<mpsc::Receiver<T>> {
        if self.tx.is_none() {
            let (tx, rx) = mpsc::channel(cap);
            self.tx = Some(tx);
            self.rx = Some(rx);
        }
        self.rx.take()
    }

    fn sender(&self) -> Option<mpsc::Sender<T>> {
        self.tx.clone()
    }
}

#[derive(Default)]
struct State {
    started: bool,
    down: bool,
    bound: Option<SocketAddr>,
    listener_id: Option<u64>,
    closers: Closers,
    log: ChannelSlot<LogEntry>,
    handshakes: ChannelSlot<Handshake>,
    requests: ChannelSlot<Request>,
}

/// Everything the acceptor, the drivers and the embedder-facing handle
/// share. One mutex guards the registry, the flags and the channel slots.
pub(crate) struct Shared {
    pub(crate) config: Config,
    state: Mutex<State>,
}

impl Shared {
    /// Emits a log record on the log channel, if one is attached, and
    /// mirrors it to `tracing` either way. Full channel drops the entry.
    pub(crate) fn log(
        &self,
        severity: Severity,
        op: &'static str,
        endpoint: Option<SocketAddr>,
        cause: Option<Error>,
    ) {
        match severity {
            Severity::Debug => debug!(?endpoint, ?cause, "{}", op),
            Severity::Info => info!(?endpoint, ?cause, "{}", op),
            Severity::Warn => warn!(?endpoint, ?cause, "{}", op),
            Severity::Error => error!(?endpoint, ?cause, "{}", op),
        }

        let tx = self.state.lock().log.sender();
        if let Some(tx) = tx {
            let _ = tx.try_send(LogEntry {
                severity,
                op,
                endpoint,
                cause,
            });
        }
    }

    /// Non-blocking handoff of a greeting to the policy layer. `false`
    /// means no channel, a full channel, or a server already going down;
    /// the caller denies.
    pub(crate) fn offer_handshake(&self, handshake: Handshake) -> bool {
        let tx = {
            let state = self.state.lock();
            if state.down {
                return false;
            }
            state.handshakes.sender()
        };
        match tx {
            Some(tx) => tx.try_send(handshake).is_ok(),
            None => false,
        }
    }

    /// Same discipline for decoded requests.
    pub(crate) fn offer_request(&self, request: Request) -> bool {
        let tx = {
            let state = self.state.lock();
            if state.down {
                return false;
            }
            state.requests.sender()
        };
        match tx {
            Some(tx) => tx.try_send(request).is_ok(),
            None => false,
        }
    }

    /// Registers a connection's cancellation token. `None` when the server
    /// is going down and no new connections are admitted.
    pub(crate) fn register_connection(&self, token: CancellationToken) -> Option<u64> {
        let mut state = self.state.lock();
        if state.down {
            return None;
        }
        Some(state.closers.register(CloserKind::Connection, token))
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.state.lock().closers.deregister(id);
    }
}

/// A SOCKS5 server that owns the protocol and delegates every decision.
///
/// Cloning yields another handle to the same server. Use the channel
/// accessors to receive [`Handshake`] and [`Request`] objects and
/// [`LogEntry`] records; each receiver can be taken exactly once. With no
/// handshake channel attached every connection is denied, which makes an
/// unconfigured server safe by default.
#[derive(Clone, Default)]
pub struct Server {
    pub(crate) shared: Arc<Shared>,
}

impl Default for Shared {
    fn default() -> Self {
        Shared {
            config: Config::default(),
            state: Mutex::new(State::default()),
        }
    }
}

impl Server {
    pub fn new() -> Self {
        Server::default()
    }

    pub fn with_config(config: Config) -> Self {
        Server {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Binds, listens and spawns the acceptor. No-op if already started.
    pub async fn start<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        if self.shared.state.lock().started {
            return Ok(());
        }

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let token = CancellationToken::new();

        {
            let mut state = self.shared.state.lock();
            state.started = true;
            state.bound = Some(local);
            state.listener_id = Some(state.closers.register(CloserKind::Listener, token.clone()));
        }
        self.shared
            .log(Severity::Info, "server started", Some(local), None);

        tokio::spawn(listen(Arc::clone(&self.shared), listener, local, token));
        Ok(())
    }

    /// True iff started and not shut down.
    pub fn running(&self) -> bool {
        let state = self.shared.state.lock();
        state.started && !state.down
    }

    /// The listener's bound address, or `None` before [`start`](Server::start).
    pub fn addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().bound
    }

    /// Stops accepting and closes the listener. Established connections
    /// survive.
    pub fn close(&self) {
        let closed = {
            let mut state = self.shared.state.lock();
            state.down = true;
            let bound = state.bound;
            match state.listener_id.take() {
                Some(id) => state.closers.close(id).map(|_| bound),
                None => None,
            }
        };
        self.shared
            .log(Severity::Info, "server shut down", None, None);
        if let Some(bound) = closed {
            self.shared
                .log(Severity::Info, "close listener", bound, None);
        }
    }

    /// Closes the listener and every tracked connection. Drivers suspended
    /// in reads or relays are forced to unwind, which closes their sockets.
    pub fn close_all(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            state.down = true;
            state.listener_id = None;
            state.closers.drain()
        };
        self.shared
            .log(Severity::Info, "server shut down", None, None);
        for (kind, token) in drained {
            match kind {
                CloserKind::Listener => {
                    self.shared
                        .log(Severity::Info, "close listener", None, None)
                }
                CloserKind::Connection => {
                    self.shared
                        .log(Severity::Info, "close connection", None, None)
                }
            }
            token.cancel();
        }
    }

    /// The log channel. Created on first call; the receiver can be taken
    /// once, later calls return `None`. Without it, entries only go to
    /// `tracing`.
    pub fn log_channel(&self) -> Option<mpsc::Receiver<LogEntry>> {
        let cap = self.shared.config.chan_cap;
        self.shared.state.lock().log.take_receiver(cap)
    }

    /// The handshake channel. Created on first call; the receiver can be
    /// taken once. Without it, every greeting is denied.
    pub fn handshake_channel(&self) -> Option<mpsc::Receiver<Handshake>> {
        let cap = self.shared.config.chan_cap;
        self.shared.state.lock().handshakes.take_receiver(cap)
    }

    /// The request channel. Created on first call; the receiver can be
    /// taken once. Without it, every request is denied.
    pub fn request_channel(&self) -> Option<mpsc::Receiver<Request>> {
        let cap = self.shared.config.chan_cap;
        self.shared.state.lock().requests.take_receiver(cap)
    }
}

/// The accept loop. Exits silently when the listener token is cancelled
/// (that is [`Server::close`]); an accept error marks the server down.
async fn listen(
    shared: Arc<Shared>,
    listener: TcpListener,
    local: SocketAddr,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let conn_token = CancellationToken::new();
                let Some(id) = shared.register_connection(conn_token.clone()) else {
                    // Raced with shutdown; the accepted socket just drops.
                    return;
                };
                shared.log(Severity::Info, "new connection", Some(peer), None);

                let local = stream.local_addr().unwrap_or(local);
                let driver_shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let driver = Driver::new(Arc::clone(&driver_shared), local, peer);
                    tokio::select! {
                        _ = conn_token.cancelled() => {}
                        _ = driver.run(Box::new(stream)) => {}
                    }
                    driver_shared.deregister(id);
                });
            }
            Err(err) => {
                let was_down = {
                    let mut state = shared.state.lock();
                    let was_down = state.down;
                    state.down = true;
                    if let Some(id) = state.listener_id.take() {
                        state.closers.deregister(id);
                    }
                    was_down
                };
                if !was_down {
                    shared.log(Severity::Error, "listen", None, Some(err.into()));
                }
                return;
            }
        }
    }
}
