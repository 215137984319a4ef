//! The per-connection protocol state machine.
//!
//! One driver runs per accepted connection: read the greeting, hand it off
//! for a method choice, run the chosen subnegotiation, read the request,
//! hand it off for acceptance, commit the reply, then relay (CONNECT, BIND)
//! or hold the control channel (ASSOCIATE). Every handoff waits at most
//! `period_auto_deny`; every committed failure reply is followed by
//! `period_close` of grace before the connection drops.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

use crate::handshake::{Handshake, HandshakeDecision};
use crate::log::Severity;
use crate::protocol::{self, Address, AuthMethod, Command, Reply};
use crate::request::{Request, RequestHead};
use crate::server::Shared;
use crate::{BoxConn, Error};

mod associate;
mod bind;
mod connect;

pub(crate) struct Driver {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Driver {
    pub(crate) fn new(shared: Arc<Shared>, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Driver {
            shared,
            local_addr,
            peer_addr,
        }
    }

    pub(crate) async fn run(self, mut stream: BoxConn) {
        let methods = match protocol::read_greeting(&mut stream).await {
            Ok(methods) => methods,
            Err(err) => {
                self.log(Severity::Error, "read greeting", Some(err));
                self.close_now(stream);
                return;
            }
        };

        let (handshake, decision) = Handshake::new(methods, self.local_addr, self.peer_addr);
        let decision = self.select_method(handshake, decision).await;

        let (method, negotiator) = match decision {
            Some(HandshakeDecision::Accept { method, negotiator }) => (method, negotiator),
            Some(HandshakeDecision::Deny) | None => {
                // Best effort; the client may already be gone.
                let _ =
                    protocol::write_method_reply(&mut stream, AuthMethod::NoAcceptableMethods)
                        .await;
                self.grace_close(stream).await;
                return;
            }
        };

        self.log(Severity::Debug, "selected method", None);
        if let Err(err) = protocol::write_method_reply(&mut stream, method).await {
            self.log(Severity::Error, "reply method", Some(err));
            self.close_now(stream);
            return;
        }

        // All control traffic from here on goes through the capsulated
        // stream the subnegotiator returns.
        let mut stream = match negotiator {
            None => stream,
            Some(negotiator) => match negotiator.negotiate(stream).await {
                Ok(capsulated) => capsulated,
                Err(err) => {
                    let severity = match &err {
                        Error::AuthFailed | Error::Malformed(_) => Severity::Warn,
                        _ => Severity::Error,
                    };
                    self.log(severity, "subnegotiate", Some(err));
                    // The negotiator took the stream down with it; only the
                    // grace period and the close event are left to us.
                    sleep(self.shared.config.period_close).await;
                    self.log(Severity::Info, "close connection", None);
                    return;
                }
            },
        };

        let (cmd, dst) = match protocol::read_request(&mut stream).await {
            Ok(request) => request,
            Err(err) => {
                self.log(Severity::Error, "read request", Some(err));
                self.close_now(stream);
                return;
            }
        };

        let Some(command) = Command::from_u8(cmd) else {
            self.log(
                Severity::Warn,
                "read request",
                Some(Error::CmdNotSupported(cmd)),
            );
            self.reply_and_grace(stream, Reply::CommandNotSupported, Address::unspecified())
                .await;
            return;
        };

        self.log(Severity::Debug, "received request", None);
        let head = RequestHead {
            dst,
            local_addr: self.local_addr,
            remote_addr: self.peer_addr,
        };

        match command {
            Command::Connect => self.drive_connect(stream, head).await,
            Command::Bind => self.drive_bind(stream, head).await,
            Command::UdpAssociate => self.drive_associate(stream, head).await,
        }
    }

    /// Offers the greeting to the policy layer and awaits its decision,
    /// bounded by the auto-deny window. `None` is any flavor of deny: not
    /// delivered, dropped undecided, or timed out.
    async fn select_method(
        &self,
        handshake: Handshake,
        decision: oneshot::Receiver<HandshakeDecision>,
    ) -> Option<HandshakeDecision> {
        // Delivery and decision are separate: a handshake can reach the
        // policy layer and still time out undecided.
        if !self.shared.offer_handshake(handshake) {
            self.log(
                Severity::Warn,
                "select method",
                Some(Error::NotHandled {
                    what: "handshake",
                    timeout: false,
                }),
            );
            return None;
        }

        match timeout(self.shared.config.period_auto_deny, decision).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) => None,
            Err(_) => {
                self.log(
                    Severity::Warn,
                    "select method",
                    Some(Error::NotHandled {
                        what: "handshake",
                        timeout: true,
                    }),
                );
                None
            }
        }
    }

    /// Offers a wrapped request and awaits the (first) decision under the
    /// auto-deny window.
    async fn evaluate_request<D>(
        &self,
        request: Request,
        decision: oneshot::Receiver<D>,
        what: &'static str,
    ) -> Option<D> {
        if !self.shared.offer_request(request) {
            self.log(
                Severity::Warn,
                "evaluate request",
                Some(Error::NotHandled {
                    what,
                    timeout: false,
                }),
            );
            return None;
        }

        self.await_decision(decision, what).await
    }

    /// Bounded wait on one decision one-shot. Used for the initial decision
    /// of every request and again for BIND's second phase.
    async fn await_decision<D>(
        &self,
        decision: oneshot::Receiver<D>,
        what: &'static str,
    ) -> Option<D> {
        match timeout(self.shared.config.period_auto_deny, decision).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) => None,
            Err(_) => {
                self.log(
                    Severity::Warn,
                    "evaluate request",
                    Some(Error::NotHandled { what, timeout: true }),
                );
                None
            }
        }
    }

    /// Commits a reply and, on success, holds the connection through the
    /// grace period so the client can read it.
    async fn reply_and_grace(&self, mut stream: BoxConn, reply: Reply, bound: Address) {
        if let Err(err) = protocol::write_reply(&mut stream, reply, &bound).await {
            self.log(Severity::Error, "reply request", Some(err));
            self.close_now(stream);
            return;
        }
        self.grace_close(stream).await;
    }

    /// Keeps `stream` open for the grace period, then closes it.
    async fn grace_close(&self, stream: BoxConn) {
        sleep(self.shared.config.period_close).await;
        self.close_now(stream);
    }

    /// Logs the close event and drops, and thereby closes, the stream.
    /// Every teardown of this connection funnels through here or mirrors
    /// its log line.
    fn close_now(&self, stream: BoxConn) {
        self.log(Severity::Info, "close connection", None);
        drop(stream);
    }

    fn log(&self, severity: Severity, op: &'static str, cause: Option<Error>) {
        self.shared.log(severity, op, Some(self.peer_addr), cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::sync::CancellationToken;

    const GREETING_NO_AUTH: [u8; 3] = [0x05, 0x01, 0x00];
    const CONNECT_127_0_0_1_80: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];

    /// Spawns a driver over an in-memory stream, the way the accept loop
    /// does over a socket. Returns the client end and the connection token.
    fn spawn_driver(server: &Server) -> (DuplexStream, CancellationToken) {
        let (client, serve_side) = duplex(4096);
        let shared = Arc::clone(&server.shared);
        let token = CancellationToken::new();
        let id = shared.register_connection(token.clone()).unwrap();

        let task_shared = Arc::clone(&shared);
        let task_token = token.clone();
        tokio::spawn(async move {
            let driver = Driver::new(
                Arc::clone(&task_shared),
                "127.0.0.1:1080".parse().unwrap(),
                "127.0.0.1:50000".parse().unwrap(),
            );
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = driver.run(Box::new(serve_side)) => {}
            }
            task_shared.deregister(id);
        });

        (client, token)
    }

    async fn expect_eof(client: &mut DuplexStream) {
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    async fn negotiate_no_auth(server: &Server, client: &mut DuplexStream) {
        let mut handshakes = server.handshake_channel().unwrap();
        client.write_all(&GREETING_NO_AUTH).await.unwrap();
        let handshake = handshakes.recv().await.unwrap();
        assert_eq!(handshake.methods(), &[AuthMethod::NoAuthRequired]);
        handshake.accept(AuthMethod::NoAuthRequired, None);

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_success_relays_both_ways() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;

        client.write_all(&CONNECT_127_0_0_1_80).await.unwrap();
        let request = match requests.recv().await.unwrap() {
            Request::Connect(request) => request,
            _ => panic!("expected CONNECT"),
        };
        assert_eq!(request.dst().to_string(), "127.0.0.1:80");

        let (outbound, mut far) = duplex(4096);
        let bound: Address = "1.2.3.4:5000".parse::<SocketAddr>().unwrap().into();
        request.accept(bound, Box::new(outbound));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 1, 2, 3, 4, 0x13, 0x88]);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Outbound EOF tears both sides down.
        drop(far);
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn denied_handshake_gets_ff_then_close() {
        let server = Server::new();
        let mut handshakes = server.handshake_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        handshakes.recv().await.unwrap().deny();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_handshake_is_denied() {
        // No handshake channel at all.
        let server = Server::new();
        let (mut client, _token) = spawn_driver(&server);

        client.write_all(&GREETING_NO_AUTH).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn undecided_handshake_times_out_denied() {
        let server = Server::new();
        let mut handshakes = server.handshake_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        client.write_all(&GREETING_NO_AUTH).await.unwrap();
        // Hold the handshake without answering; the auto-deny window runs
        // out in virtual time.
        let _handshake = handshakes.recv().await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_with_general_failure() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;
        client.write_all(&CONNECT_127_0_0_1_80).await.unwrap();

        let _request = requests.recv().await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_command_skips_the_handoff() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;

        let mut request = CONNECT_127_0_0_1_80;
        request[1] = 0x09;
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        expect_eof(&mut client).await;

        assert!(requests.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bind_commits_two_replies_then_relays() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;

        let mut request = CONNECT_127_0_0_1_80;
        request[1] = 0x02;
        client.write_all(&request).await.unwrap();

        let request = match requests.recv().await.unwrap() {
            Request::Bind(request) => request,
            _ => panic!("expected BIND"),
        };

        let bound: Address = "10.0.0.1:4000".parse::<SocketAddr>().unwrap().into();
        let pending = request.accept(bound);

        let mut first = [0u8; 10];
        client.read_exact(&mut first).await.unwrap();
        assert_eq!(first, [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x0F, 0xA0]);

        let (outbound, mut far) = duplex(4096);
        let peer: Address = "10.0.0.2:5001".parse::<SocketAddr>().unwrap().into();
        pending.bind(peer, Box::new(outbound));

        let mut second = [0u8; 10];
        client.read_exact(&mut second).await.unwrap();
        assert_eq!(second, [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x13, 0x89]);

        client.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test(start_paused = true)]
    async fn bind_second_phase_auto_denies() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;

        let mut request = CONNECT_127_0_0_1_80;
        request[1] = 0x02;
        client.write_all(&request).await.unwrap();

        let request = match requests.recv().await.unwrap() {
            Request::Bind(request) => request,
            _ => panic!("expected BIND"),
        };
        let bound: Address = "10.0.0.1:4000".parse::<SocketAddr>().unwrap().into();
        // Hold the second phase open past its deny window.
        let _pending = request.accept(bound);

        let mut first = [0u8; 10];
        client.read_exact(&mut first).await.unwrap();
        assert_eq!(first[1], 0x00);

        let mut second = [0u8; 10];
        client.read_exact(&mut second).await.unwrap();
        assert_eq!(second, [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn associate_notifies_once_on_client_eof() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;

        let mut request = CONNECT_127_0_0_1_80;
        request[1] = 0x03;
        client.write_all(&request).await.unwrap();

        let request = match requests.recv().await.unwrap() {
            Request::Associate(request) => request,
            _ => panic!("expected ASSOCIATE"),
        };

        let fired = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();
        let _association = {
            let fired = Arc::clone(&fired);
            request.accept("1.2.3.4:5000".parse::<SocketAddr>().unwrap().into(), move || {
                fired.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            })
        };

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        // Client closes the control connection.
        drop(client);
        done_rx.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn associate_notifies_on_forced_close() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;

        let mut request = CONNECT_127_0_0_1_80;
        request[1] = 0x03;
        client.write_all(&request).await.unwrap();

        let request = match requests.recv().await.unwrap() {
            Request::Associate(request) => request,
            _ => panic!("expected ASSOCIATE"),
        };

        let (done_tx, done_rx) = oneshot::channel();
        let _association = request.accept(
            "1.2.3.4:5000".parse::<SocketAddr>().unwrap().into(),
            move || {
                let _ = done_tx.send(());
            },
        );

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        // Forcing the connection closed unwinds the driver; the notifier
        // still fires exactly once.
        token.cancel();
        done_rx.await.unwrap();
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn associate_terminate_ends_the_hold() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;

        let mut request = CONNECT_127_0_0_1_80;
        request[1] = 0x03;
        client.write_all(&request).await.unwrap();

        let request = match requests.recv().await.unwrap() {
            Request::Associate(request) => request,
            _ => panic!("expected ASSOCIATE"),
        };

        let (done_tx, done_rx) = oneshot::channel();
        let association = request.accept(
            "1.2.3.4:5000".parse::<SocketAddr>().unwrap().into(),
            move || {
                let _ = done_tx.send(());
            },
        );

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        association.terminate();
        done_rx.await.unwrap();
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn denied_connect_carries_the_policy_reply() {
        let server = Server::new();
        let mut requests = server.request_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        negotiate_no_auth(&server, &mut client).await;
        client.write_all(&CONNECT_127_0_0_1_80).await.unwrap();

        match requests.recv().await.unwrap() {
            Request::Connect(request) => {
                request.deny(Reply::ConnectionRefused, Address::unspecified())
            }
            _ => panic!("expected CONNECT"),
        }

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        expect_eof(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_greeting_drops_the_connection() {
        let server = Server::new();
        let _handshakes = server.handshake_channel().unwrap();
        let (mut client, _token) = spawn_driver(&server);

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        expect_eof(&mut client).await;
    }
}
