use crate::log::Severity;
use crate::protocol::{self, Address, Reply};
use crate::relay;
use crate::request::{ConnectDecision, ConnectRequest, Request, RequestHead};
use crate::BoxConn;

use super::Driver;

impl Driver {
    pub(super) async fn drive_connect(&self, stream: BoxConn, head: RequestHead) {
        let (request, decision) = ConnectRequest::new(head);
        let decision = self
            .evaluate_request(Request::Connect(request), decision, "CONNECT")
            .await;

        match decision {
            Some(ConnectDecision::Accept { bound, conn }) => {
                self.relay_accepted(stream, conn, bound).await;
            }
            Some(ConnectDecision::Deny { reply, bound }) => {
                self.reply_and_grace(stream, reply, bound).await;
            }
            None => {
                self.reply_and_grace(stream, Reply::GeneralFailure, Address::unspecified())
                    .await;
            }
        }
    }

    /// Commits the success reply and relays until either side finishes.
    /// Shared by CONNECT and BIND's second phase; `bound` is whatever
    /// address the committed reply advertises.
    pub(super) async fn relay_accepted(&self, mut stream: BoxConn, conn: BoxConn, bound: Address) {
        if let Err(err) = protocol::write_reply(&mut stream, Reply::Success, &bound).await {
            // The attached outbound connection drops, and closes, with us.
            self.log(Severity::Error, "reply request", Some(err));
            self.close_now(stream);
            return;
        }

        self.log(Severity::Info, "relay started", None);
        match relay::run(stream, conn).await {
            None => self.log(Severity::Info, "relay done", None),
            Some(err) => self.log(Severity::Error, "relay", Some(err.into())),
        }
        // The relay dropped both streams on its way out.
        self.log(Severity::Info, "close connection", None);
    }
}
