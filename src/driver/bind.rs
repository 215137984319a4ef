use crate::protocol::{self, Address, Reply};
use crate::request::{BindFirstDecision, BindRequest, BindSecondDecision, Request, RequestHead};
use crate::log::Severity;
use crate::BoxConn;

use super::Driver;

impl Driver {
    pub(super) async fn drive_bind(&self, mut stream: BoxConn, head: RequestHead) {
        let (request, first, second) = BindRequest::new(head);
        let first = self
            .evaluate_request(Request::Bind(request), first, "BIND")
            .await;

        let bound = match first {
            Some(BindFirstDecision::Accept { bound }) => bound,
            Some(BindFirstDecision::Deny { reply, bound }) => {
                return self.reply_and_grace(stream, reply, bound).await;
            }
            None => {
                return self
                    .reply_and_grace(stream, Reply::GeneralFailure, Address::unspecified())
                    .await;
            }
        };

        if let Err(err) = protocol::write_reply(&mut stream, Reply::Success, &bound).await {
            self.log(Severity::Error, "reply request", Some(err));
            self.close_now(stream);
            return;
        }

        // The second phase runs under its own deny window, armed the moment
        // the first reply is committed. A listener that waits longer than
        // the window needs the policy layer to answer before it elapses.
        match self.await_decision(second, "BIND").await {
            Some(BindSecondDecision::Bind { peer, conn }) => {
                self.relay_accepted(stream, conn, peer).await;
            }
            Some(BindSecondDecision::Deny { reply, bound }) => {
                self.reply_and_grace(stream, reply, bound).await;
            }
            None => {
                self.reply_and_grace(stream, Reply::GeneralFailure, Address::unspecified())
                    .await;
            }
        }
    }
}
