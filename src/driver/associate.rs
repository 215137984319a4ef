use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;

use crate::log::Severity;
use crate::protocol::{self, Address, Reply};
use crate::request::{AssociateDecision, AssociateRequest, Request, RequestHead};
use crate::BoxConn;

use super::Driver;

impl Driver {
    pub(super) async fn drive_associate(&self, mut stream: BoxConn, head: RequestHead) {
        let (request, decision, terminate) = AssociateRequest::new(head);
        let decision = self
            .evaluate_request(Request::Associate(request), decision, "ASSOCIATE")
            .await;

        match decision {
            Some(AssociateDecision::Accept { bound, notify }) => {
                if let Err(err) =
                    protocol::write_reply(&mut stream, Reply::Success, &bound).await
                {
                    // `notify` fires on drop: the association never came up,
                    // which for the embedder is the same as it ending.
                    self.log(Severity::Error, "reply request", Some(err));
                    self.close_now(stream);
                    return;
                }

                self.hold(stream, terminate).await;
                notify.notify();
                // The hold already consumed and closed the stream.
                self.log(Severity::Info, "close connection", None);
            }
            Some(AssociateDecision::Deny { reply, bound }) => {
                self.reply_and_grace(stream, reply, bound).await;
            }
            None => {
                self.reply_and_grace(stream, Reply::GeneralFailure, Address::unspecified())
                    .await;
            }
        }
    }

    /// Holds the control connection for the lifetime of the association:
    /// until the client closes it, a read fails, or the embedder terminates.
    /// Whatever the client sends meanwhile is discarded.
    async fn hold(&self, mut stream: BoxConn, terminate: oneshot::Receiver<()>) {
        let terminated = async move {
            // An embedder that dropped its Association handle without
            // terminating means "run until the connection ends on its own".
            if terminate.await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::pin!(terminated);

        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                _ = &mut terminated => return,
                read = stream.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                },
            }
        }
    }
}
