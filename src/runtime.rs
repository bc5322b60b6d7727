//! Cross-context messaging inside the extension: content contexts post
//! [`RuntimeMessage`]s to the relay and may wait for a reply.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::events::{RuntimeMessage, RuntimeReply};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("extension context invalidated")]
pub struct ContextInvalidated;

#[derive(Debug)]
pub struct Envelope {
    pub message: RuntimeMessage,
    pub reply: Option<oneshot::Sender<RuntimeReply>>,
}

impl Envelope {
    /// Answers the sender, if it is still waiting.
    pub fn respond(self, reply: RuntimeReply) {
        if let Some(tx) = self.reply {
            let _ = tx.send(reply);
        }
    }
}

/// Sending side, held by every content context and the popup.
#[derive(Clone, Debug)]
pub struct RuntimePort {
    tx: mpsc::UnboundedSender<Envelope>,
}

pub fn channel() -> (RuntimePort, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RuntimePort { tx }, rx)
}

impl RuntimePort {
    /// Fire and forget.
    pub fn post(&self, message: RuntimeMessage) -> Result<(), ContextInvalidated> {
        self.tx
            .send(Envelope {
                message,
                reply: None,
            })
            .map_err(|_| ContextInvalidated)
    }

    /// Sends and waits for the handler's reply.
    pub async fn request(&self, message: RuntimeMessage) -> Result<RuntimeReply, ContextInvalidated> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                message,
                reply: Some(reply),
            })
            .map_err(|_| ContextInvalidated)?;
        rx.await.map_err(|_| ContextInvalidated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_gets_reply() {
        let (port, mut rx) = channel();
        let handler = tokio::spawn(async move {
            let env = rx.recv().await.unwrap();
            assert!(matches!(env.message, RuntimeMessage::TestConnection { .. }));
            env.respond(RuntimeReply::Connected { connected: true });
        });

        let reply = port
            .request(RuntimeMessage::TestConnection {
                url: "http://pc:5000".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply, RuntimeReply::Connected { connected: true });
        handler.await.unwrap();
    }

    #[tokio::test]
    async fn closed_relay_invalidates_context() {
        let (port, rx) = channel();
        drop(rx);
        assert_eq!(
            port.post(RuntimeMessage::TestConnection { url: String::new() }),
            Err(ContextInvalidated)
        );
    }
}
