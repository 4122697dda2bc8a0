//! Boundary between the broker and whatever carries bytes to a client.
//!
//! A [`Channel`] is the outbound half of a live connection: the broker hands it
//! a [`Message`] and gets back a [`SendOutcome`]. The inbound half is a stream
//! of [`InboundRequest`]s, each holding a [`Deferral`] that keeps the sender
//! waiting until the broker has finished relaying.

use std::{fmt, future::Future};

use tokio::sync::oneshot;

use crate::message::{Message, ResponseStatus};

/// Outbound side of a live connection to one client.
pub trait Channel: Send + Sync + 'static {
    fn send(&self, message: &Message) -> impl Future<Output = SendOutcome> + Send;
}

/// Result of a single send to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// The peer is known to be gone (its process exited without closing).
    DeliveryFailure,
    /// The send itself broke down; the peer may still be alive.
    TransportError(String),
    /// The peer answered with a status the broker does not treat as fatal.
    UnknownStatus(ResponseStatus),
}

impl SendOutcome {
    pub fn from_status(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Success => SendOutcome::Success,
            ResponseStatus::Failure => SendOutcome::DeliveryFailure,
            other => SendOutcome::UnknownStatus(other),
        }
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendOutcome::Success => f.write_str("success"),
            SendOutcome::DeliveryFailure => f.write_str("delivery failure"),
            SendOutcome::TransportError(detail) => write!(f, "transport error: {detail}"),
            SendOutcome::UnknownStatus(status) => write!(f, "unexpected status: {status}"),
        }
    }
}

/// Work-in-progress token held while a request is being processed.
///
/// Released exactly once: either through [`Deferral::complete`] or, on any
/// other exit path, when the token is dropped.
#[derive(Debug)]
pub struct Deferral {
    done: Option<oneshot::Sender<()>>,
}

/// Waiting side of a [`Deferral`].
#[derive(Debug)]
pub struct Completion {
    done: oneshot::Receiver<()>,
}

impl Deferral {
    pub fn new() -> (Self, Completion) {
        let (done_tx, done_rx) = oneshot::channel();
        (Self { done: Some(done_tx) }, Completion { done: done_rx })
    }

    pub fn complete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Drop for Deferral {
    fn drop(&mut self) {
        self.release();
    }
}

impl Completion {
    /// Resolves once the matching [`Deferral`] has been released.
    pub async fn wait(self) {
        // A dropped sender counts as released too.
        let _ = self.done.await;
    }
}

/// A message received from a connection, paired with the deferral that keeps
/// its sender waiting for the broker's answer.
#[derive(Debug)]
pub struct InboundRequest {
    pub message: Message,
    pub deferral: Deferral,
}

impl InboundRequest {
    pub fn new(message: Message) -> (Self, Completion) {
        let (deferral, completion) = Deferral::new();
        (Self { message, deferral }, completion)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn completion_resolves_after_complete() {
        let (deferral, completion) = Deferral::new();
        deferral.complete();
        timeout(Duration::from_secs(1), completion.wait())
            .await
            .expect("completion should resolve");
    }

    #[tokio::test]
    async fn completion_resolves_when_deferral_is_dropped() {
        let (request, completion) = InboundRequest::new(Message::single("Echo", "hi"));
        let handle = tokio::spawn(async move {
            let _request = request;
            panic!("handler blew up");
        });
        assert!(handle.await.is_err());

        timeout(Duration::from_secs(1), completion.wait())
            .await
            .expect("completion should resolve on unwind");
    }

    #[tokio::test]
    async fn completion_stays_pending_while_deferral_is_held() {
        let (deferral, completion) = Deferral::new();
        let pending = timeout(Duration::from_millis(50), completion.wait()).await;
        assert!(pending.is_err());
        drop(deferral);
    }

    #[test]
    fn statuses_map_onto_outcomes() {
        assert_eq!(
            SendOutcome::from_status(ResponseStatus::Success),
            SendOutcome::Success
        );
        assert_eq!(
            SendOutcome::from_status(ResponseStatus::Failure),
            SendOutcome::DeliveryFailure
        );
        assert_eq!(
            SendOutcome::from_status(ResponseStatus::ResourceLimitsExceeded),
            SendOutcome::UnknownStatus(ResponseStatus::ResourceLimitsExceeded)
        );
    }
}
