//! Request correlation
//!
//! The Miniserver answers commands strictly in the order they were sent and its
//! answers carry no request id. A connection therefore keeps at most one request in
//! flight and queues the rest FIFO; the next request is only dispatched once the
//! previous one got its answer.

use crate::core::commands::EncryptionMode;
use crate::core::response::LxResponse;
use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::debug;

/// Content of a file answer
#[derive(Debug, Clone, PartialEq)]
pub enum FileContent {
    Text(String),
    Binary(Bytes),
    /// The header announced zero bytes
    Empty,
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// An `LL` answer with a 2xx code
    Response(LxResponse),
    /// A file, an image or statistics
    File(FileContent),
}

impl Reply {
    /// The `LL` answer; file answers are a parse failure here
    pub fn into_response(self) -> Result<LxResponse> {
        match self {
            Reply::Response(response) => Ok(response),
            Reply::File(_) => Err(ProtocolError::ResponseParseFailed(
                "Expected an LL response, got a file".into(),
            )),
        }
    }

    pub fn into_file(self) -> Option<FileContent> {
        match self {
            Reply::File(file) => Some(file),
            Reply::Response(_) => None,
        }
    }
}

/// Receiving end of a request, resolved exactly once
pub type ReplyReceiver = oneshot::Receiver<Result<Reply>>;

/// A command waiting for its answer
#[derive(Debug)]
pub struct PendingRequest {
    pub command: String,
    pub mode: EncryptionMode,
    responder: oneshot::Sender<Result<Reply>>,
}

impl PendingRequest {
    pub fn new(command: impl Into<String>, mode: EncryptionMode) -> (Self, ReplyReceiver) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                command: command.into(),
                mode,
                responder,
            },
            receiver,
        )
    }

    /// Deliver the outcome; consuming `self` makes a second outcome impossible
    pub fn complete(self, outcome: Result<Reply>) {
        if self.responder.send(outcome).is_err() {
            debug!(command = %self.command, "Request outcome dropped, caller gave up");
        }
    }

    pub fn resolve(self, reply: Reply) {
        self.complete(Ok(reply));
    }

    pub fn reject(self, err: ProtocolError) {
        self.complete(Err(err));
    }
}

/// FIFO of requests plus the one in flight
#[derive(Debug, Default)]
pub struct RequestQueue {
    in_flight: Option<PendingRequest>,
    queued: VecDeque<PendingRequest>,
    /// Download connections park commands here until authenticated
    waiting: VecDeque<PendingRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<&PendingRequest> {
        self.in_flight.as_ref()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Nothing in flight and nothing queued
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queued.is_empty()
    }

    pub fn push(&mut self, request: PendingRequest) {
        self.queued.push_back(request);
    }

    pub fn push_waiting(&mut self, request: PendingRequest) {
        self.waiting.push_back(request);
    }

    /// Move parked requests behind the queued ones
    pub fn release_waiting(&mut self) -> usize {
        let count = self.waiting.len();
        self.queued.extend(self.waiting.drain(..));
        count
    }

    /// Next request to dispatch, if the line is free
    pub fn next(&mut self) -> Option<PendingRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        self.queued.pop_front()
    }

    pub fn set_in_flight(&mut self, request: PendingRequest) {
        debug_assert!(self.in_flight.is_none(), "second request put in flight");
        self.in_flight = Some(request);
    }

    /// Take the in-flight request to complete it
    pub fn take_in_flight(&mut self) -> Option<PendingRequest> {
        self.in_flight.take()
    }

    /// Reject every request with `reason`, in-flight first, then in queue order.
    ///
    /// Returns the number of rejected requests.
    pub fn drain(&mut self, reason: &ProtocolError) -> usize {
        let mut count = 0;
        let pending = self
            .in_flight
            .take()
            .into_iter()
            .chain(self.queued.drain(..))
            .chain(self.waiting.drain(..));
        for request in pending {
            request.reject(reason.clone());
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_dispatch() {
        let mut queue = RequestQueue::new();
        let (a, _ra) = PendingRequest::new("a", EncryptionMode::None);
        let (b, _rb) = PendingRequest::new("b", EncryptionMode::None);
        queue.push(a);
        queue.push(b);

        let first = queue.next().unwrap();
        assert_eq!(first.command, "a");
        queue.set_in_flight(first);
        assert!(queue.next().is_none());

        queue.take_in_flight().unwrap().resolve(Reply::File(FileContent::Empty));
        assert_eq!(queue.next().unwrap().command, "b");
    }

    #[tokio::test]
    async fn test_drain_rejects_everything() {
        let mut queue = RequestQueue::new();
        let mut receivers = Vec::new();
        for cmd in ["a", "b", "c", "d"] {
            let (request, rx) = PendingRequest::new(cmd, EncryptionMode::None);
            receivers.push(rx);
            queue.push(request);
        }
        let first = queue.next().unwrap();
        queue.set_in_flight(first);

        assert_eq!(queue.drain(&ProtocolError::ManualClose), 4);
        assert!(queue.is_idle());
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(ProtocolError::ManualClose));
        }
    }

    #[tokio::test]
    async fn test_waiting_requests_are_released_in_order() {
        let mut queue = RequestQueue::new();
        let (auth, _r1) = PendingRequest::new("jdev/sys/getkey", EncryptionMode::None);
        let (file, _r2) = PendingRequest::new("data/LoxAPP3.json", EncryptionMode::None);
        queue.push_waiting(file);
        queue.push(auth);
        assert_eq!(queue.waiting_len(), 1);

        assert_eq!(queue.release_waiting(), 1);
        assert_eq!(queue.next().unwrap().command, "jdev/sys/getkey");
        assert_eq!(queue.next().unwrap().command, "data/LoxAPP3.json");
    }

    #[test]
    fn test_reply_into_response() {
        let reply = Reply::Response(LxResponse::new("jdev/cfg/version", "10.2".into(), 200));
        assert_eq!(reply.into_response().unwrap().code, 200);
        assert!(Reply::File(FileContent::Empty).into_response().is_err());
    }
}
