//! Mailbox seam between the front-end process and a scheduler worker.
//!
//! The control plane treats its message channel as an abstract ordered
//! mailbox: non-blocking receive on the inbound side, best-effort ordered
//! send on the outbound side. Only the leader rank of a group owns real
//! endpoints; followers hold `None` and every call site handles absence
//! explicitly — there are no silently-discarding stand-in objects.
//!
//! Channel-backed implementations over `std::sync::mpsc` serve tests and
//! thread-per-rank deployments; a networked transport implements the same
//! traits out of tree.

use std::sync::mpsc;

use conclave::{Error, GenerationOutput, Reply, Request, Result};

/// Inbound side of the request mailbox.
pub trait RequestReceiver: Send {
    /// Non-blocking receive; `Ok(None)` means the mailbox is empty.
    ///
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the sending side is gone — an
    /// orphaned worker has no reason to keep running.
    fn try_recv(&mut self) -> Result<Option<Request>>;
}

impl RequestReceiver for mpsc::Receiver<Request> {
    fn try_recv(&mut self) -> Result<Option<Request>> {
        match mpsc::Receiver::try_recv(self) {
            Ok(request) => Ok(Some(request)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => {
                Err(Error::ChannelClosed("request mailbox"))
            }
        }
    }
}

/// Outbound channel for synchronous handler replies, back to the request's
/// originator.
pub trait ReplySender: Send {
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the receiving side is gone.
    fn send(&self, reply: Reply) -> Result<()>;
}

impl ReplySender for mpsc::Sender<Reply> {
    fn send(&self, reply: Reply) -> Result<()> {
        mpsc::Sender::send(self, reply).map_err(|_| Error::ChannelClosed("reply channel"))
    }
}

/// Outbound channel for asynchronous generation output, toward the
/// detokenizer or the direct client path.
pub trait OutputSender: Send {
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the receiving side is gone.
    fn send(&self, output: GenerationOutput) -> Result<()>;
}

impl OutputSender for mpsc::Sender<GenerationOutput> {
    fn send(&self, output: GenerationOutput) -> Result<()> {
        mpsc::Sender::send(self, output).map_err(|_| Error::ChannelClosed("output channel"))
    }
}

/// The generation-output sink handed to the scheduler core at construction.
///
/// Followers get a disconnected sink: their forward passes produce the same
/// outputs as the leader's (lock-step), but only the leader publishes them.
/// The no-op is explicit here rather than hidden behind a stand-in sender.
pub struct OutputSink {
    inner: Option<Box<dyn OutputSender>>,
}

impl OutputSink {
    /// A sink that forwards to the downstream consumer. Leader ranks only.
    #[must_use]
    pub fn connected(sender: impl OutputSender + 'static) -> Self {
        Self {
            inner: Some(Box::new(sender)),
        }
    }

    /// A sink that drops everything. Follower ranks.
    #[must_use]
    pub fn disconnected() -> Self {
        Self { inner: None }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    /// Publish one batch of generation output.
    ///
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the leader's downstream consumer
    /// is gone. Disconnected sinks return `Ok(())`.
    pub fn send(&self, output: GenerationOutput) -> Result<()> {
        match &self.inner {
            Some(sender) => sender.send(output),
            None => Ok(()),
        }
    }
}

/// The per-rank mailbox endpoints owned by the communicator.
pub struct Endpoints {
    pub requests: Option<Box<dyn RequestReceiver>>,
    pub replies: Option<Box<dyn ReplySender>>,
}

impl Endpoints {
    /// Endpoints for the group leader: a real inbound mailbox and a real
    /// reply channel.
    #[must_use]
    pub fn leader(
        requests: impl RequestReceiver + 'static,
        replies: impl ReplySender + 'static,
    ) -> Self {
        Self {
            requests: Some(Box::new(requests)),
            replies: Some(Box::new(replies)),
        }
    }

    /// Endpoints for a follower rank: no transport at all.
    #[must_use]
    pub fn follower() -> Self {
        Self {
            requests: None,
            replies: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_recv_reports_empty_and_disconnected() {
        let (tx, mut rx) = mpsc::channel::<Request>();
        assert!(RequestReceiver::try_recv(&mut rx).unwrap().is_none());

        tx.send(Request::FlushCache).unwrap();
        assert!(matches!(
            RequestReceiver::try_recv(&mut rx).unwrap(),
            Some(Request::FlushCache)
        ));

        drop(tx);
        assert!(matches!(
            RequestReceiver::try_recv(&mut rx),
            Err(Error::ChannelClosed("request mailbox"))
        ));
    }

    #[test]
    fn disconnected_sink_drops_without_error() {
        let sink = OutputSink::disconnected();
        assert!(!sink.is_connected());
        sink.send(GenerationOutput {
            request_ids: vec!["r".into()],
            output_ids: vec![vec![1]],
            finished: vec![false],
            logprobs: None,
        })
        .unwrap();
    }

    #[test]
    fn connected_sink_forwards() {
        let (tx, rx) = mpsc::channel();
        let sink = OutputSink::connected(tx);
        assert!(sink.is_connected());
        sink.send(GenerationOutput {
            request_ids: vec!["r".into()],
            output_ids: vec![vec![7, 8]],
            finished: vec![true],
            logprobs: None,
        })
        .unwrap();

        let out = rx.recv().unwrap();
        assert_eq!(out.request_ids, vec!["r".to_string()]);
        assert_eq!(out.output_ids, vec![vec![7, 8]]);
    }

    #[test]
    fn follower_endpoints_are_empty() {
        let endpoints = Endpoints::follower();
        assert!(endpoints.requests.is_none());
        assert!(endpoints.replies.is_none());
    }
}
