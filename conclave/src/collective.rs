//! Collective communication seam.
//!
//! [`ProcessGroup`] is the contract this crate requires from the collaborator
//! runtime's collectives (NCCL, gloo, MPI — whatever the deployment uses).
//! Conclave only specifies the semantics: `broadcast` makes every participant
//! return the source's bytes, `all_to_all` routes shard `i` of every
//! participant to participant `i`. Both are barrier-like: a rank that enters
//! a collective does not return until the call completes group-wide.
//!
//! [`LocalProcessGroup`] is the in-process implementation used by tests and
//! thread-per-rank single-node deployments. It runs the same lock-step
//! execution style as a sharded model: one thread per rank, every rank
//! issuing the same sequence of collective calls.

use std::collections::HashMap;
use std::sync::mpsc;

use crate::{Error, Result};

/// A group of ranks participating in collective calls.
///
/// Ranks are group-local (`0..size`). Every rank in the group must issue the
/// same collectives in the same order; a rank that skips or reorders a call
/// has violated the protocol, and the resulting mismatch is not detected
/// here — misconfiguration is a fatal precondition, not a runtime-checked
/// invariant.
pub trait ProcessGroup: Send {
    /// This rank's position within the group.
    fn rank(&self) -> usize;

    /// Number of participating ranks.
    fn size(&self) -> usize;

    /// Broadcast bytes from `src` to every rank in the group.
    ///
    /// The source passes `Some(payload)` and gets it back; every other rank
    /// passes `None` and returns the source's payload.
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if a participant went away mid-call, and
    /// [`Error::Config`] if the source supplied no payload.
    fn broadcast(&mut self, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>>;

    /// Exchange one shard with every rank.
    ///
    /// `shards[i]` is sent to rank `i` (the rank's own shard is returned in
    /// place); the result holds one shard from every rank, ordered by source
    /// rank.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if `shards.len() != size()` and
    /// [`Error::Transport`] if a participant went away mid-call.
    fn all_to_all(&mut self, shards: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>>;
}

/// One message in flight between two local ranks.
struct Frame {
    src: usize,
    op: u64,
    payload: Vec<u8>,
}

/// In-process [`ProcessGroup`] over per-rank channels.
///
/// Frames are tagged with a per-group collective counter so that frames
/// from a later collective arriving early (thread scheduling) are buffered
/// rather than misdelivered. Delivery is channel-buffered — the hard
/// barrier of a real collective is not emulated, but the returned values
/// match the collective contract exactly.
#[derive(Debug)]
pub struct LocalProcessGroup {
    rank: usize,
    // None at the rank's own index: a rank never sends to itself, and
    // holding a live sender to our own inbox would mask peer disconnects.
    peers: Vec<Option<mpsc::Sender<Frame>>>,
    inbox: mpsc::Receiver<Frame>,
    pending: HashMap<(usize, u64), Vec<u8>>,
    next_op: u64,
}

impl LocalProcessGroup {
    /// Create the handles for a group of `size` ranks.
    ///
    /// Returns one handle per rank, ordered by rank. Each handle is moved to
    /// its rank's thread.
    ///
    /// # Panics
    /// Panics if `size` is 0.
    #[must_use]
    pub fn group(size: usize) -> Vec<Self> {
        assert!(size > 0, "a process group needs at least one rank");

        let (txs, rxs): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();

        rxs.into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                peers: txs
                    .iter()
                    .enumerate()
                    .map(|(i, tx)| (i != rank).then(|| tx.clone()))
                    .collect(),
                inbox,
                pending: HashMap::new(),
                next_op: 0,
            })
            .collect()
    }

    /// Receive the frame for collective `op` from `src`, buffering frames
    /// that belong to later collectives.
    fn recv_frame(&mut self, src: usize, op: u64) -> Result<Vec<u8>> {
        if let Some(payload) = self.pending.remove(&(src, op)) {
            return Ok(payload);
        }
        loop {
            let frame = self
                .inbox
                .recv()
                .map_err(|_| Error::Transport("peer disconnected during collective".into()))?;
            if frame.src == src && frame.op == op {
                return Ok(frame.payload);
            }
            self.pending.insert((frame.src, frame.op), frame.payload);
        }
    }

    fn send_to(&self, dst: usize, op: u64, payload: Vec<u8>) -> Result<()> {
        self.peers[dst]
            .as_ref()
            .expect("ranks never send to themselves")
            .send(Frame {
                src: self.rank,
                op,
                payload,
            })
            .map_err(|_| Error::Transport(format!("rank {dst} left the group")))
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn broadcast(&mut self, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>> {
        if src >= self.size() {
            return Err(Error::Config(format!(
                "broadcast source {src} out of range for group of {}",
                self.size()
            )));
        }
        let op = self.next_op;
        self.next_op += 1;

        if self.rank == src {
            let payload = payload.ok_or_else(|| {
                Error::Config("broadcast source rank supplied no payload".into())
            })?;
            for dst in 0..self.size() {
                if dst != self.rank {
                    self.send_to(dst, op, payload.clone())?;
                }
            }
            Ok(payload)
        } else {
            self.recv_frame(src, op)
        }
    }

    fn all_to_all(&mut self, shards: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let size = self.size();
        if shards.len() != size {
            return Err(Error::ShapeMismatch {
                expected: vec![size],
                got: vec![shards.len()],
            });
        }
        let op = self.next_op;
        self.next_op += 1;

        let mut own = None;
        for (dst, shard) in shards.into_iter().enumerate() {
            if dst == self.rank {
                own = Some(shard);
            } else {
                self.send_to(dst, op, shard)?;
            }
        }

        (0..size)
            .map(|src| {
                if src == self.rank {
                    Ok(own.take().expect("own shard set above"))
                } else {
                    self.recv_frame(src, op)
                }
            })
            .collect()
    }
}
