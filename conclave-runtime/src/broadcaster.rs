//! Cross-rank request batch synchronization.
//!
//! Before each compute step, every rank of a group must hold a
//! byte-for-byte identical view of the pending request batch. The leader
//! drains its mailbox without blocking; the batch is then replicated to the
//! whole group through a collective broadcast. Divergence here deadlocks or
//! corrupts the collective compute that follows, so the ordering rules are
//! strict and deliberately simple.

use conclave::{ProcessGroup, Request, Result};

use crate::mailbox::RequestReceiver;

/// Drain the inbound mailbox without blocking.
///
/// The leader passes its receiver and gets every message that was already
/// queued, in arrival order; a follower passes `None` and gets an empty
/// batch. One bounded pass — the poll never waits for more input.
///
/// # Errors
/// Propagates a closed mailbox from the receiver.
pub fn drain_pending(receiver: Option<&mut (dyn RequestReceiver + '_)>) -> Result<Vec<Request>> {
    let Some(receiver) = receiver else {
        return Ok(Vec::new());
    };

    let mut batch = Vec::new();
    while let Some(request) = receiver.try_recv()? {
        batch.push(request);
    }
    Ok(batch)
}

/// Split a drained batch into work requests (generation/embedding) and
/// control requests (everything else), preserving relative order within
/// each category.
///
/// Downstream, control requests always run after work requests regardless
/// of how the two were interleaved at the mailbox. That reordering is a
/// deliberate simplification: the two categories travel over different
/// process groups under data-parallel attention, so cross-category arrival
/// order cannot be preserved anyway.
#[must_use]
pub fn split_work_control(batch: Vec<Request>) -> (Vec<Request>, Vec<Request>) {
    batch.into_iter().partition(Request::is_work)
}

/// Replicate `batch` from `src` to every rank of `group`.
///
/// For a single-rank group this returns the input unchanged and performs no
/// collective call. Otherwise every rank must enter this call with the same
/// `src`; ranks other than the source pass their (empty) placeholder batch,
/// which is discarded. On return every rank holds the source's batch.
///
/// The post-condition — identical length, order, and content on every
/// rank — is not verified locally; a mismatch means the group was
/// misconfigured, which is fatal upstream.
///
/// # Errors
/// Propagates transport failures and payload decode failures.
pub fn broadcast_requests<G: ProcessGroup>(
    batch: Vec<Request>,
    src: usize,
    group: &mut G,
) -> Result<Vec<Request>> {
    if group.size() == 1 {
        return Ok(batch);
    }

    let payload = if group.rank() == src {
        Some(serde_json::to_vec(&batch)?)
    } else {
        None
    };
    let bytes = group.broadcast(payload, src)?;
    let batch: Vec<Request> = serde_json::from_slice(&bytes)?;

    tracing::trace!(len = batch.len(), src, "request batch broadcast");
    Ok(batch)
}
