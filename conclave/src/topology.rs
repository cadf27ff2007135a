//! A worker's position in the parallel rank layout.

use crate::collective::ProcessGroup;
use crate::config::ServerConfig;
use crate::{Error, Result};

/// Immutable description of this worker's position in the attention
/// tensor-parallel group, the full tensor-parallel group, and the
/// data-parallel layout, plus the two process-group handles used for
/// request broadcast.
///
/// Every rank in the same group must hold a pairwise-consistent topology
/// (same sizes, same membership). That is established at launch time; a
/// violation is a fatal misconfiguration, which is why construction
/// validates everything it can check locally and nothing is re-checked per
/// call.
#[derive(Debug)]
pub struct RankTopology<G> {
    attn_tp_rank: usize,
    attn_tp_size: usize,
    tp_rank: usize,
    tp_size: usize,
    dp_rank: usize,
    attn_group: G,
    tp_group: G,
}

impl<G: ProcessGroup> RankTopology<G> {
    /// Build the topology for this rank from its two group handles.
    ///
    /// `attn_group` is the attention-TP group this rank belongs to;
    /// `tp_group` is the full TP group. Without data-parallel attention the
    /// two groups have the same membership (but remain separate handles, so
    /// collectives on one never interleave with the other).
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the group sizes or ranks contradict
    /// `config` — the locally checkable part of the pairwise-consistency
    /// invariant.
    pub fn from_groups(
        config: &ServerConfig,
        dp_rank: usize,
        attn_group: G,
        tp_group: G,
    ) -> Result<Self> {
        config.validate()?;

        let attn_tp_size = config.attn_tp_size();
        if attn_group.size() != attn_tp_size {
            return Err(Error::Config(format!(
                "attention group has {} ranks, config says {attn_tp_size}",
                attn_group.size()
            )));
        }
        if tp_group.size() != config.tp_size {
            return Err(Error::Config(format!(
                "tensor-parallel group has {} ranks, config says {}",
                tp_group.size(),
                config.tp_size
            )));
        }
        if dp_rank >= config.dp_size {
            return Err(Error::Config(format!(
                "dp_rank {dp_rank} out of range for dp_size {}",
                config.dp_size
            )));
        }

        let attn_tp_rank = attn_group.rank();
        let tp_rank = tp_group.rank();
        if config.enable_dp_attention && tp_rank != dp_rank * attn_tp_size + attn_tp_rank {
            return Err(Error::Config(format!(
                "tp_rank {tp_rank} does not match dp_rank {dp_rank} x \
                 attn_tp_size {attn_tp_size} + attn_tp_rank {attn_tp_rank}"
            )));
        }

        Ok(Self {
            attn_tp_rank,
            attn_tp_size,
            tp_rank,
            tp_size: config.tp_size,
            dp_rank,
            attn_group,
            tp_group,
        })
    }

    /// Whether this rank owns the real inbound mailbox and originates each
    /// broadcast. By convention the leader is attention-TP rank 0.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.attn_tp_rank == 0
    }

    #[must_use]
    pub fn attn_tp_rank(&self) -> usize {
        self.attn_tp_rank
    }

    #[must_use]
    pub fn attn_tp_size(&self) -> usize {
        self.attn_tp_size
    }

    #[must_use]
    pub fn tp_rank(&self) -> usize {
        self.tp_rank
    }

    #[must_use]
    pub fn tp_size(&self) -> usize {
        self.tp_size
    }

    #[must_use]
    pub fn dp_rank(&self) -> usize {
        self.dp_rank
    }

    /// The attention-TP group handle (mutable: collectives consume ordering
    /// state).
    pub fn attn_group_mut(&mut self) -> &mut G {
        &mut self.attn_group
    }

    /// The full TP group handle.
    pub fn tp_group_mut(&mut self) -> &mut G {
        &mut self.tp_group
    }

    /// Both group handles at once, for callers that broadcast over each in
    /// a single iteration.
    pub fn groups_mut(&mut self) -> (&mut G, &mut G) {
        (&mut self.attn_group, &mut self.tp_group)
    }
}
