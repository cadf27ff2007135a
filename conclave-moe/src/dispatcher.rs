//! The dispatch/combine contract and strategy selection.

use conclave::{DispatchOutputFormat, Error, HostTensor, ProcessGroup, Result};

use crate::low_latency::LowLatencyDispatcher;
use crate::normal::NormalDispatcher;
use crate::output::DispatchOutput;
use crate::standard::StandardDispatcher;

/// Per-token top-k expert assignment produced by the router gate.
///
/// Flat row-major layout: token `t`'s `j`-th choice sits at `t * top_k + j`.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub topk_ids: Vec<u32>,
    pub topk_weights: Vec<f32>,
    pub top_k: usize,
}

impl RoutingDecision {
    /// Check the decision against the token count and expert universe.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] for wrong lengths and
    /// [`Error::Config`] for an out-of-range expert id.
    pub fn validate(&self, num_tokens: usize, num_experts: usize) -> Result<()> {
        let expected = num_tokens * self.top_k;
        if self.topk_ids.len() != expected || self.topk_weights.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: vec![expected],
                got: vec![self.topk_ids.len(), self.topk_weights.len()],
            });
        }
        if let Some(&bad) = self.topk_ids.iter().find(|&&e| e as usize >= num_experts) {
            return Err(Error::Config(format!(
                "routing selects expert {bad}, universe has {num_experts}"
            )));
        }
        Ok(())
    }
}

/// How the global expert universe is partitioned across ranks.
///
/// Experts are assigned to ranks in contiguous blocks: rank `r` owns
/// experts `[r * per_rank, (r + 1) * per_rank)`.
#[derive(Debug, Clone, Copy)]
pub struct ExpertLayout {
    num_experts: usize,
    world_size: usize,
}

impl ExpertLayout {
    /// # Errors
    /// Returns [`Error::Config`] unless `num_experts` divides evenly across
    /// the group.
    pub fn new(num_experts: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || num_experts == 0 || num_experts % world_size != 0 {
            return Err(Error::Config(format!(
                "{num_experts} experts cannot be split across {world_size} ranks"
            )));
        }
        Ok(Self {
            num_experts,
            world_size,
        })
    }

    #[must_use]
    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[must_use]
    pub fn experts_per_rank(&self) -> usize {
        self.num_experts / self.world_size
    }

    /// The rank that owns a global expert id.
    #[must_use]
    pub fn owner(&self, expert: usize) -> usize {
        expert / self.experts_per_rank()
    }

    /// A global expert id's index within its owner's local experts.
    #[must_use]
    pub fn local_index(&self, expert: usize) -> usize {
        expert % self.experts_per_rank()
    }
}

/// The polymorphic dispatch/combine contract.
///
/// One strategy per wire format, selected once at construction and never
/// reselected per call. `dispatch` routes per-token hidden states to the
/// experts chosen by the routing decision; `combine` gathers expert outputs
/// back into original per-token order, reduced by the routing weights. The
/// shape of `expert_outputs` must match what the same strategy's `dispatch`
/// produced.
///
/// Communication failures propagate as transport errors; retry policy is
/// the caller's responsibility.
pub trait TokenDispatcher: Send {
    /// The wire format every [`DispatchOutput`] of this dispatcher carries.
    fn format(&self) -> DispatchOutputFormat;

    /// Route `hidden` (`[num_tokens, hidden_size]`) to the selected
    /// experts.
    ///
    /// # Errors
    /// Shape/routing validation failures, capacity overflow (low-latency),
    /// and transport errors.
    fn dispatch(
        &mut self,
        hidden: &HostTensor<f32>,
        routing: &RoutingDecision,
    ) -> Result<DispatchOutput>;

    /// Gather expert outputs back into `[num_tokens, hidden_size]`,
    /// weighted by the routing decision of the immediately preceding
    /// `dispatch`.
    ///
    /// # Errors
    /// Shape validation failures, transport errors, and calling `combine`
    /// without a matching `dispatch`.
    fn combine(&mut self, expert_outputs: HostTensor<f32>) -> Result<HostTensor<f32>>;
}

/// Deployment-level dispatcher parameters.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub format: DispatchOutputFormat,
    pub num_experts: usize,
    pub hidden_size: usize,
    /// Slot capacity per expert per source rank (low-latency format only).
    pub expected_tokens_per_expert: usize,
}

/// Build the strategy selected by the deployment configuration.
///
/// The group becomes the dispatcher's expert-parallel group. The standard
/// strategy has no expert parallelism and performs no collective calls; it
/// drops the handle.
///
/// # Errors
/// Returns a configuration error if the expert universe does not divide
/// across the group.
pub fn build_dispatcher<G: ProcessGroup + 'static>(
    config: &DispatcherConfig,
    group: G,
) -> Result<Box<dyn TokenDispatcher>> {
    match config.format {
        DispatchOutputFormat::Standard => {
            Ok(Box::new(StandardDispatcher::new(config.hidden_size)))
        }
        DispatchOutputFormat::Normal => {
            let layout = ExpertLayout::new(config.num_experts, group.size())?;
            Ok(Box::new(NormalDispatcher::new(
                group,
                layout,
                config.hidden_size,
            )))
        }
        DispatchOutputFormat::LowLatency => {
            let layout = ExpertLayout::new(config.num_experts, group.size())?;
            Ok(Box::new(LowLatencyDispatcher::new(
                group,
                layout,
                config.hidden_size,
                config.expected_tokens_per_expert,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave::LocalProcessGroup;

    #[test]
    fn layout_assigns_contiguous_blocks() {
        let layout = ExpertLayout::new(8, 2).unwrap();
        assert_eq!(layout.experts_per_rank(), 4);
        assert_eq!(layout.owner(0), 0);
        assert_eq!(layout.owner(3), 0);
        assert_eq!(layout.owner(4), 1);
        assert_eq!(layout.local_index(4), 0);
        assert_eq!(layout.local_index(7), 3);
    }

    #[test]
    fn indivisible_experts_are_rejected() {
        assert!(ExpertLayout::new(7, 2).is_err());
        assert!(ExpertLayout::new(0, 2).is_err());
    }

    #[test]
    fn routing_validation() {
        let routing = RoutingDecision {
            topk_ids: vec![0, 1, 2, 3],
            topk_weights: vec![0.5, 0.5, 0.5, 0.5],
            top_k: 2,
        };
        assert!(routing.validate(2, 4).is_ok());
        assert!(routing.validate(3, 4).is_err()); // wrong token count
        assert!(routing.validate(2, 3).is_err()); // expert 3 out of range
    }

    #[test]
    fn factory_honors_the_configured_format() {
        let mk = |format| DispatcherConfig {
            format,
            num_experts: 4,
            hidden_size: 8,
            expected_tokens_per_expert: 2,
        };

        for format in [
            DispatchOutputFormat::Standard,
            DispatchOutputFormat::Normal,
            DispatchOutputFormat::LowLatency,
        ] {
            let group = LocalProcessGroup::group(1).pop().unwrap();
            let dispatcher = build_dispatcher(&mk(format), group).unwrap();
            assert_eq!(dispatcher.format(), format);
        }
    }
}
