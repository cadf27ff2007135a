//! Standard dispatch: no expert parallelism, no cross-rank payload.

use conclave::{DispatchOutputFormat, Error, HostTensor, Result};

use crate::dispatcher::{RoutingDecision, TokenDispatcher};
use crate::output::DispatchOutput;

/// Dispatcher for deployments without expert parallelism.
///
/// Every expert lives on every rank, so dispatch moves nothing: the
/// consumer already holds the tokens locally, and combine hands the expert
/// outputs straight back. No collective call is ever made.
pub struct StandardDispatcher {
    hidden_size: usize,
    num_tokens: Option<usize>,
}

impl StandardDispatcher {
    #[must_use]
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            num_tokens: None,
        }
    }

    fn check_width(&self, tensor: &HostTensor<f32>) -> Result<usize> {
        match tensor.shape() {
            [n, h] if *h == self.hidden_size => Ok(*n),
            other => Err(Error::ShapeMismatch {
                expected: vec![0, self.hidden_size],
                got: other.to_vec(),
            }),
        }
    }
}

impl TokenDispatcher for StandardDispatcher {
    fn format(&self) -> DispatchOutputFormat {
        DispatchOutputFormat::Standard
    }

    fn dispatch(
        &mut self,
        hidden: &HostTensor<f32>,
        routing: &RoutingDecision,
    ) -> Result<DispatchOutput> {
        let num_tokens = self.check_width(hidden)?;
        // every expert is local, so only the routing shape matters here
        let expected = num_tokens * routing.top_k;
        if routing.topk_ids.len() != expected || routing.topk_weights.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: vec![expected],
                got: vec![routing.topk_ids.len(), routing.topk_weights.len()],
            });
        }
        self.num_tokens = Some(num_tokens);
        Ok(DispatchOutput::Standard)
    }

    fn combine(&mut self, expert_outputs: HostTensor<f32>) -> Result<HostTensor<f32>> {
        let num_tokens = self.num_tokens.take().ok_or_else(|| {
            Error::Config("combine called without a matching dispatch".into())
        })?;
        let got = self.check_width(&expert_outputs)?;
        if got != num_tokens {
            return Err(Error::ShapeMismatch {
                expected: vec![num_tokens, self.hidden_size],
                got: expert_outputs.shape().to_vec(),
            });
        }
        Ok(expert_outputs)
    }
}
