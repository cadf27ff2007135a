//! Dispatch output payloads.
//!
//! A [`DispatchOutput`] is produced by one dispatch call and consumed by the
//! combine step of the same call — it is never retained across compute
//! steps. The tag always matches the format of the dispatcher that produced
//! it; consumers branch on the tag, never on payload shape inference, and
//! the closed enum makes that exhaustiveness checkable at build time.

use conclave::{DispatchOutputFormat, HostTensor};

/// Payload handed to the model executor after the dispatch step.
#[derive(Debug, Clone)]
pub enum DispatchOutput {
    /// No cross-rank payload: the consumer already holds the tokens
    /// locally.
    Standard,

    /// Variable-length exact per-expert shards from all-to-all.
    Normal {
        /// Received rows, `[num_recv, hidden]`, grouped by local expert
        /// (then by source rank, then arrival order within the source).
        hidden_states: HostTensor<f32>,
        /// Auxiliary scale tensor when the transport quantized the rows.
        /// This strategy ships f32, so `None`.
        hidden_states_scale: Option<HostTensor<f32>>,
        /// Global expert id per received row, `[num_recv]`.
        topk_ids: Option<HostTensor<u32>>,
        /// Routing weight per received row, `[num_recv]`.
        topk_weights: Option<HostTensor<f32>>,
        /// Received-token count per local expert, ordered by expert id.
        /// Downstream buffers are sized from these.
        num_recv_tokens_per_expert: Vec<usize>,
    },

    /// Fixed-capacity padded per-expert buffers, 8-bit quantized.
    LowLatency {
        /// Quantized rows, `[num_local_experts, world * capacity, hidden]`.
        hidden_states_q: HostTensor<i8>,
        /// Per-slot dequantization scale, `[num_local_experts, world * capacity]`.
        scales: HostTensor<f32>,
        /// 1 where the slot holds a real token, `[num_local_experts, world * capacity]`.
        valid_mask: HostTensor<u8>,
        /// The per-expert per-source slot capacity the buffers were padded
        /// to.
        expected_tokens_per_expert: usize,
    },
}

impl DispatchOutput {
    /// The wire format this payload was produced in.
    #[must_use]
    pub fn format(&self) -> DispatchOutputFormat {
        match self {
            Self::Standard => DispatchOutputFormat::Standard,
            Self::Normal { .. } => DispatchOutputFormat::Normal,
            Self::LowLatency { .. } => DispatchOutputFormat::LowLatency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_matches_variant() {
        assert!(DispatchOutput::Standard.format().is_standard());

        let normal = DispatchOutput::Normal {
            hidden_states: HostTensor::zeros(&[0, 4]),
            hidden_states_scale: None,
            topk_ids: None,
            topk_weights: None,
            num_recv_tokens_per_expert: vec![0, 0],
        };
        assert!(normal.format().is_normal());

        let ll = DispatchOutput::LowLatency {
            hidden_states_q: HostTensor::zeros(&[2, 8, 4]),
            scales: HostTensor::zeros(&[2, 8]),
            valid_mask: HostTensor::zeros(&[2, 8]),
            expected_tokens_per_expert: 4,
        };
        assert!(ll.format().is_low_latency());
    }
}
