//! Deployment configuration for scheduler workers.
//!
//! Parsed once at process launch and treated as immutable. Invalid
//! combinations are fatal at validation time — a worker never starts with a
//! configuration its peers might disagree with.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Wire format produced by the MoE token dispatcher.
///
/// Selected once per deployment (parallel degree x latency target) and
/// stable for the lifetime of a dispatcher instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutputFormat {
    /// No cross-rank payload; the consumer already holds the tokens locally.
    Standard,
    /// Variable-length exact per-expert shards from all-to-all. Favors
    /// throughput; downstream buffers are sized from returned counts.
    Normal,
    /// Fixed-size padded per-expert buffers with 8-bit quantization.
    /// Trades memory and precision for eliminating the count round-trip.
    LowLatency,
}

impl DispatchOutputFormat {
    #[must_use]
    pub fn is_standard(self) -> bool {
        self == Self::Standard
    }

    #[must_use]
    pub fn is_normal(self) -> bool {
        self == Self::Normal
    }

    #[must_use]
    pub fn is_low_latency(self) -> bool {
        self == Self::LowLatency
    }
}

/// Static per-deployment configuration shared by every rank.
///
/// Every rank in a deployment must be launched with an identical value;
/// divergence here is a fatal misconfiguration, not a runtime condition.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Size of the full tensor-parallel group.
    pub tp_size: usize,
    /// Number of data-parallel attention replicas.
    #[serde(default = "default_dp_size")]
    pub dp_size: usize,
    /// Route work requests over the (smaller) attention-TP group instead of
    /// the full TP group.
    #[serde(default)]
    pub enable_dp_attention: bool,
    /// Wire format used by the MoE token dispatcher.
    #[serde(default = "default_dispatch_format")]
    pub dispatch_output_format: DispatchOutputFormat,
}

fn default_dp_size() -> usize {
    1
}

fn default_dispatch_format() -> DispatchOutputFormat {
    DispatchOutputFormat::Standard
}

impl ServerConfig {
    /// Check internal consistency.
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the parallel degrees don't compose.
    pub fn validate(&self) -> Result<()> {
        if self.tp_size == 0 {
            return Err(Error::Config("tp_size must be >= 1".into()));
        }
        if self.dp_size == 0 {
            return Err(Error::Config("dp_size must be >= 1".into()));
        }
        if self.tp_size % self.dp_size != 0 {
            return Err(Error::Config(format!(
                "tp_size {} is not divisible by dp_size {}",
                self.tp_size, self.dp_size
            )));
        }
        Ok(())
    }

    /// Size of the attention tensor-parallel group.
    ///
    /// With data-parallel attention the full TP group is carved into
    /// `dp_size` attention groups; without it the attention group is the
    /// full TP group.
    #[must_use]
    pub fn attn_tp_size(&self) -> usize {
        if self.enable_dp_attention {
            self.tp_size / self.dp_size
        } else {
            self.tp_size
        }
    }
}
