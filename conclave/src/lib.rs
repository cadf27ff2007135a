//! Conclave: the distributed control plane of an LLM inference server.
//!
//! This crate provides the core types shared by the scheduler communicator
//! and the MoE dispatch contract: the closed request/reply message set, the
//! deployment configuration, the rank topology, the collective
//! [`ProcessGroup`] seam, and the host tensor used by dispatch payloads.
//!
//! The runtime loop lives in `conclave-runtime`; the dispatcher strategies
//! live in `conclave-moe`.

pub mod collective;
pub mod config;
pub mod dtype;
pub mod error;
pub mod request;
pub mod tensor;
pub mod topology;

pub use collective::{LocalProcessGroup, ProcessGroup};
pub use config::{DispatchOutputFormat, ServerConfig};
pub use dtype::{DType, TensorDType};
pub use error::{Error, Result};
pub use request::{GenerationOutput, Reply, Request, RequestKind};
pub use tensor::HostTensor;
pub use topology::RankTopology;
