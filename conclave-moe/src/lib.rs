//! MoE token dispatch for the Conclave control plane.
//!
//! The model executor calls into a [`TokenDispatcher`] once per MoE layer
//! per compute step: `dispatch` moves each token's hidden state to the rank
//! owning its selected experts, `combine` gathers expert outputs back into
//! original token order. Three interchangeable wire-format strategies
//! implement the contract; the deployment configuration picks one at
//! construction and it is never renegotiated per call.

pub mod dispatcher;
pub mod low_latency;
pub mod normal;
pub mod output;
pub mod standard;
mod wire;

pub use conclave::DispatchOutputFormat;
pub use dispatcher::{
    build_dispatcher, DispatcherConfig, ExpertLayout, RoutingDecision, TokenDispatcher,
};
pub use low_latency::LowLatencyDispatcher;
pub use normal::NormalDispatcher;
pub use output::DispatchOutput;
pub use standard::StandardDispatcher;
