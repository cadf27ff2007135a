//! Scheduler communicator for the Conclave control plane.
//!
//! Binds the abstract mailbox to the collective request broadcast, routes
//! each request variant into the scheduler core, and runs the per-rank
//! worker loop. The model executor and batching policy live behind the
//! [`SchedulerCore`] seam; the transport lives behind the mailbox traits.

pub mod broadcaster;
pub mod communicator;
pub mod mailbox;
pub mod router;
pub mod worker;

pub use broadcaster::{broadcast_requests, drain_pending, split_work_control};
pub use communicator::SchedulerCommunicator;
pub use mailbox::{Endpoints, OutputSender, OutputSink, ReplySender, RequestReceiver};
pub use router::{route, SchedulerCore, WorkerCapacities};
pub use worker::{
    configure_logging, rank_label, run_worker, ParentHandle, ParentProcess, ReadyMessage,
};
