//! Scheduler worker entry point.
//!
//! Each rank runs one worker: construct the core and communicator, report
//! readiness to the parent over a pipe, then loop
//! `{ poll requests -> compute step }` until the process is torn down or an
//! error escapes. An escaped error is logged with its full chain and the
//! parent is signaled exactly once — correctness of the next compute step
//! depends on all ranks being alive and synchronized, so one rank's
//! unrecoverable error must bring the group down rather than let it
//! silently diverge.

use std::io::Write;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getppid, Pid};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use conclave::{ProcessGroup, Result};

use crate::communicator::SchedulerCommunicator;
use crate::router::{SchedulerCore, WorkerCapacities};

/// The single structured message a worker writes to the parent-owned pipe
/// before entering its main loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyMessage {
    pub status: String,
    pub max_total_num_tokens: usize,
    pub max_req_input_len: usize,
}

impl ReadyMessage {
    #[must_use]
    pub fn ready(capacities: WorkerCapacities) -> Self {
        Self {
            status: "ready".into(),
            max_total_num_tokens: capacities.max_total_num_tokens,
            max_req_input_len: capacities.max_req_input_len,
        }
    }
}

/// How a worker notifies its parent process of an unrecoverable failure.
///
/// Injected so the crash path is testable; production workers use
/// [`ParentProcess`].
pub trait ParentHandle {
    fn signal_failure(&self);
}

/// The real parent process, signaled with SIGQUIT.
pub struct ParentProcess {
    pid: Pid,
}

impl ParentProcess {
    /// The parent of the current process.
    #[must_use]
    pub fn current() -> Self {
        Self { pid: getppid() }
    }
}

impl ParentHandle for ParentProcess {
    fn signal_failure(&self) {
        // If the parent is already gone there is nobody left to tell.
        let _ = kill(self.pid, Signal::SIGQUIT);
    }
}

/// Install the global tracing subscriber for a worker process.
///
/// Filtering follows `RUST_LOG`; repeated calls (tests, embedded use) are
/// harmless no-ops.
pub fn configure_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

/// The per-rank label carried by every log line a worker emits.
#[must_use]
pub fn rank_label(tp_rank: usize, dp_rank: Option<usize>) -> String {
    match dp_rank {
        Some(dp) => format!("DP{dp} TP{tp_rank}"),
        None => format!("TP{tp_rank}"),
    }
}

/// Build a communicator and run its loop until an error escapes.
///
/// `build` runs inside the guarded region, so construction failures follow
/// the same crash path as loop failures: log the full chain, signal the
/// parent once, return. The readiness handshake is written after
/// construction succeeds and before the first iteration.
pub fn run_worker<G, S, F, W, P>(label: &str, build: F, handshake: W, parent: &P)
where
    G: ProcessGroup,
    S: SchedulerCore,
    F: FnOnce() -> Result<SchedulerCommunicator<G, S>>,
    W: Write,
    P: ParentHandle + ?Sized,
{
    let span = tracing::info_span!("scheduler", rank = label);
    let _guard = span.enter();

    if let Err(err) = serve(build, handshake) {
        tracing::error!("scheduler worker hit an unrecoverable error: {}", error_chain(&err));
        parent.signal_failure();
    }
}

fn serve<G, S, F, W>(build: F, mut handshake: W) -> Result<()>
where
    G: ProcessGroup,
    S: SchedulerCore,
    F: FnOnce() -> Result<SchedulerCommunicator<G, S>>,
    W: Write,
{
    let mut communicator = build()?;

    let ready = ReadyMessage::ready(communicator.core().capacities());
    serde_json::to_writer(&mut handshake, &ready)?;
    handshake.write_all(b"\n")?;
    handshake.flush()?;

    tracing::info!(
        max_total_num_tokens = ready.max_total_num_tokens,
        max_req_input_len = ready.max_req_input_len,
        "scheduler worker ready"
    );

    loop {
        communicator.poll_requests()?;
        communicator.core_mut().process_batch()?;
    }
}

/// Render an error and its source chain on one line.
fn error_chain(err: &conclave::Error) -> String {
    use std::error::Error as _;
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
