//! Composition root binding mailbox, topology, broadcaster, router, and the
//! scheduler core.

use conclave::{ProcessGroup, RankTopology, Request, Result, ServerConfig};

use crate::broadcaster::{broadcast_requests, drain_pending, split_work_control};
use crate::mailbox::Endpoints;
use crate::router::{route, SchedulerCore};

/// Drives one scheduler worker: drains the leader's mailbox, synchronizes
/// the batch across the group, routes each request into the core, and
/// forwards replies.
///
/// The core arrives already wired to its generation-output sink (the sink
/// is a constructor argument of the core, not a slot assigned later), so
/// the communicator never touches generation output — transport and compute
/// stay decoupled.
pub struct SchedulerCommunicator<G, S> {
    core: S,
    topology: RankTopology<G>,
    endpoints: Endpoints,
    partitioned: bool,
}

impl<G: ProcessGroup, S: SchedulerCore> SchedulerCommunicator<G, S> {
    /// Bind a core to this rank's topology and mailbox endpoints.
    ///
    /// # Errors
    /// Returns a configuration error if endpoint ownership contradicts the
    /// topology: exactly the group leader holds real endpoints.
    pub fn new(
        core: S,
        topology: RankTopology<G>,
        endpoints: Endpoints,
        config: &ServerConfig,
    ) -> Result<Self> {
        if topology.is_leader() != endpoints.requests.is_some() {
            return Err(conclave::Error::Config(format!(
                "rank {} (leader: {}) holds the wrong mailbox endpoints",
                topology.tp_rank(),
                topology.is_leader()
            )));
        }
        if endpoints.requests.is_some() != endpoints.replies.is_some() {
            return Err(conclave::Error::Config(
                "inbound mailbox and reply channel must be owned together".into(),
            ));
        }

        Ok(Self {
            core,
            topology,
            endpoints,
            partitioned: config.enable_dp_attention,
        })
    }

    /// One communication iteration: drain, synchronize, route.
    ///
    /// Every rank of the group must call this in lock-step — the broadcast
    /// inside is a collective. Returns once every drained request has been
    /// routed and its reply (if any) forwarded.
    ///
    /// # Errors
    /// Transport failures, closed mailboxes, and unhandled request variants
    /// are all fatal to the worker and propagate out.
    pub fn poll_requests(&mut self) -> Result<()> {
        let batch = self.recv_requests()?;
        for request in batch {
            let kind = request.kind();
            tracing::debug!(%kind, "routing request");
            let reply = route(&mut self.core, request)?;
            if let Some(reply) = reply {
                if let Some(replies) = &self.endpoints.replies {
                    replies.send(reply)?;
                }
            }
        }
        Ok(())
    }

    /// Drain the leader's mailbox and replicate the batch group-wide.
    ///
    /// Partitioned mode (data-parallel attention): work requests travel
    /// over the small attention-TP group from its leader; control requests
    /// travel over the full TP group from global rank 0. The merged batch
    /// is always `work ++ control`.
    fn recv_requests(&mut self) -> Result<Vec<Request>> {
        let drained = drain_pending(self.endpoints.requests.as_deref_mut())?;

        if self.partitioned {
            let (work, control) = split_work_control(drained);
            // Control requests only originate at the rank that is leader of
            // the full TP group; other attention leaders drop theirs (the
            // front-end routes control traffic to rank 0's mailbox).
            let control = if self.topology.tp_rank() == 0 {
                control
            } else {
                Vec::new()
            };

            let (attn_group, tp_group) = self.topology.groups_mut();
            let mut batch = broadcast_requests(work, 0, attn_group)?;
            let control = broadcast_requests(control, 0, tp_group)?;
            batch.extend(control);
            Ok(batch)
        } else {
            broadcast_requests(drained, 0, self.topology.tp_group_mut())
        }
    }

    /// The rank topology this communicator was built with.
    #[must_use]
    pub fn topology(&self) -> &RankTopology<G> {
        &self.topology
    }

    #[must_use]
    pub fn core(&self) -> &S {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut S {
        &mut self.core
    }
}
