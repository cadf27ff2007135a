//! Request routing into the scheduler core.
//!
//! The scheduler collaborator exposes one handler entry point per request
//! variant; [`route`] is an exhaustive match from variant tag to handler,
//! fixed at build time. Handlers default to failing with
//! [`Error::UnhandledRequest`](conclave::Error::UnhandledRequest): a
//! variant reaching a core that never implemented it is a build mismatch
//! between transport and scheduler, and it terminates the worker rather
//! than being silently ignored.

use conclave::request::{
    AbortRequest, CloseSessionRequest, EmbedRequest, GenerateRequest, GetWeightsByNameRequest,
    InitWeightsUpdateGroupRequest, OpenSessionRequest, ProfileRequest,
    UpdateWeightsFromDiskRequest, UpdateWeightsFromDistributedRequest,
    UpdateWeightsFromTensorRequest,
};
use conclave::{Error, Reply, Request, RequestKind, Result};
use serde::{Deserialize, Serialize};

/// Capacity figures a worker reports to its parent in the startup
/// handshake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerCapacities {
    /// Maximum total token budget across the running batch.
    pub max_total_num_tokens: usize,
    /// Maximum input length of a single request.
    pub max_req_input_len: usize,
}

/// The scheduler collaborator.
///
/// Implementations own batching, eviction, and the model executor; this
/// crate only drives them. Handlers run on every rank with identical
/// arguments (the broadcast guarantees it) and may freely mutate scheduler
/// state. A handler returns `Ok(Some(reply))` to answer the originator —
/// the communicator forwards the reply on the leader and discards it on
/// followers.
pub trait SchedulerCore {
    /// Capacity figures for the startup handshake.
    fn capacities(&self) -> WorkerCapacities;

    /// One compute step: schedule a batch, run the model executor, publish
    /// generation output through the sink the core was constructed with.
    ///
    /// # Errors
    /// Any error here is unrecoverable for the worker.
    fn process_batch(&mut self) -> Result<()>;

    fn handle_generate(&mut self, request: GenerateRequest) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::Generate))
    }

    fn handle_embed(&mut self, request: EmbedRequest) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::Embed))
    }

    fn flush_cache(&mut self) -> Result<Option<Reply>> {
        Err(Error::UnhandledRequest(RequestKind::FlushCache))
    }

    fn abort_request(&mut self, request: AbortRequest) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::Abort))
    }

    fn update_weights_from_disk(
        &mut self,
        request: UpdateWeightsFromDiskRequest,
    ) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::UpdateWeightsFromDisk))
    }

    fn init_weights_update_group(
        &mut self,
        request: InitWeightsUpdateGroupRequest,
    ) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::InitWeightsUpdateGroup))
    }

    fn update_weights_from_distributed(
        &mut self,
        request: UpdateWeightsFromDistributedRequest,
    ) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(
            RequestKind::UpdateWeightsFromDistributed,
        ))
    }

    fn update_weights_from_tensor(
        &mut self,
        request: UpdateWeightsFromTensorRequest,
    ) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::UpdateWeightsFromTensor))
    }

    fn get_weights_by_name(
        &mut self,
        request: GetWeightsByNameRequest,
    ) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::GetWeightsByName))
    }

    fn profile(&mut self, request: ProfileRequest) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::Profile))
    }

    fn open_session(&mut self, request: OpenSessionRequest) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::OpenSession))
    }

    fn close_session(&mut self, request: CloseSessionRequest) -> Result<Option<Reply>> {
        let _ = request;
        Err(Error::UnhandledRequest(RequestKind::CloseSession))
    }

    fn release_memory_occupation(&mut self) -> Result<Option<Reply>> {
        Err(Error::UnhandledRequest(RequestKind::ReleaseMemoryOccupation))
    }

    fn resume_memory_occupation(&mut self) -> Result<Option<Reply>> {
        Err(Error::UnhandledRequest(RequestKind::ResumeMemoryOccupation))
    }
}

/// Dispatch one request to the core's matching handler.
///
/// Exactly one handler is invoked per call; the variant set is closed, so
/// coverage is checked at build time.
///
/// # Errors
/// Propagates the handler's error, including the fatal
/// `UnhandledRequest` defaults.
pub fn route<S: SchedulerCore + ?Sized>(core: &mut S, request: Request) -> Result<Option<Reply>> {
    match request {
        Request::Generate(req) => core.handle_generate(req),
        Request::Embed(req) => core.handle_embed(req),
        Request::FlushCache => core.flush_cache(),
        Request::Abort(req) => core.abort_request(req),
        Request::UpdateWeightsFromDisk(req) => core.update_weights_from_disk(req),
        Request::InitWeightsUpdateGroup(req) => core.init_weights_update_group(req),
        Request::UpdateWeightsFromDistributed(req) => core.update_weights_from_distributed(req),
        Request::UpdateWeightsFromTensor(req) => core.update_weights_from_tensor(req),
        Request::GetWeightsByName(req) => core.get_weights_by_name(req),
        Request::Profile(req) => core.profile(req),
        Request::OpenSession(req) => core.open_session(req),
        Request::CloseSession(req) => core.close_session(req),
        Request::ReleaseMemoryOccupation => core.release_memory_occupation(),
        Request::ResumeMemoryOccupation => core.resume_memory_occupation(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave::request::ProfileAction;

    #[derive(Default)]
    struct CountingCore {
        generates: usize,
        embeds: usize,
        flushes: usize,
    }

    impl SchedulerCore for CountingCore {
        fn capacities(&self) -> WorkerCapacities {
            WorkerCapacities {
                max_total_num_tokens: 0,
                max_req_input_len: 0,
            }
        }

        fn process_batch(&mut self) -> Result<()> {
            Ok(())
        }

        fn handle_generate(&mut self, _: GenerateRequest) -> Result<Option<Reply>> {
            self.generates += 1;
            Ok(None)
        }

        fn handle_embed(&mut self, _: EmbedRequest) -> Result<Option<Reply>> {
            self.embeds += 1;
            Ok(None)
        }

        fn flush_cache(&mut self) -> Result<Option<Reply>> {
            self.flushes += 1;
            Ok(Some(Reply::CacheFlushed { success: true }))
        }
    }

    fn gen_request() -> Request {
        Request::Generate(GenerateRequest {
            request_id: "g".into(),
            input_ids: vec![1],
            sampling: Default::default(),
            session_id: None,
            return_logprob: false,
            stream: false,
        })
    }

    #[test]
    fn each_variant_hits_exactly_its_handler() {
        let mut core = CountingCore::default();

        route(&mut core, gen_request()).unwrap();
        assert_eq!((core.generates, core.embeds), (1, 0));

        route(
            &mut core,
            Request::Embed(EmbedRequest {
                request_id: "e".into(),
                input_ids: vec![2],
            }),
        )
        .unwrap();
        assert_eq!((core.generates, core.embeds), (1, 1));
    }

    #[test]
    fn handler_reply_is_returned() {
        let mut core = CountingCore::default();
        let reply = route(&mut core, Request::FlushCache).unwrap();
        assert!(matches!(reply, Some(Reply::CacheFlushed { success: true })));
        assert_eq!(core.flushes, 1);
    }

    #[test]
    fn unimplemented_handler_is_fatal() {
        let mut core = CountingCore::default();
        let err = route(
            &mut core,
            Request::Profile(ProfileRequest {
                action: ProfileAction::Start,
                output_dir: None,
            }),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::UnhandledRequest(RequestKind::Profile)
        ));
        // and nothing was silently swallowed
        assert_eq!((core.generates, core.embeds, core.flushes), (0, 0, 0));
    }
}
