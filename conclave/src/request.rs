//! Control-plane message payloads.
//!
//! [`Request`] is the closed set of inbound message kinds a scheduler worker
//! can receive; [`Reply`] is the closed set of synchronous handler results
//! sent back to the originator; [`GenerationOutput`] is the asynchronous
//! batch output pushed to the downstream consumer.
//!
//! The broadcaster and router only ever inspect the variant tag. Payload
//! contents are interpreted by the scheduler core, so fields here are plain
//! data with serde derives (requests cross the collective wire).

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inbound requests
// ---------------------------------------------------------------------------

/// Sampling parameters carried by a generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub max_new_tokens: usize,
    #[serde(default)]
    pub stop_token_ids: Vec<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: -1,
            max_new_tokens: 128,
            stop_token_ids: Vec::new(),
        }
    }
}

/// A tokenized generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub request_id: String,
    pub input_ids: Vec<u32>,
    #[serde(default)]
    pub sampling: SamplingParams,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub return_logprob: bool,
    #[serde(default)]
    pub stream: bool,
}

/// A tokenized embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub request_id: String,
    pub input_ids: Vec<u32>,
}

/// Cancel an in-flight request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub request_id: String,
}

/// Reload model weights from a checkpoint on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateWeightsFromDiskRequest {
    pub model_path: String,
    #[serde(default)]
    pub load_format: Option<String>,
}

/// Establish the process group used for distributed weight updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitWeightsUpdateGroupRequest {
    pub master_address: String,
    pub master_port: u16,
    pub rank_offset: usize,
    pub world_size: usize,
    pub group_name: String,
    pub backend: String,
}

/// Receive updated weights over the distributed weight-update group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateWeightsFromDistributedRequest {
    pub names: Vec<String>,
    pub dtypes: Vec<String>,
    pub shapes: Vec<Vec<usize>>,
}

/// A serialized named tensor shipped inline with a weight-update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedTensorBlob {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

/// Replace weights with tensors carried in the request itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateWeightsFromTensorRequest {
    pub tensors: Vec<NamedTensorBlob>,
}

/// Read back a named parameter (truncated) for verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetWeightsByNameRequest {
    pub name: String,
    pub truncate_size: usize,
}

/// Start or stop the profiler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRequest {
    pub action: ProfileAction,
    #[serde(default)]
    pub output_dir: Option<String>,
}

/// Open a multi-turn session with a reserved capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_id: String,
}

/// The closed set of inbound request kinds.
///
/// Work requests (`Generate`, `Embed`) feed the compute batch; everything
/// else is a control request. The distinction matters only to the
/// broadcaster, which routes the two categories over different process
/// groups when data-parallel attention is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Generate(GenerateRequest),
    Embed(EmbedRequest),
    FlushCache,
    Abort(AbortRequest),
    UpdateWeightsFromDisk(UpdateWeightsFromDiskRequest),
    InitWeightsUpdateGroup(InitWeightsUpdateGroupRequest),
    UpdateWeightsFromDistributed(UpdateWeightsFromDistributedRequest),
    UpdateWeightsFromTensor(UpdateWeightsFromTensorRequest),
    GetWeightsByName(GetWeightsByNameRequest),
    Profile(ProfileRequest),
    OpenSession(OpenSessionRequest),
    CloseSession(CloseSessionRequest),
    ReleaseMemoryOccupation,
    ResumeMemoryOccupation,
}

impl Request {
    /// The variant tag, without payload.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Generate(_) => RequestKind::Generate,
            Self::Embed(_) => RequestKind::Embed,
            Self::FlushCache => RequestKind::FlushCache,
            Self::Abort(_) => RequestKind::Abort,
            Self::UpdateWeightsFromDisk(_) => RequestKind::UpdateWeightsFromDisk,
            Self::InitWeightsUpdateGroup(_) => RequestKind::InitWeightsUpdateGroup,
            Self::UpdateWeightsFromDistributed(_) => RequestKind::UpdateWeightsFromDistributed,
            Self::UpdateWeightsFromTensor(_) => RequestKind::UpdateWeightsFromTensor,
            Self::GetWeightsByName(_) => RequestKind::GetWeightsByName,
            Self::Profile(_) => RequestKind::Profile,
            Self::OpenSession(_) => RequestKind::OpenSession,
            Self::CloseSession(_) => RequestKind::CloseSession,
            Self::ReleaseMemoryOccupation => RequestKind::ReleaseMemoryOccupation,
            Self::ResumeMemoryOccupation => RequestKind::ResumeMemoryOccupation,
        }
    }

    /// Whether this request feeds the compute batch (generation/embedding)
    /// as opposed to controlling the worker.
    #[must_use]
    pub fn is_work(&self) -> bool {
        matches!(self, Self::Generate(_) | Self::Embed(_))
    }
}

/// Fieldless tag for a [`Request`] variant, used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Generate,
    Embed,
    FlushCache,
    Abort,
    UpdateWeightsFromDisk,
    InitWeightsUpdateGroup,
    UpdateWeightsFromDistributed,
    UpdateWeightsFromTensor,
    GetWeightsByName,
    Profile,
    OpenSession,
    CloseSession,
    ReleaseMemoryOccupation,
    ResumeMemoryOccupation,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Generate => "generate",
            Self::Embed => "embed",
            Self::FlushCache => "flush-cache",
            Self::Abort => "abort",
            Self::UpdateWeightsFromDisk => "update-weights-from-disk",
            Self::InitWeightsUpdateGroup => "init-weights-update-group",
            Self::UpdateWeightsFromDistributed => "update-weights-from-distributed",
            Self::UpdateWeightsFromTensor => "update-weights-from-tensor",
            Self::GetWeightsByName => "get-weights-by-name",
            Self::Profile => "profile",
            Self::OpenSession => "open-session",
            Self::CloseSession => "close-session",
            Self::ReleaseMemoryOccupation => "release-memory-occupation",
            Self::ResumeMemoryOccupation => "resume-memory-occupation",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Outbound replies
// ---------------------------------------------------------------------------

/// Synchronous handler results, sent back to the request's originator.
///
/// Only handlers with something to report produce a reply; `None` from a
/// handler means nothing is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    WeightsUpdated {
        success: bool,
        message: String,
    },
    WeightValues {
        name: String,
        values: Vec<f32>,
    },
    SessionOpened {
        session_id: Option<String>,
    },
    SessionClosed {
        session_id: String,
    },
    CacheFlushed {
        success: bool,
    },
    Aborted {
        request_id: String,
    },
    MemoryReleased,
    MemoryResumed,
    ProfileDone,
}

/// One batch of asynchronous generation output.
///
/// Pushed through the output sink to the downstream consumer (detokenizer
/// or direct client path). Parallel vectors, one entry per request in the
/// batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub request_ids: Vec<String>,
    pub output_ids: Vec<Vec<u32>>,
    pub finished: Vec<bool>,
    #[serde(default)]
    pub logprobs: Option<Vec<Vec<f32>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_requests_are_generate_and_embed() {
        let gen = Request::Generate(GenerateRequest {
            request_id: "r1".into(),
            input_ids: vec![1, 2, 3],
            sampling: SamplingParams::default(),
            session_id: None,
            return_logprob: false,
            stream: false,
        });
        let embed = Request::Embed(EmbedRequest {
            request_id: "r2".into(),
            input_ids: vec![4],
        });

        assert!(gen.is_work());
        assert!(embed.is_work());
        assert!(!Request::FlushCache.is_work());
        assert!(!Request::ReleaseMemoryOccupation.is_work());
        assert!(!Request::Abort(AbortRequest {
            request_id: "r1".into()
        })
        .is_work());
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Request::FlushCache.kind(), RequestKind::FlushCache);
        assert_eq!(
            Request::Profile(ProfileRequest {
                action: ProfileAction::Start,
                output_dir: None,
            })
            .kind(),
            RequestKind::Profile
        );
        assert_eq!(RequestKind::GetWeightsByName.to_string(), "get-weights-by-name");
    }

    #[test]
    fn requests_survive_the_wire() {
        let req = Request::Generate(GenerateRequest {
            request_id: "abc".into(),
            input_ids: vec![10, 20, 30],
            sampling: SamplingParams {
                temperature: 0.7,
                max_new_tokens: 64,
                ..SamplingParams::default()
            },
            session_id: Some("s0".into()),
            return_logprob: true,
            stream: false,
        });

        let bytes = serde_json::to_vec(&req).unwrap();
        let back: Request = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(back.kind(), RequestKind::Generate);
        let Request::Generate(g) = back else {
            panic!("wrong variant");
        };
        assert_eq!(g.request_id, "abc");
        assert_eq!(g.input_ids, vec![10, 20, 30]);
        assert_eq!(g.sampling.max_new_tokens, 64);
    }
}
