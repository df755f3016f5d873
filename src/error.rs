// Error types for the upload protocol.
//
// `BackendError` and `UploadError` are the leaf failures of the two
// transports (backend API and pre-signed slot URLs). `RunError` is what a
// caller of `SessionCoordinator::upload_ci_run` sees: every variant names the
// phase it aborted in and carries enough context (path, kind, url, slot id)
// to diagnose the failure without re-running blindly.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::api::{SessionId, SlotId};
use crate::artifacts::ArtifactKind;

/// Failure of a single request/response exchange with the backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The exchange broke below HTTP: DNS, TLS, a reset, or a body cut short.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success status code.
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("could not decode response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },

    /// No usable auth token could be obtained.
    #[error("no usable auth token: {0}")]
    Auth(String),
}

/// Failure of a single-shot transfer to a negotiated slot URL.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("transfer failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("destination rejected upload with {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// The phase of a run a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Loading,
    SessionOpen,
    Negotiated,
    Uploading,
    Finalized,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Loading => "loading",
            RunPhase::SessionOpen => "session start",
            RunPhase::Negotiated => "negotiation",
            RunPhase::Uploading => "uploading",
            RunPhase::Finalized => "finalize",
        };
        f.write_str(name)
    }
}

/// Typed failure of one `upload_ci_run` invocation.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not read {kind} artifact at {}: {source}", path.display())]
    Load {
        kind: ArtifactKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not start session: {0}")]
    SessionStart(#[source] BackendError),

    #[error("could not negotiate upload slots for session {session_id}: {source}")]
    Negotiation {
        session_id: SessionId,
        #[source]
        source: BackendError,
    },

    /// The backend issued a slot for a kind this run never declared.
    #[error("backend issued slot {slot_id} for {kind}, which this run did not declare")]
    UnmatchedSlot { slot_id: SlotId, kind: ArtifactKind },

    #[error("upload of {kind} to {url} failed: {source}")]
    Upload {
        kind: ArtifactKind,
        url: String,
        #[source]
        source: UploadError,
    },

    #[error("could not acknowledge slot {slot_id} ({kind}) after {attempts} attempt(s): {source}")]
    Completion {
        kind: ArtifactKind,
        slot_id: SlotId,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// The final status read failed. The remote session may still be intact.
    #[error("could not read final state of session {session_id}: {source}")]
    Finalize {
        session_id: SessionId,
        #[source]
        source: BackendError,
    },

    #[error("run cancelled during {phase}")]
    Cancelled { phase: RunPhase },
}

impl RunError {
    /// Phase the run was aborted in.
    pub fn phase(&self) -> RunPhase {
        match self {
            RunError::Load { .. } => RunPhase::Loading,
            RunError::SessionStart(_) => RunPhase::SessionOpen,
            RunError::Negotiation { .. } | RunError::UnmatchedSlot { .. } => RunPhase::Negotiated,
            RunError::Upload { .. } | RunError::Completion { .. } => RunPhase::Uploading,
            RunError::Finalize { .. } => RunPhase::Finalized,
            RunError::Cancelled { phase } => *phase,
        }
    }
}
