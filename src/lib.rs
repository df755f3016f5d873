// Library root
// -----------
// Client side of the CI run upload protocol. The binary (`main.rs`) wires
// these modules into a command line tool.
//
// Module responsibilities:
// - `artifacts`: artifact kinds and loading declared files into memory.
// - `api`: protocol types and the HTTP backend client.
// - `uploader`: single-shot transfer of a buffer to a negotiated slot URL.
// - `coordinator`: the end-to-end run (load, start, negotiate, upload,
//   finalize) and the readiness poll.
// - `config`: backend URL, auth token source and upload tuning.
// - `error`: error taxonomy, tagged by run phase.
// - `ui`: spinner and result printing for the CLI.
pub mod api;
pub mod artifacts;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ui;
pub mod uploader;

#[cfg(test)]
mod http_stub;

pub use api::{
    BackendClient, HttpBackendClient, ProviderMetadata, RunArgs, SessionId, SessionReport,
    SessionStatus, SessionType, SlotId, StartSessionRequest, UploadSlot,
};
pub use artifacts::{
    ArtifactBuffers, ArtifactKind, ArtifactLoader, DeclaredArtifacts, FileSource, FsSource,
};
pub use config::{ClientConfig, RetryPolicy, SlotFailurePolicy, TokenProvider, UploadOptions};
pub use coordinator::{wait_for_ready, RunResult, SessionCoordinator, WaitOptions};
pub use error::{BackendError, RunError, RunPhase, UploadError};
pub use uploader::{HttpSlotUploader, SlotUploader};
