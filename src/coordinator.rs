// Run orchestration.
//
// One run walks five phases strictly in order:
//
//   Loading -> SessionOpen -> Negotiated -> Uploading -> Finalized
//
// Each phase needs the previous phase's output, so there is no reordering.
// The only concurrency is inside Uploading, where each slot runs its own
// transfer-then-acknowledge pair. Any failure aborts the run and is returned
// as a `RunError` tagged with the phase it happened in.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::api::{
    BackendClient, SessionId, SessionReport, SessionStatus, StartSessionRequest, UploadSlot,
};
use crate::artifacts::{ArtifactBuffers, ArtifactLoader, DeclaredArtifacts};
use crate::config::{SlotFailurePolicy, UploadOptions};
use crate::error::{RunError, RunPhase};
use crate::uploader::SlotUploader;

/// What a successful run reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub session_id: SessionId,
    pub web_url: Option<String>,
    pub status: SessionStatus,
}

/// A slot paired with the buffer that will fill it.
#[derive(Debug, Clone)]
struct PlannedUpload {
    slot: UploadSlot,
    content: Bytes,
}

pub struct SessionCoordinator {
    backend: Arc<dyn BackendClient>,
    uploader: Arc<dyn SlotUploader>,
    loader: ArtifactLoader,
    options: UploadOptions,
}

impl SessionCoordinator {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        uploader: Arc<dyn SlotUploader>,
        loader: ArtifactLoader,
        options: UploadOptions,
    ) -> Self {
        SessionCoordinator {
            backend,
            uploader,
            loader,
            options,
        }
    }

    /// Upload one CI run and return the session's final state.
    pub async fn upload_ci_run(
        &self,
        declared: &DeclaredArtifacts,
        request: &StartSessionRequest,
    ) -> Result<RunResult, RunError> {
        self.upload_ci_run_with_cancel(declared, request, &CancellationToken::new())
            .await
    }

    /// Like [`upload_ci_run`](Self::upload_ci_run), but stops at the next
    /// suspension point once `cancel` fires. Transfers already in flight are
    /// left to finish; none of them is acknowledged after cancellation.
    pub async fn upload_ci_run_with_cancel(
        &self,
        declared: &DeclaredArtifacts,
        request: &StartSessionRequest,
        cancel: &CancellationToken,
    ) -> Result<RunResult, RunError> {
        let span = info_span!("upload_ci_run", session_type = ?request.session_type);
        self.run(declared, request, cancel).instrument(span).await
    }

    async fn run(
        &self,
        declared: &DeclaredArtifacts,
        request: &StartSessionRequest,
        cancel: &CancellationToken,
    ) -> Result<RunResult, RunError> {
        let buffers =
            until_cancelled(cancel, RunPhase::Loading, self.loader.load_all(declared)).await?;
        info!(artifacts = buffers.len(), "loaded artifacts");

        let session_id = until_cancelled(cancel, RunPhase::SessionOpen, async {
            self.backend.start_session(request).await.map_err(RunError::SessionStart)
        })
        .await?;
        info!(%session_id, "session started");

        let slots = until_cancelled(cancel, RunPhase::Negotiated, async {
            self.backend
                .get_upload_urls(&session_id, &declared.kinds())
                .await
                .map_err(|source| RunError::Negotiation {
                    session_id: session_id.clone(),
                    source,
                })
        })
        .await?;
        info!(
            %session_id,
            declared = declared.len(),
            requested = slots.len(),
            "negotiated upload slots"
        );

        let planned = plan_uploads(slots, &buffers)?;
        self.upload_batch(&session_id, planned, cancel).await?;

        let report = until_cancelled(cancel, RunPhase::Finalized, async {
            self.backend
                .get_session(&session_id)
                .await
                .map_err(|source| RunError::Finalize {
                    session_id: session_id.clone(),
                    source,
                })
        })
        .await?;
        info!(%session_id, status = %report.status, web_url = ?report.web_url, "run finalized");

        Ok(RunResult {
            session_id,
            web_url: report.web_url,
            status: report.status,
        })
    }

    async fn upload_batch(
        &self,
        session_id: &SessionId,
        planned: Vec<PlannedUpload>,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let limit = self.options.max_concurrent_uploads.max(1);
        let mut pending = planned.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut first_error: Option<RunError> = None;

        loop {
            while first_error.is_none() && !cancel.is_cancelled() && in_flight.len() < limit {
                match pending.next() {
                    Some(upload) => in_flight.push(self.upload_slot(session_id, upload, cancel)),
                    None => break,
                }
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            if let Err(err) = result {
                warn!(%session_id, error = %err, "slot failed, no further slots will start");
                if first_error.is_none() {
                    first_error = Some(err);
                }
                if self.options.on_slot_failure == SlotFailurePolicy::AbortInFlight {
                    break;
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled {
                phase: RunPhase::Uploading,
            });
        }
        Ok(())
    }

    async fn upload_slot(
        &self,
        session_id: &SessionId,
        upload: PlannedUpload,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let PlannedUpload { slot, content } = upload;
        debug!(kind = %slot.kind, slot_id = %slot.id, bytes = content.len(), "uploading");

        self.uploader
            .upload(&slot.url, content)
            .await
            .map_err(|source| RunError::Upload {
                kind: slot.kind,
                url: slot.url.clone(),
                source,
            })?;

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled {
                phase: RunPhase::Uploading,
            });
        }
        self.acknowledge(session_id, &slot, cancel).await
    }

    /// Mark `slot` complete, retrying with backoff. The transfer itself is
    /// never repeated.
    async fn acknowledge(
        &self,
        session_id: &SessionId,
        slot: &UploadSlot,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let policy = self.options.completion_retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.backend.mark_upload_as_complete(session_id, &slot.id).await {
                Ok(()) => {
                    info!(kind = %slot.kind, slot_id = %slot.id, attempt, "upload acknowledged");
                    return Ok(());
                }
                Err(source) if attempt >= max_attempts => {
                    return Err(RunError::Completion {
                        kind: slot.kind,
                        slot_id: slot.id.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => {
                    warn!(
                        kind = %slot.kind,
                        slot_id = %slot.id,
                        attempt,
                        error = %err,
                        "acknowledgment failed, retrying"
                    );
                    attempt += 1;
                    until_cancelled(cancel, RunPhase::Uploading, async {
                        tokio::time::sleep(policy.delay_before(attempt)).await;
                        Ok(())
                    })
                    .await?;
                }
            }
        }
    }
}

/// Pair each negotiated slot with its buffer by kind. A slot for a kind that
/// was never loaded means client and backend disagree about the protocol.
fn plan_uploads(
    slots: Vec<UploadSlot>,
    buffers: &ArtifactBuffers,
) -> Result<Vec<PlannedUpload>, RunError> {
    slots
        .into_iter()
        .map(|slot| match buffers.get(slot.kind) {
            Some(content) => Ok(PlannedUpload { slot, content }),
            None => Err(RunError::UnmatchedSlot {
                slot_id: slot.id,
                kind: slot.kind,
            }),
        })
        .collect()
}

async fn until_cancelled<T, F>(
    cancel: &CancellationToken,
    phase: RunPhase,
    fut: F,
) -> Result<T, RunError>
where
    F: Future<Output = Result<T, RunError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunError::Cancelled { phase }),
        res = fut => res,
    }
}

/// How long and how often to poll for readiness.
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Poll `get_session` until the status leaves `pending` or the timeout
/// elapses. Returns the last report either way; a report that is still
/// pending means the timeout was hit.
pub async fn wait_for_ready(
    backend: &dyn BackendClient,
    session_id: &SessionId,
    options: WaitOptions,
) -> Result<SessionReport, RunError> {
    let deadline = Instant::now() + options.timeout;
    loop {
        let report = backend
            .get_session(session_id)
            .await
            .map_err(|source| RunError::Finalize {
                session_id: session_id.clone(),
                source,
            })?;
        if !report.status.is_pending() || Instant::now() + options.poll_interval >= deadline {
            return Ok(report);
        }
        debug!(%session_id, "session still pending");
        tokio::time::sleep(options.poll_interval).await;
    }
}
