//! In-memory collaborators for driving `SessionCoordinator` in tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use ci_upload::{
    ArtifactKind, ArtifactLoader, BackendClient, BackendError, DeclaredArtifacts, FileSource,
    ProviderMetadata, RetryPolicy, RunArgs, SessionCoordinator, SessionId, SessionReport,
    SessionStatus, SlotFailurePolicy, SlotId, SlotUploader, StartSessionRequest, UploadError,
    UploadOptions, UploadSlot,
};

/// Ordered record of every protocol call, shared by the fakes.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn contents(kind: ArtifactKind) -> Vec<u8> {
    format!("contents of {kind}").into_bytes()
}

pub fn slot_id(kind: ArtifactKind) -> SlotId {
    SlotId::from(format!("slot-{kind}"))
}

pub fn slot_url(kind: ArtifactKind) -> String {
    format!("https://bucket.test/{kind}")
}

fn status_error(endpoint: &str) -> BackendError {
    BackendError::Status {
        endpoint: endpoint.to_string(),
        status: 503,
        body: "unavailable".to_string(),
    }
}

/// File source backed by a map; counts reads.
#[derive(Default)]
pub struct MemorySource {
    files: HashMap<PathBuf, Vec<u8>>,
    pub reads: AtomicUsize,
}

impl MemorySource {
    pub fn with_all_kinds() -> Self {
        let files = ArtifactKind::ALL
            .iter()
            .map(|kind| (PathBuf::from(kind.as_str()), contents(*kind)))
            .collect();
        MemorySource {
            files,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSource for MemorySource {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
    }
}

/// Declares every kind at the path `MemorySource::with_all_kinds` serves it from.
pub fn declare_all() -> DeclaredArtifacts {
    ArtifactKind::ALL
        .iter()
        .fold(DeclaredArtifacts::new(), |d, kind| d.declare(*kind, kind.as_str()))
}

pub fn start_request() -> StartSessionRequest {
    StartSessionRequest::new(
        RunArgs {
            from: Some("from-file".into()),
            to: Some("to-file".into()),
            context: Some("ci-event".into()),
            rules: Some("check-results".into()),
        },
        ProviderMetadata::GithubData(serde_json::json!({"organization": "acme", "repo": "api"})),
    )
}

pub struct FakeBackend {
    journal: Journal,
    /// Kinds to hand out slots for. `None` means every declared kind.
    pub offer: Option<Vec<ArtifactKind>>,
    pub fail_start: bool,
    pub fail_negotiation: bool,
    pub fail_finalize: bool,
    /// Number of times acknowledging a given slot fails before it succeeds.
    pub ack_failures: Mutex<HashMap<SlotId, u32>>,
    /// Statuses returned by successive `get_session` calls; the last repeats.
    pub statuses: Mutex<Vec<SessionStatus>>,
    pub start_calls: AtomicUsize,
    pub negotiated: Mutex<Vec<ArtifactKind>>,
    pub ack_attempts: Mutex<Vec<SlotId>>,
    pub acknowledged: Mutex<Vec<SlotId>>,
    pub session_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(journal: Journal) -> Self {
        FakeBackend {
            journal,
            offer: None,
            fail_start: false,
            fail_negotiation: false,
            fail_finalize: false,
            ack_failures: Mutex::new(HashMap::new()),
            statuses: Mutex::new(vec![SessionStatus::Ready]),
            start_calls: AtomicUsize::new(0),
            negotiated: Mutex::new(Vec::new()),
            ack_attempts: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
            session_calls: AtomicUsize::new(0),
        }
    }

    pub fn offering(mut self, kinds: &[ArtifactKind]) -> Self {
        self.offer = Some(kinds.to_vec());
        self
    }

    pub fn failing_acks(self, kind: ArtifactKind, times: u32) -> Self {
        self.ack_failures.lock().unwrap().insert(slot_id(kind), times);
        self
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn session_calls(&self) -> usize {
        self.session_calls.load(Ordering::SeqCst)
    }

    pub fn acknowledged(&self) -> HashSet<SlotId> {
        self.acknowledged.lock().unwrap().iter().cloned().collect()
    }

    pub fn ack_attempts(&self) -> usize {
        self.ack_attempts.lock().unwrap().len()
    }

    fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn start_session(
        &self,
        _request: &StartSessionRequest,
    ) -> Result<SessionId, BackendError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.record("start".into());
        if self.fail_start {
            return Err(status_error("/api/sessions"));
        }
        Ok(SessionId::from("session-1"))
    }

    async fn get_upload_urls(
        &self,
        _session_id: &SessionId,
        kinds: &[ArtifactKind],
    ) -> Result<Vec<UploadSlot>, BackendError> {
        self.record("negotiate".into());
        self.negotiated.lock().unwrap().extend_from_slice(kinds);
        if self.fail_negotiation {
            return Err(status_error("/api/sessions/session-1/upload-urls"));
        }
        let offered = self.offer.clone().unwrap_or_else(|| kinds.to_vec());
        Ok(offered
            .into_iter()
            .map(|kind| UploadSlot {
                id: slot_id(kind),
                kind,
                url: slot_url(kind),
            })
            .collect())
    }

    async fn mark_upload_as_complete(
        &self,
        _session_id: &SessionId,
        slot_id: &SlotId,
    ) -> Result<(), BackendError> {
        self.ack_attempts.lock().unwrap().push(slot_id.clone());
        {
            let mut failures = self.ack_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(slot_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(status_error("/api/sessions/session-1/uploads"));
                }
            }
        }
        self.record(format!("ack:{slot_id}"));
        self.acknowledged.lock().unwrap().push(slot_id.clone());
        Ok(())
    }

    async fn get_session(&self, _session_id: &SessionId) -> Result<SessionReport, BackendError> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        self.record("get_session".into());
        if self.fail_finalize {
            return Err(status_error("/api/sessions/session-1"));
        }
        let status = {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                statuses[0]
            }
        };
        let web_url = (status == SessionStatus::Ready).then(|| "/sessions/session-1".to_string());
        Ok(SessionReport {
            web_url,
            status,
            session: serde_json::json!({"type": "github_actions"}),
            files: Vec::new(),
        })
    }
}

pub struct FakeUploader {
    journal: Journal,
    pub attempts: Mutex<Vec<(String, Bytes)>>,
    pub fail_urls: HashSet<String>,
    /// Per-url delay before the transfer completes.
    pub delays: HashMap<String, Duration>,
    /// Fired when a transfer starts, to simulate the caller cancelling mid-upload.
    pub cancel_on_upload: Option<CancellationToken>,
}

impl FakeUploader {
    pub fn new(journal: Journal) -> Self {
        FakeUploader {
            journal,
            attempts: Mutex::new(Vec::new()),
            fail_urls: HashSet::new(),
            delays: HashMap::new(),
            cancel_on_upload: None,
        }
    }

    pub fn failing(mut self, kind: ArtifactKind) -> Self {
        self.fail_urls.insert(slot_url(kind));
        self
    }

    pub fn slow(mut self, kind: ArtifactKind, delay: Duration) -> Self {
        self.delays.insert(slot_url(kind), delay);
        self
    }

    pub fn attempted_urls(&self) -> HashSet<String> {
        self.attempts.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }

    pub fn content_for(&self, kind: ArtifactKind) -> Option<Bytes> {
        let url = slot_url(kind);
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .find(|(u, _)| *u == url)
            .map(|(_, bytes)| bytes.clone())
    }
}

#[async_trait]
impl SlotUploader for FakeUploader {
    async fn upload(&self, url: &str, content: Bytes) -> Result<(), UploadError> {
        self.attempts.lock().unwrap().push((url.to_string(), content));
        if let Some(cancel) = &self.cancel_on_upload {
            cancel.cancel();
        }
        if let Some(delay) = self.delays.get(url) {
            tokio::time::sleep(*delay).await;
        }
        if self.fail_urls.contains(url) {
            return Err(UploadError::Rejected {
                status: 403,
                body: "signature expired".into(),
            });
        }
        self.journal.lock().unwrap().push(format!("upload:{url}"));
        Ok(())
    }
}

pub fn fast_options() -> UploadOptions {
    UploadOptions {
        max_concurrent_uploads: 4,
        completion_retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        on_slot_failure: SlotFailurePolicy::DrainInFlight,
    }
}

pub fn coordinator(
    backend: &Arc<FakeBackend>,
    uploader: &Arc<FakeUploader>,
    source: &Arc<MemorySource>,
    options: UploadOptions,
) -> SessionCoordinator {
    SessionCoordinator::new(
        backend.clone(),
        uploader.clone(),
        ArtifactLoader::new(source.clone()),
        options,
    )
}
