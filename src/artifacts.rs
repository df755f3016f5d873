// Artifact kinds and local loading.
//
// Loading always happens before the backend is contacted: every declared
// kind is read into memory up front, whether or not the backend ends up
// asking for it. File access sits behind `FileSource` so tests can swap in
// an in-memory source and count reads.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RunError;

/// Category of file content a run may offer to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    #[serde(rename = "check-results", alias = "CheckResults")]
    CheckResults,
    #[serde(rename = "from-file", alias = "FromFile")]
    FromFile,
    #[serde(rename = "to-file", alias = "ToFile")]
    ToFile,
    #[serde(rename = "ci-event", alias = "GithubActionsEvent", alias = "GitlabCiEvent")]
    CiEvent,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        ArtifactKind::CheckResults,
        ArtifactKind::FromFile,
        ArtifactKind::ToFile,
        ArtifactKind::CiEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::CheckResults => "check-results",
            ArtifactKind::FromFile => "from-file",
            ArtifactKind::ToFile => "to-file",
            ArtifactKind::CiEvent => "ci-event",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown artifact kind '{s}'"))
    }
}

/// The local files a run offers, one path per kind.
#[derive(Debug, Clone, Default)]
pub struct DeclaredArtifacts {
    paths: BTreeMap<ArtifactKind, PathBuf>,
}

impl DeclaredArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `path` for `kind`, replacing any earlier declaration.
    pub fn declare(mut self, kind: ArtifactKind, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(kind, path.into());
        self
    }

    pub fn kinds(&self) -> Vec<ArtifactKind> {
        self.paths.keys().copied().collect()
    }

    pub fn path(&self, kind: ArtifactKind) -> Option<&Path> {
        self.paths.get(&kind).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &Path)> {
        self.paths.iter().map(|(kind, path)| (*kind, path.as_path()))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Loaded artifact content, read-only once built.
#[derive(Debug, Clone, Default)]
pub struct ArtifactBuffers {
    buffers: BTreeMap<ArtifactKind, Bytes>,
}

impl ArtifactBuffers {
    /// Cheap clone of the buffer for `kind`, if it was loaded.
    pub fn get(&self, kind: ArtifactKind) -> Option<Bytes> {
        self.buffers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ArtifactKind) -> bool {
        self.buffers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Where artifact bytes come from.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;
}

/// Reads artifacts from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSource;

#[async_trait]
impl FileSource for FsSource {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }
}

#[derive(Clone)]
pub struct ArtifactLoader {
    source: Arc<dyn FileSource>,
}

impl ArtifactLoader {
    pub fn new(source: Arc<dyn FileSource>) -> Self {
        Self { source }
    }

    pub fn from_fs() -> Self {
        Self::new(Arc::new(FsSource))
    }

    /// Load every declared artifact. Fails on the first unreadable path.
    pub async fn load_all(
        &self,
        declared: &DeclaredArtifacts,
    ) -> Result<ArtifactBuffers, RunError> {
        let reads = declared.iter().map(|(kind, path)| async move {
            let bytes = self.source.read(path).await.map_err(|source| RunError::Load {
                kind,
                path: path.to_path_buf(),
                source,
            })?;
            debug!(%kind, path = %path.display(), len = bytes.len(), "loaded artifact");
            Ok::<_, RunError>((kind, Bytes::from(bytes)))
        });

        let buffers = try_join_all(reads).await?.into_iter().collect();
        Ok(ArtifactBuffers { buffers })
    }
}

impl Default for ArtifactLoader {
    fn default() -> Self {
        Self::from_fs()
    }
}
