use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use crate::error::ArchiveError;

/// Failure of a single remote operation.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("{op}: entry not found: {path}")]
    NotFound { op: &'static str, path: String },

    #[error("{op} failed for {path}: {message}")]
    Failed {
        op: &'static str,
        path: String,
        message: String,
    },
}

impl BackendError {
    pub fn failed(op: &'static str, path: impl Into<String>, message: impl ToString) -> Self {
        BackendError::Failed {
            op,
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }

    pub fn op(&self) -> &'static str {
        match self {
            BackendError::NotFound { op, .. } => op,
            BackendError::Failed { op, .. } => op,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            BackendError::NotFound { path, .. } => path,
            BackendError::Failed { path, .. } => path,
        }
    }
}

impl From<BackendError> for ArchiveError {
    fn from(e: BackendError) -> Self {
        ArchiveError::Backend {
            op: e.op(),
            path: e.path().to_string(),
            message: e.to_string(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Metadata of one remote entry as the backend reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryStat {
    pub is_dir: bool,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    /// Full `st_mode` bits (type + permissions).
    pub mode: u32,
    /// Seconds.nanoseconds since the epoch.
    pub mtime: String,
    pub ctime: String,
    /// Entry lives on tape only; a stage-in is required before reading.
    pub offline: bool,
    /// Tape residency confirmed by the backend.
    pub on_tape: bool,
}

/// Constraints a copy destination must satisfy, taken from the manifest.
#[derive(Debug, Clone)]
pub struct CopyExpectation {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mtime: String,
    pub ctime: String,
    pub checksum_type: String,
    /// Expected checksum value; `"0"` means none is enforced.
    pub checksum: String,
}

/// One pending copy from `src` to `dst`.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub src: String,
    pub dst: String,
    pub size: u64,
    /// Third-party (endpoint-to-endpoint) copy. Zero-byte payloads are
    /// copied plainly instead, proxying gains nothing for them.
    pub proxied: bool,
    pub expect: Option<CopyExpectation>,
}

impl CopyJob {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, size: u64) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            size,
            proxied: size != 0,
            expect: None,
        }
    }

    pub fn with_expectation(mut self, expect: CopyExpectation) -> Self {
        self.expect = Some(expect);
        self
    }
}

/// Capability-shaped view of the storage tiers.
///
/// The engine is an orchestrator above this trait; any backend exposing
/// these operations (local filesystem, remote protocol client) is
/// sufficient. URLs are opaque to the engine, only `Manifest::endpoints`
/// constructs them.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn stat(&self, url: &str) -> BackendResult<EntryStat>;

    async fn exists(&self, url: &str) -> BackendResult<bool> {
        match self.stat(url).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn mkdir(&self, url: &str, recursive: bool) -> BackendResult<()>;

    async fn rename(&self, src_url: &str, dst_url: &str) -> BackendResult<()>;

    async fn remove_file(&self, url: &str) -> BackendResult<()>;

    /// Remove an empty directory.
    async fn remove_dir(&self, url: &str) -> BackendResult<()>;

    /// Directory listing with per-entry stat.
    async fn list(&self, url: &str) -> BackendResult<Vec<(String, EntryStat)>>;

    /// Execute a batch of copies; fails if any job in the batch fails.
    async fn copy_batch(&self, jobs: &[CopyJob]) -> BackendResult<()>;

    /// Query the checksum of a file. `kind` is the manifest's checksum
    /// type name (e.g. `adler`, `md5`, `sha256`).
    async fn checksum(&self, url: &str, kind: &str) -> BackendResult<String>;

    async fn chown(&self, url: &str, uid: u32, gid: u32) -> BackendResult<()>;

    async fn chmod(&self, url: &str, mode: u32) -> BackendResult<()>;

    /// Apply recorded creation/modification timestamps (`sec.nsec`).
    async fn utimes(&self, url: &str, ctime: &str, mtime: &str) -> BackendResult<()>;

    async fn get_xattrs(&self, url: &str) -> BackendResult<BTreeMap<String, String>>;

    async fn set_xattr(&self, url: &str, key: &str, value: &str) -> BackendResult<()>;

    async fn remove_xattr(&self, url: &str, key: &str) -> BackendResult<()>;

    /// Request that tape-resident entries be staged to the disk cache.
    async fn stage(&self, urls: &[String]) -> BackendResult<()>;

    /// Request eviction of entries from the disk cache.
    async fn evict(&self, urls: &[String]) -> BackendResult<()>;

    /// Copy a remote file to a local scratch path.
    async fn fetch(&self, url: &str, local: &Path) -> BackendResult<()>;

    /// Copy a local scratch file to a remote path.
    async fn publish(&self, local: &Path, url: &str) -> BackendResult<()>;

    /// Create or replace a small remote file with the given content.
    async fn write_file(&self, url: &str, data: &[u8]) -> BackendResult<()>;
}
