use std::sync::Arc;
use tracing::info;

use crate::backend::StorageBackend;
use crate::error::ArchiveResult;
use crate::manifest::{Entry, Manifest};
use crate::verify::{CheckScope, Verifier};

/// Outcome of locating the resume point for a retried transfer.
#[derive(Debug, Clone)]
pub enum RetryPlan {
    /// Verification found nothing wrong; the retry is a no-op and routes
    /// through the success finalize path.
    NothingToDo,
    /// Resume from this entry, inclusive. `transfer_error` distinguishes a
    /// real data error (existence/size/checksum) from a metadata-only one.
    Resume {
        checkpoint: Entry,
        transfer_error: bool,
    },
}

/// Scans the manifest for the first record that fails verification.
///
/// Two passes: a transfer-integrity check first, and only if that is
/// clean a full-metadata check. The first failing entry of the failing
/// pass becomes the checkpoint.
pub struct CheckpointLocator<'m> {
    manifest: &'m Manifest,
    backend: Arc<dyn StorageBackend>,
}

impl<'m> CheckpointLocator<'m> {
    pub fn new(manifest: &'m Manifest, backend: Arc<dyn StorageBackend>) -> Self {
        Self { manifest, backend }
    }

    pub async fn locate(&self) -> ArchiveResult<RetryPlan> {
        let verifier = Verifier::new(self.manifest, self.backend.clone(), false);

        let (_, tx_failed) = verifier
            .verify_all(false, CheckScope::TransferOnly)
            .await?;
        if let Some(checkpoint) = tx_failed.into_iter().next() {
            info!(
                "Found transfer checkpoint entry={} dir={}",
                checkpoint.path(),
                checkpoint.is_dir()
            );
            return Ok(RetryPlan::Resume {
                checkpoint,
                transfer_error: true,
            });
        }

        let (_, meta_failed) = verifier.verify_all(false, CheckScope::Full).await?;
        if let Some(checkpoint) = meta_failed.into_iter().next() {
            info!("Found metadata checkpoint entry={}", checkpoint.path());
            return Ok(RetryPlan::Resume {
                checkpoint,
                transfer_error: false,
            });
        }

        Ok(RetryPlan::NothingToDo)
    }
}

/// Gate that skips every manifest record preceding the checkpoint (by
/// manifest order) and admits everything from the checkpoint on,
/// inclusive. One filter instance is threaded through all stages of a
/// resumed transfer so the search carries across record classes.
#[derive(Debug, Clone)]
pub struct CheckpointFilter {
    target: Option<Entry>,
    found: bool,
}

impl CheckpointFilter {
    /// No checkpoint: admit every record.
    pub fn all() -> Self {
        Self {
            target: None,
            found: true,
        }
    }

    pub fn resume_at(checkpoint: Entry) -> Self {
        Self {
            target: Some(checkpoint),
            found: false,
        }
    }

    pub fn admit(&mut self, entry: &Entry) -> bool {
        if self.found {
            return true;
        }
        match &self.target {
            Some(target) if entry.same_record(target) => {
                self.found = true;
                true
            }
            _ => false,
        }
    }

    pub fn found(&self) -> bool {
        self.found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DirEntry, FileEntry};
    use std::collections::BTreeMap;

    fn dir(path: &str) -> Entry {
        Entry::Dir(DirEntry {
            path: path.to_string(),
            uid: "0".to_string(),
            gid: "0".to_string(),
            mode: "40755".to_string(),
            attrs: BTreeMap::new(),
        })
    }

    fn file(path: &str) -> Entry {
        Entry::File(FileEntry {
            path: path.to_string(),
            size: 1,
            mtime: "0.0".to_string(),
            ctime: "0.0".to_string(),
            uid: "0".to_string(),
            gid: "0".to_string(),
            mode: "644".to_string(),
            xs_type: "adler".to_string(),
            xs: "0".to_string(),
        })
    }

    #[test]
    fn test_filter_skips_until_checkpoint_inclusive() {
        let entries = vec![dir("./"), dir("a/"), file("a/x"), file("a/y")];
        let mut filter = CheckpointFilter::resume_at(file("a/x"));

        let admitted: Vec<_> = entries
            .iter()
            .filter(|e| filter.admit(e))
            .map(|e| e.path().to_string())
            .collect();
        assert_eq!(admitted, vec!["a/x", "a/y"]);
        assert!(filter.found());
    }

    #[test]
    fn test_filter_found_state_carries_across_stages() {
        // A directory checkpoint is found during the directory stage, so
        // the file stage must process every file.
        let mut filter = CheckpointFilter::resume_at(dir("a/"));
        assert!(!filter.admit(&dir("./")));
        assert!(filter.admit(&dir("a/")));

        assert!(filter.admit(&file("a/x")));
        assert!(filter.admit(&file("a/y")));
    }

    #[test]
    fn test_filter_distinguishes_kind_on_same_path() {
        let mut filter = CheckpointFilter::resume_at(file("a/"));
        assert!(!filter.admit(&dir("a/")));
        assert!(filter.admit(&file("a/")));
    }

    #[test]
    fn test_admit_all() {
        let mut filter = CheckpointFilter::all();
        assert!(filter.admit(&dir("./")));
        assert!(filter.admit(&file("x")));
    }
}
