use std::sync::Arc;
use tracing::{debug, error, info};

use crate::backend::StorageBackend;
use crate::checkpoint::CheckpointFilter;
use crate::error::{ArchiveError, ArchiveResult};
use crate::manifest::{DirEntry, Entry, Manifest};
use crate::progress::StatusHandle;
use crate::utils::parse_octal;

/// Materializes every directory of the manifest, in manifest order,
/// before any file copy is allowed to start.
pub struct DirectoryStage<'m> {
    manifest: &'m Manifest,
    backend: Arc<dyn StorageBackend>,
    status: StatusHandle,
}

impl<'m> DirectoryStage<'m> {
    pub fn new(
        manifest: &'m Manifest,
        backend: Arc<dyn StorageBackend>,
        status: StatusHandle,
    ) -> Self {
        Self {
            manifest,
            backend,
            status,
        }
    }

    /// Create all admitted directories. `check_root` applies the root
    /// precondition on the way through; retries and backups skip it.
    pub async fn create_all(
        &self,
        filter: &mut CheckpointFilter,
        check_root: bool,
    ) -> ArchiveResult<()> {
        let mut indx = 0u64;

        for dentry in self.manifest.dirs()? {
            let entry = dentry?;
            if !filter.admit(&entry) {
                indx += 1;
                continue;
            }
            let Entry::Dir(d) = &entry else {
                unreachable!("dirs() yields directory records only");
            };

            if check_root && d.path == "./" {
                self.check_root_dir().await?;
            }

            indx += 1;
            self.create(d).await?;
            self.status
                .set(format!("create dir {}/{}", indx, self.manifest.header.num_dirs));
        }
        Ok(())
    }

    /// Idempotently ensure the destination directory exists and, for the
    /// tape→disk direction, apply the recorded ownership, mode and the
    /// complete extended-attribute set (existing attributes are cleared
    /// first, header-excluded keys are not written back).
    pub async fn create(&self, d: &DirEntry) -> ArchiveResult<()> {
        let (_, dst) = self.manifest.endpoints(&d.path);

        if !self.backend.exists(&dst).await? {
            debug!("mkdir {}", dst);
            self.backend.mkdir(&dst, false).await?;
        }

        if !self.manifest.d2t {
            self.apply_metadata(d, &dst).await?;
        }
        Ok(())
    }

    async fn apply_metadata(&self, d: &DirEntry, dst: &str) -> ArchiveResult<()> {
        let uid = d.uid.parse().map_err(|_| ArchiveError::Format {
            line: 0,
            reason: format!("invalid uid {:?} for {}", d.uid, d.path),
        })?;
        let gid = d.gid.parse().map_err(|_| ArchiveError::Format {
            line: 0,
            reason: format!("invalid gid {:?} for {}", d.gid, d.path),
        })?;
        self.backend.chown(dst, uid, gid).await?;

        if let Some(mode) = parse_octal(&d.mode) {
            self.backend.chmod(dst, mode).await?;
        }

        let excluded = &self.manifest.header.excl_xattr;
        if excluded.iter().any(|k| k == "*") {
            return Ok(());
        }

        // Replace the whole attribute set: drop everything present, then
        // write the recorded attributes minus the excluded keys.
        let existing = self.backend.get_xattrs(dst).await?;
        for key in existing.keys() {
            self.backend.remove_xattr(dst, key).await?;
        }
        for (key, val) in &d.attrs {
            if excluded.iter().any(|k| k == key) {
                continue;
            }
            self.backend.set_xattr(dst, key, val).await?;
        }
        Ok(())
    }

    /// Precondition on the destination root before a fresh transfer.
    ///
    /// Disk→tape: the tape root must not exist yet (a prior archive would
    /// be silently overwritten otherwise), while its parents are created.
    /// Tape→disk: the disk root must exist and be nearly empty, holding
    /// at most the manifest file and, transiently, its error-renamed
    /// twin. Violations are fatal and not retryable.
    async fn check_root_dir(&self) -> ArchiveResult<()> {
        let (_, root) = self.manifest.endpoints("./");

        if self.manifest.d2t {
            if self.backend.exists(&root).await? {
                let reason = format!("destination root {} already exists", root);
                error!("{}", reason);
                return Err(ArchiveError::RootPrecondition { reason });
            }
            // Some tape backends cannot mkdir -p at copy time, so the
            // ancestors are materialized here; the root itself is created
            // by the normal "./" record handling.
            let trimmed = root.trim_end_matches('/');
            if let Some(pos) = trimmed.rfind('/') {
                let parent = &trimmed[..pos];
                if !parent.is_empty() {
                    self.backend.mkdir(parent, true).await?;
                }
            }
        } else {
            if !self.backend.exists(&root).await? {
                let reason = format!("destination root {} does not exist", root);
                error!("{}", reason);
                return Err(ArchiveError::RootPrecondition { reason });
            }
            let listing = self.backend.list(&root).await?;
            let num_files = listing.iter().filter(|(_, st)| !st.is_dir).count();
            let num_dirs = listing.iter().filter(|(_, st)| st.is_dir).count();

            if num_files > 2 || num_dirs != 0 {
                let reason = format!(
                    "destination root {} must contain only the manifest file \
                     ({} files, {} directories found) - clean up and try again",
                    root, num_files, num_dirs
                );
                error!("{}", reason);
                return Err(ArchiveError::RootPrecondition { reason });
            }
        }

        info!("Root precondition ok for {}", root);
        Ok(())
    }
}
