use archived_protocol::{
    manifest_root, root_path, transfer_uuid, OpKind, RequestOption, TransferRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::backend::{CopyExpectation, CopyJob, StorageBackend};
use crate::checkpoint::{CheckpointFilter, CheckpointLocator, RetryPlan};
use crate::config::Config;
use crate::copy_pool::CopyPool;
use crate::directory::DirectoryStage;
use crate::error::{ArchiveError, ArchiveResult};
use crate::finalize::Finalizer;
use crate::manifest::{Entry, Manifest};
use crate::progress::StatusHandle;
use crate::stage::StageInRequester;
use crate::status::WorkerIdentity;
use crate::verify::{CheckScope, Verifier};

/// Which side of the archive a removal targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteTarget {
    /// The transfer's destination, whatever the direction.
    Destination,
    /// The tape side, regardless of direction (delete operations).
    Tape,
    /// The disk side, regardless of direction (purge operations).
    Disk,
}

/// One transfer session, executed end-to-end by a worker process.
pub struct Transfer {
    config: Config,
    backend: Arc<dyn StorageBackend>,
    op: OpKind,
    uuid: String,
    uid: u32,
    gid: u32,
    do_retry: bool,
    force: bool,
    /// Full URL of the manifest record; prepare renames it in place, so
    /// this tracks the current name.
    manifest_url: String,
    /// Parent URL of the manifest, with trailing slash.
    manifest_root: String,
    /// Path form of the archive root, the UUID seed.
    root_dir: String,
    /// Initial put: the manifest itself is shipped to tape too.
    init_put: bool,
    tx_file: PathBuf,
    ps_file: PathBuf,
    log_file: PathBuf,
    manifest: Option<Manifest>,
    status: StatusHandle,
    timestamp: u64,
}

impl Transfer {
    pub fn new(
        req: &TransferRequest,
        config: Config,
        backend: Arc<dyn StorageBackend>,
    ) -> ArchiveResult<Self> {
        if !req.cmd.is_transfer() {
            return Err(ArchiveError::InvalidRequest {
                reason: format!("{} is not a transfer operation", req.cmd),
            });
        }

        let root = manifest_root(&req.src);
        let root_dir = root_path(&root);
        let uuid = transfer_uuid(&root_dir);
        let scratch = config.op_dir(req.cmd);
        let tx_file = scratch.join(format!("{}.tx", uuid));
        let ps_file = scratch.join(format!("{}.ps", uuid));
        let log_file = scratch.join(format!("{}.log", uuid));
        let init_put = req.src.ends_with(&config.manifest_init_name());

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            status: StatusHandle::new(Some(ps_file.clone())),
            config,
            backend,
            op: req.cmd,
            uuid,
            uid: req.uid,
            gid: req.gid,
            do_retry: req.opt == RequestOption::Retry,
            force: req.opt == RequestOption::Force,
            manifest_url: req.src.clone(),
            manifest_root: root,
            root_dir,
            init_put,
            tx_file,
            ps_file,
            log_file,
            manifest: None,
            timestamp,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn log_file(&self) -> &PathBuf {
        &self.log_file
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            uuid: self.uuid.clone(),
            pid: std::process::id(),
            uid: self.uid,
            gid: self.gid,
            root_dir: self.root_dir.clone(),
            op: self.op,
            timestamp: self.timestamp,
        }
    }

    /// Run the requested operation and always finalize: the manifest
    /// record ends up renamed to its terminal suffix and the scratch
    /// files are cleared, whatever the outcome.
    pub async fn execute(&mut self) -> ArchiveResult<()> {
        let result = self.run().await;
        self.status.set("cleaning");

        match result {
            Ok(check_ok) => {
                self.tx_clean(check_ok).await;
                if check_ok || self.op == OpKind::Backup {
                    Ok(())
                } else {
                    Err(ArchiveError::VerificationFailed {
                        path: self.manifest_url.clone(),
                    })
                }
            }
            Err(ArchiveError::NothingToDo) => {
                info!("Retry requested but verification found nothing wrong");
                self.tx_clean(true).await;
                Err(ArchiveError::NothingToDo)
            }
            Err(e) => {
                error!("Transfer failed: {}", e);
                self.tx_clean(false).await;
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> ArchiveResult<bool> {
        let t0 = std::time::Instant::now();
        let check_ok = match self.op {
            OpKind::Put | OpKind::Get => {
                self.archive_prepare().await?;
                if self.do_retry {
                    self.do_retry_transfer().await?
                } else {
                    self.do_transfer().await?
                }
            }
            OpKind::Purge => {
                self.archive_prepare().await?;
                self.do_delete(false).await?
            }
            OpKind::Delete => {
                self.archive_prepare().await?;
                self.do_delete(true).await?
            }
            OpKind::Backup => {
                self.backup_prepare().await?;
                self.do_backup().await?
            }
            other => {
                return Err(ArchiveError::InvalidRequest {
                    reason: format!("{} is not a transfer operation", other),
                })
            }
        };
        info!("TIMING_transfer={:.3} sec", t0.elapsed().as_secs_f64());
        Ok(check_ok)
    }

    /// Rename the manifest record to its in-progress `.err` twin, pull a
    /// local copy and open the session over it. The record keeps the
    /// `.err` name until a successful finalize renames it to `.done`.
    async fn archive_prepare(&mut self) -> ArchiveResult<()> {
        self.status.set("preparing");
        let renamed = format!(
            "{}{}.{}.err",
            self.manifest_root, self.config.manifest_name, self.op
        );
        self.backend.rename(&self.manifest_url, &renamed).await?;
        self.manifest_url = renamed;

        self.backend.fetch(&self.manifest_url, &self.tx_file).await?;

        let d2t = self.op == OpKind::Put;
        self.manifest = Some(Manifest::open(&self.tx_file, d2t)?);
        Ok(())
    }

    /// Pull a local copy of the backup record and check the destination
    /// root, unless forced. Backups flow like tape→disk transfers.
    async fn backup_prepare(&mut self) -> ArchiveResult<()> {
        self.status.set("preparing");
        self.backend.fetch(&self.manifest_url, &self.tx_file).await?;
        let manifest = Manifest::open(&self.tx_file, false)?;

        if !self.force {
            let (_, dst_root) = manifest.endpoints("./");
            if !self.backend.exists(&dst_root).await? {
                return Err(ArchiveError::RootPrecondition {
                    reason: format!("backup destination {} does not exist", dst_root),
                });
            }
        }

        self.manifest = Some(manifest);
        Ok(())
    }

    async fn do_transfer(&self) -> ArchiveResult<bool> {
        let manifest = self.manifest()?;

        DirectoryStage::new(manifest, self.backend.clone(), self.status.clone())
            .create_all(&mut CheckpointFilter::all(), true)
            .await?;

        StageInRequester::new(manifest, self.backend.clone(), &self.config, self.status.clone())
            .request(&mut CheckpointFilter::all())
            .await?;

        self.copy_files(&mut CheckpointFilter::all()).await?;

        let finalizer = Finalizer::new(
            manifest,
            self.backend.clone(),
            &self.config,
            self.status.clone(),
            false,
        );
        finalizer
            .update_file_access(&mut CheckpointFilter::all())
            .await?;

        self.status.set("verifying");
        let (check_ok, _) = Verifier::new(manifest, self.backend.clone(), false)
            .verify_all(false, CheckScope::Full)
            .await?;

        if manifest.d2t {
            finalizer.wait_on_tape().await?;
        } else {
            finalizer.evict_disk_cache().await?;
        }
        Ok(check_ok)
    }

    /// Resume a partially completed transfer from its checkpoint: the
    /// first entry that fails verification. Everything before it is
    /// already correct and is skipped by manifest order.
    async fn do_retry_transfer(&self) -> ArchiveResult<bool> {
        let manifest = self.manifest()?;

        self.status.set("verify last run");
        let plan = CheckpointLocator::new(manifest, self.backend.clone())
            .locate()
            .await?;
        let (checkpoint, transfer_error) = match plan {
            RetryPlan::NothingToDo => return Err(ArchiveError::NothingToDo),
            RetryPlan::Resume {
                checkpoint,
                transfer_error,
            } => (checkpoint, transfer_error),
        };

        if transfer_error {
            // A corrupted directory invalidates everything beneath it.
            info!("Delete corrupted entry={}", checkpoint.path());
            if checkpoint.is_dir() {
                self.remove_subtree(checkpoint.path(), DeleteTarget::Destination)
                    .await?;
            } else {
                self.remove_entry(checkpoint.path(), false, DeleteTarget::Destination)
                    .await?;
            }
        }

        // The directory pass establishes whether the checkpoint was a
        // directory; each file pass then re-runs the search from that
        // result rather than from the previous pass's consumed state.
        let mut filter = CheckpointFilter::resume_at(checkpoint);

        DirectoryStage::new(manifest, self.backend.clone(), self.status.clone())
            .create_all(&mut filter, false)
            .await?;

        let finalizer = Finalizer::new(
            manifest,
            self.backend.clone(),
            &self.config,
            self.status.clone(),
            false,
        );

        if transfer_error {
            StageInRequester::new(manifest, self.backend.clone(), &self.config, self.status.clone())
                .request(&mut filter.clone())
                .await?;
            self.copy_files(&mut filter.clone()).await?;
            finalizer.update_file_access(&mut filter.clone()).await?;
        } else {
            // Metadata-only corruption: reapply access metadata across
            // the whole file section, nothing needs recopying.
            finalizer
                .update_file_access(&mut CheckpointFilter::all())
                .await?;
        }

        self.status.set("verifying");
        let (check_ok, _) = Verifier::new(manifest, self.backend.clone(), false)
            .verify_all(false, CheckScope::Full)
            .await?;

        if manifest.d2t {
            finalizer.wait_on_tape().await?;
        } else {
            finalizer.evict_disk_cache().await?;
        }
        Ok(check_ok)
    }

    /// Remove the archived tree from one tier: files first, then
    /// directories deepest-first. `tape_delete` removes tape copies
    /// permanently; purge prunes the disk copies and keeps the root.
    async fn do_delete(&self, tape_delete: bool) -> ArchiveResult<bool> {
        let manifest = self.manifest()?;
        info!("Do delete with tape_delete={}", tape_delete);
        self.status.set("deleting");

        let target = if tape_delete {
            DeleteTarget::Tape
        } else {
            DeleteTarget::Disk
        };

        if tape_delete {
            // The manifest copy shipped at initial put lives on tape too.
            self.remove_entry(&self.config.manifest_init_name(), false, target)
                .await?;
        }

        for fentry in manifest.files()? {
            let entry = fentry?;
            self.remove_entry(entry.path(), false, target).await?;
        }

        let mut del_dirs = Vec::new();
        for dentry in manifest.dirs()? {
            let entry = dentry?;
            if !tape_delete && entry.path() == "./" {
                continue;
            }
            del_dirs.push(entry.path().to_string());
        }
        while let Some(path) = del_dirs.pop() {
            self.remove_entry(&path, true, target).await?;
        }

        Ok(true)
    }

    async fn do_backup(&self) -> ArchiveResult<bool> {
        let manifest = self.manifest()?;

        DirectoryStage::new(manifest, self.backend.clone(), self.status.clone())
            .create_all(&mut CheckpointFilter::all(), false)
            .await?;

        self.copy_files(&mut CheckpointFilter::all()).await?;

        Finalizer::new(
            manifest,
            self.backend.clone(),
            &self.config,
            self.status.clone(),
            true,
        )
        .update_file_access(&mut CheckpointFilter::all())
        .await?;

        self.status.set("verifying");
        let (check_ok, failed) = Verifier::new(manifest, self.backend.clone(), true)
            .verify_all(true, CheckScope::Full)
            .await?;
        self.backup_write_status(&failed, check_ok).await;

        Ok(check_ok)
    }

    /// Queue every admitted file into the bounded copy pool, with the
    /// direction-specific annotations, and flush it to completion.
    async fn copy_files(&self, filter: &mut CheckpointFilter) -> ArchiveResult<()> {
        let manifest = self.manifest()?;
        let backup = self.op == OpKind::Backup;
        let mut pool = CopyPool::new(self.backend.clone(), &self.config, backup);
        let mut indx = 0u64;

        if self.init_put {
            // The record already carries its in-progress .err name; ship
            // it under the init name so the tape side holds the manifest.
            let stat = self.backend.stat(&self.manifest_url).await?;
            let (_, dst) = manifest.endpoints(&self.config.manifest_init_name());
            let ok = pool
                .submit(CopyJob::new(self.manifest_url.clone(), dst, stat.size))
                .await;
            if !ok {
                error!("Failed to flush files");
                return Err(ArchiveError::CopyFlush);
            }
        }

        for fentry in manifest.files()? {
            let entry = fentry?;
            let Entry::File(f) = &entry else {
                unreachable!("files() yields file records only");
            };

            // Incremental backups only move entries inside the window.
            if backup {
                if let Some((which, cutoff)) = manifest.header.time_window() {
                    if f.time_field_secs(which).map(|s| s < cutoff).unwrap_or(false) {
                        continue;
                    }
                }
            }
            if !filter.admit(&entry) {
                indx += 1;
                continue;
            }

            indx += 1;
            self.status
                .set(format!("copy file {}/{}", indx, manifest.header.num_files));

            let (src, dst) = manifest.endpoints(&f.path);
            debug!("Copying from {} to {}", src, dst);

            let mut job = CopyJob::new(src, dst, f.size);
            if manifest.d2t {
                // The tape copy must be created with exactly the booked
                // size, ownership and checksum the manifest expects.
                job = job.with_expectation(CopyExpectation {
                    size: f.size,
                    uid: f.uid.parse().unwrap_or(0),
                    gid: f.gid.parse().unwrap_or(0),
                    mtime: f.mtime.clone(),
                    ctime: f.ctime.clone(),
                    checksum_type: f.xs_type.clone(),
                    checksum: f.xs.clone(),
                });
            }

            let ok = pool.submit(job).await;
            if !ok && !backup {
                error!("Failed to flush files");
                return Err(ArchiveError::CopyFlush);
            }
        }

        let ok = pool.flush(true).await;
        if !ok && !backup {
            error!("Failed to flush files");
            return Err(ArchiveError::CopyFlush);
        }
        Ok(())
    }

    fn target_url(&self, manifest: &Manifest, rel_path: &str, target: DeleteTarget) -> String {
        let (src, dst) = manifest.endpoints(rel_path);
        match target {
            DeleteTarget::Destination => dst,
            DeleteTarget::Tape => {
                if manifest.d2t {
                    dst
                } else {
                    src
                }
            }
            DeleteTarget::Disk => {
                if manifest.d2t {
                    src
                } else {
                    dst
                }
            }
        }
    }

    /// Remove one entry, tolerating entries that are already gone.
    async fn remove_entry(
        &self,
        rel_path: &str,
        is_dir: bool,
        target: DeleteTarget,
    ) -> ArchiveResult<()> {
        let manifest = self.manifest()?;
        let url = self.target_url(manifest, rel_path, target);
        debug!("Delete entry={}", url);

        let result = if is_dir {
            self.backend.remove_dir(&url).await
        } else {
            self.backend.remove_file(&url).await
        };

        if let Err(e) = result {
            if self.backend.exists(&url).await? {
                error!("Error removing entry={}", url);
                return Err(e.into());
            }
            warn!("Entry={} already removed", url);
        }
        Ok(())
    }

    /// Remove the subtree rooted at `rel_path`: every file under it, then
    /// its directories deepest-first.
    async fn remove_subtree(&self, rel_path: &str, target: DeleteTarget) -> ArchiveResult<()> {
        let manifest = self.manifest()?;
        debug!("Del subtree for path={}", rel_path);

        for fentry in manifest.files()? {
            let entry = fentry?;
            if entry.path().starts_with(rel_path) {
                self.remove_entry(entry.path(), false, target).await?;
            }
        }

        let mut subdirs = Vec::new();
        for dentry in manifest.dirs()? {
            let entry = dentry?;
            if entry.path().starts_with(rel_path) {
                subdirs.push(entry.path().to_string());
            }
        }
        while let Some(path) = subdirs.pop() {
            self.remove_entry(&path, true, target).await?;
        }
        Ok(())
    }

    async fn tx_clean(&self, check_ok: bool) {
        let result = if self.op == OpKind::Backup {
            self.backup_tx_clean().await
        } else {
            self.archive_tx_clean(check_ok).await
        };
        if let Err(e) = result {
            error!("Cleanup failed: {}", e);
        }
    }

    /// Rename the manifest record to its terminal suffix (`.done` on full
    /// success, `.err` otherwise), ship the worker log next to it owned
    /// by the requesting identity, and clear the local scratch files.
    /// Every step past the rename is best-effort.
    async fn archive_tx_clean(&self, check_ok: bool) -> ArchiveResult<()> {
        if self.manifest.is_some() {
            let suffix = if check_ok { "done" } else { "err" };
            let terminal = format!(
                "{}{}.{}.{}",
                self.manifest_root, self.config.manifest_name, self.op, suffix
            );

            if terminal != self.manifest_url {
                if let Err(e) = self.backend.rename(&self.manifest_url, &terminal).await {
                    error!(
                        "Failed to rename {} to {}: {}",
                        self.manifest_url, terminal, e
                    );
                }
            }

            // A fully deleted archive leaves no record behind.
            if self.op == OpKind::Delete && check_ok {
                if let Err(e) = self.backend.remove_file(&terminal).await {
                    if !e.is_not_found() {
                        warn!("Failed to delete archive record {}: {}", terminal, e);
                    }
                }
            }
        }

        let log_url = format!("{}{}.log", self.manifest_root, self.config.manifest_name);
        self.ship_log(&log_url).await;
        self.remove_scratch();
        Ok(())
    }

    /// Backups keep their record in place; only the log is shipped and
    /// the scratch files cleared.
    async fn backup_tx_clean(&self) -> ArchiveResult<()> {
        let log_url = format!("{}.backup.log", self.manifest_root);
        self.ship_log(&log_url).await;
        self.remove_scratch();
        Ok(())
    }

    /// Write the backup summary next to the record: `.backup.done`, or
    /// `.backup.err.<N>` enumerating the entries that failed.
    async fn backup_write_status(&self, failed: &[Entry], check_ok: bool) {
        let url = if check_ok {
            info!("Backup successful - no errors detected");
            format!("{}.backup.done", self.manifest_root)
        } else {
            error!("Failed verification for {} entries", failed.len());
            format!("{}.backup.err.{}", self.manifest_root, failed.len())
        };

        let mut body = String::new();
        for entry in failed {
            body.push_str(&format!("Failed entry={}\n", entry.path()));
        }
        if let Err(e) = self.backend.write_file(&url, body.as_bytes()).await {
            error!("Failed to write backup status {}: {}", url, e);
        }
    }

    async fn ship_log(&self, log_url: &str) {
        debug!("Copy log {:?} to {}", self.log_file, log_url);
        match self.backend.publish(&self.log_file, log_url).await {
            Err(e) => error!("Failed to copy log file to {}: {}", log_url, e),
            Ok(()) => {
                // The requester owns the transfer log.
                if let Err(e) = self.backend.chown(log_url, self.uid, self.gid).await {
                    error!("Failed setting ownership of the log file {}: {}", log_url, e);
                }
            }
        }
    }

    fn remove_scratch(&self) {
        for path in [&self.tx_file, &self.log_file, &self.ps_file] {
            let _ = std::fs::remove_file(path);
        }
    }

    fn manifest(&self) -> ArchiveResult<&Manifest> {
        self.manifest.as_ref().ok_or(ArchiveError::InvalidRequest {
            reason: "transfer session is not prepared".to_string(),
        })
    }
}
