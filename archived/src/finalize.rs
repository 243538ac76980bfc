use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{BackendError, StorageBackend};
use crate::checkpoint::CheckpointFilter;
use crate::completion::CompletionSet;
use crate::config::Config;
use crate::error::{ArchiveError, ArchiveResult};
use crate::manifest::{Entry, FileEntry, Manifest};
use crate::progress::StatusHandle;
use crate::utils::parse_octal;

/// Post-transfer stages: metadata propagation (get), tape-residency
/// confirmation (put) and disk-cache eviction (get).
pub struct Finalizer<'m> {
    manifest: &'m Manifest,
    backend: Arc<dyn StorageBackend>,
    config: &'m Config,
    status: StatusHandle,
    backup: bool,
}

impl<'m> Finalizer<'m> {
    pub fn new(
        manifest: &'m Manifest,
        backend: Arc<dyn StorageBackend>,
        config: &'m Config,
        status: StatusHandle,
        backup: bool,
    ) -> Self {
        Self {
            manifest,
            backend,
            config,
            status,
            backup,
        }
    }

    /// Apply recorded ownership, permissions and timestamps to every
    /// admitted file at the destination. Tape→disk only. Requests fan out
    /// asynchronously; any single failure fails the whole stage.
    pub async fn update_file_access(&self, filter: &mut CheckpointFilter) -> ArchiveResult<()> {
        if self.manifest.d2t {
            return Ok(());
        }
        self.status.set("updating file access");

        let mut pending = CompletionSet::new();

        for fentry in self.manifest.files()? {
            let entry = fentry?;
            let Entry::File(f) = &entry else {
                unreachable!("files() yields file records only");
            };
            if self.backup && self.outside_time_window(f) {
                continue;
            }
            if !filter.admit(&entry) {
                continue;
            }

            let (_, dst) = self.manifest.endpoints(&f.path);
            let backend = self.backend.clone();
            let uid: u32 = f.uid.parse().unwrap_or(0);
            let gid: u32 = f.gid.parse().unwrap_or(0);
            let mode = parse_octal(&f.mode);
            let ctime = f.ctime.clone();
            let mtime = f.mtime.clone();

            pending.spawn(async move {
                backend.chown(&dst, uid, gid).await?;
                if let Some(mode) = mode {
                    backend.chmod(&dst, mode).await?;
                }
                backend.utimes(&dst, &ctime, &mtime).await?;
                Ok::<(), BackendError>(())
            });
        }

        let failures = pending.wait_all().await;
        if let Some(first) = failures.first() {
            // Backups summarize partial failure instead of aborting;
            // verification reports the affected entries afterwards.
            if self.backup {
                warn!(
                    "{} file access updates failed, first: {}",
                    failures.len(),
                    first
                );
            } else {
                return Err(ArchiveError::FileAccess {
                    reason: format!("{} ({} requests failed)", first, failures.len()),
                });
            }
        }
        info!("Finished updating file access");
        Ok(())
    }

    /// Poll until every non-empty file reports tape residency. Disk→tape
    /// only. The sleep shrinks as the confirmed fraction grows, bounded
    /// by the configured floor and ceiling.
    pub async fn wait_on_tape(&self) -> ArchiveResult<()> {
        if !self.manifest.d2t {
            return Ok(());
        }
        self.status.set("wait_on_tape");
        let floor = self.config.tape_poll_floor_secs;
        let ceiling = self.config.tape_poll_ceiling_secs.max(floor);
        let total = self.manifest.header.num_files.max(1);

        loop {
            let mut confirmed = 0u64;
            let mut all_on_tape = true;

            for fentry in self.manifest.files()? {
                let entry = fentry?;
                let (_, dst) = self.manifest.endpoints(entry.path());
                let stat = self.backend.stat(&dst).await?;

                // The tape layer never flags empty files.
                if stat.size != 0 && !stat.on_tape {
                    info!("File {} is not yet on tape", dst);
                    all_on_tape = false;
                    break;
                }
                confirmed += 1;
            }

            if all_on_tape {
                return Ok(());
            }

            let remaining = 1.0 - (confirmed as f64 / total as f64);
            let sleep_secs = ((ceiling as f64 * remaining) as u64).clamp(floor, ceiling);
            info!("Going to sleep for {} seconds", sleep_secs);
            tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
        }
    }

    /// Ask the tape backend to drop its disk-cache copies after a
    /// successful tape→disk transfer. Best-effort: eviction failure does
    /// not invalidate a verified transfer.
    pub async fn evict_disk_cache(&self) -> ArchiveResult<()> {
        if self.manifest.d2t {
            return Ok(());
        }
        self.status.set("evict_disk_cache");
        let mut batch: Vec<String> = Vec::new();

        for fentry in self.manifest.files()? {
            let entry = fentry?;
            let (src, _) = self.manifest.endpoints(entry.path());
            batch.push(src);

            if batch.len() >= self.config.evict_batch_size {
                if let Err(e) = self.backend.evict(&batch).await {
                    warn!("Failed eviction request for batch: {}", e);
                }
                batch.clear();
            }
        }

        if !batch.is_empty() {
            if let Err(e) = self.backend.evict(&batch).await {
                warn!("Failed eviction request for batch: {}", e);
            }
        }

        info!("Finished sending all eviction requests");
        Ok(())
    }

    fn outside_time_window(&self, f: &FileEntry) -> bool {
        match self.manifest.header.time_window() {
            Some((which, cutoff)) => match f.time_field_secs(which) {
                Some(secs) => secs < cutoff,
                None => false,
            },
            None => false,
        }
    }
}
