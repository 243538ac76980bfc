use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::checkpoint::CheckpointFilter;
use crate::config::Config;
use crate::error::{ArchiveError, ArchiveResult};
use crate::manifest::Manifest;
use crate::progress::StatusHandle;

/// Requests that tape-resident files be staged to the disk cache before
/// the copy stage reads them. Tape→disk transfers only.
pub struct StageInRequester<'m> {
    manifest: &'m Manifest,
    backend: Arc<dyn StorageBackend>,
    config: &'m Config,
    status: StatusHandle,
}

impl<'m> StageInRequester<'m> {
    pub fn new(
        manifest: &'m Manifest,
        backend: Arc<dyn StorageBackend>,
        config: &'m Config,
        status: StatusHandle,
    ) -> Self {
        Self {
            manifest,
            backend,
            config,
            status,
        }
    }

    /// Issue staging requests in bounded batches, then poll until no file
    /// reports offline. A staging failure is fatal for the whole
    /// operation: the subsequent copy would read nothing.
    pub async fn request(&self, filter: &mut CheckpointFilter) -> ArchiveResult<()> {
        if self.manifest.d2t {
            return Ok(());
        }

        self.status.set("stage-in");
        let mut count = 0u64;
        let mut batch: Vec<String> = Vec::new();

        for fentry in self.manifest.files()? {
            let entry = fentry?;
            if !filter.admit(&entry) {
                continue;
            }
            count += 1;
            let (src, _) = self.manifest.endpoints(entry.path());
            batch.push(src);

            if batch.len() >= self.config.stage_batch_size {
                self.send_batch(&batch).await?;
                debug!(
                    "Stage-in done count={}/{}",
                    count, self.manifest.header.num_files
                );
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.send_batch(&batch).await?;
        }

        self.await_online().await?;
        info!("Finished stage-in, all files are on disk");
        Ok(())
    }

    async fn send_batch(&self, batch: &[String]) -> ArchiveResult<()> {
        self.backend
            .stage(batch)
            .await
            .map_err(|e| ArchiveError::StageIn {
                reason: e.to_string(),
            })
    }

    /// Poll every file's source status until none report offline. Large
    /// archives stage at staggered times on the backend, so the sleep
    /// backs off per file instead of counting a fixed number of attempts.
    async fn await_online(&self) -> ArchiveResult<()> {
        let floor = Duration::from_secs(self.config.stage_poll_floor_secs);
        let ceiling = Duration::from_secs(self.config.stage_poll_ceiling_secs);

        for fentry in self.manifest.files()? {
            let entry = fentry?;
            let (src, _) = self.manifest.endpoints(entry.path());
            let mut delay = floor;

            loop {
                let stat = self.backend.stat(&src).await?;
                if !stat.offline {
                    break;
                }
                info!("Sleep {:?}, file not on disk entry={}", delay, src);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(ceiling);
            }
        }
        Ok(())
    }
}
