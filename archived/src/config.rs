use anyhow::Result;
use archived_protocol::OpKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Immutable daemon/worker configuration, constructed once at process start
/// and passed by reference into every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unix socket the dispatcher accepts requests on.
    pub frontend_socket: PathBuf,
    /// Directory holding per-worker status sockets.
    pub run_dir: PathBuf,
    /// Root of the local scratch area; one subdirectory per operation kind.
    pub local_dir: PathBuf,
    /// Executable spawned for each accepted transfer.
    pub worker_exec: PathBuf,

    /// Maximum transfers running at once; requests beyond it are queued.
    pub max_transfers: usize,
    /// Maximum queued transfers; requests beyond it are rejected.
    pub max_pending: usize,

    /// Copy jobs accumulated before a batch is handed to a worker task.
    pub batch_size: usize,
    /// Bound on concurrently running copy-batch tasks.
    pub max_threads: usize,
    /// In-place retries granted to a failed copy batch.
    pub max_retries: u32,
    /// Poll interval when reaping copy-batch tasks, milliseconds.
    pub join_timeout_ms: u64,

    /// Files per stage-in (prepare) request.
    pub stage_batch_size: usize,
    /// Stage-in readiness polling backoff bounds, seconds.
    pub stage_poll_floor_secs: u64,
    pub stage_poll_ceiling_secs: u64,

    /// Tape-residency polling sleep bounds, seconds.
    pub tape_poll_floor_secs: u64,
    pub tape_poll_ceiling_secs: u64,

    /// Files per disk-cache eviction request.
    pub evict_batch_size: usize,

    /// Dispatcher accept/tick interval, milliseconds.
    pub poll_timeout_ms: u64,
    /// Orphan discovery: per-socket reply timeout and retry bound.
    pub orphan_timeout_ms: u64,
    pub orphan_retries: u32,

    /// Basename of the manifest file; terminal renames append
    /// `.<op>.done` / `.<op>.err` to it.
    pub manifest_name: String,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frontend_socket: PathBuf::from("/run/archived/archived.sock"),
            run_dir: PathBuf::from("/run/archived"),
            local_dir: PathBuf::from("/var/lib/archived"),
            worker_exec: PathBuf::from("/usr/bin/archive-worker"),
            max_transfers: 10,
            max_pending: 50,
            batch_size: 10,
            max_threads: num_cpus::get(),
            max_retries: 2,
            join_timeout_ms: 100,
            stage_batch_size: 50,
            stage_poll_floor_secs: 1,
            stage_poll_ceiling_secs: 30,
            tape_poll_floor_secs: 5,
            tape_poll_ceiling_secs: 60,
            evict_batch_size: 100,
            poll_timeout_ms: 1000,
            orphan_timeout_ms: 1000,
            orphan_retries: 10,
            manifest_name: ".archive".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub async fn load() -> Result<Self> {
        let config_path = std::env::var("ARCHIVED_CONFIG_PATH")
            .unwrap_or_else(|_| "/etc/archived/config.toml".to_string());

        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => {
                let config: Config = toml::from_str(&content)?;
                Ok(config)
            }
            Err(_) => {
                warn!(
                    "Configuration file not found at {}. Using default settings.",
                    config_path
                );
                Ok(Config::default())
            }
        }
    }

    /// Scratch directory for one operation kind.
    pub fn op_dir(&self, op: OpKind) -> PathBuf {
        self.local_dir.join(op.as_str())
    }

    /// Per-worker status socket path.
    pub fn status_socket(&self, uuid: &str) -> PathBuf {
        self.run_dir.join(format!("worker-{}.sock", uuid))
    }

    pub async fn ensure_directories(&self) -> Result<()> {
        if let Some(parent) = self.frontend_socket.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(&self.run_dir).await?;

        for op in [
            OpKind::Put,
            OpKind::Get,
            OpKind::Purge,
            OpKind::Delete,
            OpKind::Backup,
        ] {
            tokio::fs::create_dir_all(self.op_dir(op)).await?;
        }
        Ok(())
    }

    /// Name of the manifest file submitted for an initial put; the manifest
    /// itself is shipped to tape when the request ends with this.
    pub fn manifest_init_name(&self) -> String {
        format!("{}.init", self.manifest_name)
    }
}
