use anyhow::{Context, Result};
use archived_protocol::{recv_json, send_json, OpKind, StatusReply, StatusRequest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::progress::StatusHandle;

/// Identity a worker announces on its status channel.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub uuid: String,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub root_dir: String,
    pub op: OpKind,
    pub timestamp: u64,
}

impl WorkerIdentity {
    fn reply(&self, status: &StatusHandle) -> StatusReply {
        StatusReply {
            uuid: self.uuid.clone(),
            pid: self.pid,
            uid: self.uid,
            gid: self.gid,
            root_dir: self.root_dir.clone(),
            op: self.op,
            status: status.get(),
            timestamp: self.timestamp,
        }
    }
}

/// Worker-side status channel: a per-worker Unix socket, named by the
/// transfer UUID, answering `status` polls and `orphan_status` discovery
/// requests from whichever dispatcher is currently running.
pub struct StatusServer {
    socket_path: PathBuf,
    handle: JoinHandle<()>,
}

impl StatusServer {
    pub fn spawn(
        socket_path: PathBuf,
        identity: WorkerIdentity,
        status: StatusHandle,
    ) -> Result<Self> {
        // A leftover socket from a crashed run with the same UUID is stale.
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind status socket {:?}", socket_path))?;
        info!("Status channel listening on {:?}", socket_path);

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if let Err(e) = handle_request(stream, &identity, &status).await {
                            debug!("Status request failed: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("Status channel accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            socket_path,
            handle,
        })
    }

    pub fn shutdown(self) {
        self.handle.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_request(
    stream: UnixStream,
    identity: &WorkerIdentity,
    status: &StatusHandle,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let request: StatusRequest = recv_json(&mut reader).await?;
    if matches!(request, StatusRequest::OrphanStatus) {
        info!("Reconnect to master ...");
    }
    send_json(&mut write, &identity.reply(status)).await
}

/// Dispatcher-side poll of one worker's status channel.
pub async fn query_worker(
    socket_path: &Path,
    request: StatusRequest,
    timeout: Duration,
) -> Result<StatusReply> {
    tokio::time::timeout(timeout, async {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to {:?}", socket_path))?;
        let (read, mut write) = stream.into_split();
        send_json(&mut write, &request).await?;
        let mut reader = BufReader::new(read);
        recv_json(&mut reader).await
    })
    .await
    .unwrap_or_else(|_| Err(anyhow::anyhow!("status query timed out")))
}

/// Broadcast-and-collect rendezvous run at dispatcher startup: query every
/// worker socket in `run_dir` for self-identification, with a bounded
/// number of retries, and clear sockets that never answer so a restart
/// neither loses track of nor double-starts an in-progress transfer.
pub async fn discover_orphans(
    run_dir: &Path,
    retries: u32,
    timeout: Duration,
) -> Vec<StatusReply> {
    let mut found: HashMap<String, StatusReply> = HashMap::new();

    for attempt in 0..retries.max(1) {
        let sockets = worker_sockets(run_dir);
        if sockets.is_empty() {
            break;
        }

        for sock in &sockets {
            if found.contains_key(&socket_uuid(sock)) {
                continue;
            }
            match query_worker(sock, StatusRequest::OrphanStatus, timeout).await {
                Ok(reply) => {
                    info!("Received orphan response uuid={}", reply.uuid);
                    found.insert(reply.uuid.clone(), reply);
                }
                Err(e) => {
                    debug!("No orphan response from {:?}: {}", sock, e);
                }
            }
        }

        debug!(
            "Try={}, got {}/{} orphan responses",
            attempt + 1,
            found.len(),
            sockets.len()
        );
        if found.len() == sockets.len() {
            break;
        }
    }

    // Sockets that never answered belong to dead workers.
    for sock in worker_sockets(run_dir) {
        if !found.contains_key(&socket_uuid(&sock)) {
            warn!("Removing stale worker socket {:?}", sock);
            let _ = std::fs::remove_file(&sock);
        }
    }

    found.into_values().collect()
}

fn worker_sockets(run_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(run_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("worker-") && n.ends_with(".sock"))
                .unwrap_or(false)
        })
        .collect()
}

fn socket_uuid(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("worker-"))
        .and_then(|n| n.strip_suffix(".sock"))
        .unwrap_or_default()
        .to_string()
}
