use anyhow::{Context, Result};
use archived_protocol::{
    manifest_root, recv_json, root_path, send_reply, transfer_uuid, OpKind, StatusRequest,
    TransferRequest,
};
use chrono::{Local, TimeZone};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ArchiveError;
use crate::status::{discover_orphans, query_worker};

/// One tracked transfer: a worker we spawned, or an orphan reattached
/// after a dispatcher restart (no child handle, liveness by signal 0).
struct ProcEntry {
    uuid: String,
    pid: u32,
    uid: u32,
    gid: u32,
    op: OpKind,
    src: String,
    status: String,
    timestamp: u64,
    child: Option<Child>,
}

/// Kill permission rule: root, the owning user, or a member of the
/// owning group.
pub fn can_kill(uid: u32, gid: u32, owner_uid: u32, owner_gid: u32) -> bool {
    uid == 0 || uid == owner_uid || gid == owner_gid
}

fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Long-lived supervisor: accepts transfer requests over a Unix socket,
/// enforces the concurrency limit, spawns one worker process per
/// transfer, tracks liveness and answers list/kill/stats queries.
///
/// Single-threaded by design: a poll loop over the inbound socket plus a
/// fixed tick interval. Each transfer runs in its own OS process, so a
/// crashing transfer cannot corrupt dispatcher state.
pub struct Dispatcher {
    config: Config,
    procs: HashMap<String, ProcEntry>,
    pending: VecDeque<(String, TransferRequest)>,
}

impl Dispatcher {
    pub async fn new(config: Config) -> Result<Self> {
        config.ensure_directories().await?;
        Ok(Self {
            config,
            procs: HashMap::new(),
            pending: VecDeque::new(),
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        if self.config.frontend_socket.exists() {
            tokio::fs::remove_file(&self.config.frontend_socket).await?;
        }
        let listener = UnixListener::bind(&self.config.frontend_socket).with_context(|| {
            format!("Failed to bind to socket: {:?}", self.config.frontend_socket)
        })?;
        info!(
            "Dispatcher listening on socket: {:?}",
            self.config.frontend_socket
        );

        self.reattach_orphans().await;

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.poll_timeout_ms));
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = self.handle_client(stream).await {
                            debug!("Client handler error: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = tick.tick() => self.update_status().await,
            }
        }
    }

    async fn handle_client(&mut self, stream: UnixStream) -> Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let request: TransferRequest = match recv_json(&mut reader).await {
            Ok(req) => req,
            Err(e) => {
                error!("Command is not in JSON format");
                send_reply(&mut write, "ERROR error: command not in JSON format").await?;
                return Err(e);
            }
        };
        debug!("Received command: {:?}", request);

        let reply = self.process(request).await;
        send_reply(&mut write, &reply).await
    }

    /// Dispatch one request and produce the plain-string reply.
    pub async fn process(&mut self, request: TransferRequest) -> String {
        match request.cmd {
            OpKind::Put | OpKind::Get | OpKind::Purge | OpKind::Delete | OpKind::Backup => {
                self.start_transfer(request).await
            }
            OpKind::Transfers => self.show_transfers(&request),
            OpKind::Kill => self.kill(&request),
            OpKind::Stats => self.stats(),
        }
    }

    /// Accept a new transfer: reject duplicates by derived UUID, queue it
    /// when all slots are busy, spawn a worker otherwise.
    async fn start_transfer(&mut self, request: TransferRequest) -> String {
        let root = manifest_root(&request.src);
        let uuid = transfer_uuid(&root_path(&root));
        debug!("Creating job={}, path={}", uuid, root);

        if self.procs.contains_key(&uuid) || self.pending.iter().any(|(u, _)| u == &uuid) {
            error!("Job with same uuid={} already exists", uuid);
            return format!("ERROR error: {}", ArchiveError::Duplicate { uuid });
        }

        if self.procs.len() >= self.config.max_transfers {
            if self.pending.len() >= self.config.max_pending {
                error!("Too many pending transfers, rejecting job={}", uuid);
                return format!(
                    "ERROR error: {}",
                    ArchiveError::Capacity {
                        max: self.config.max_pending
                    }
                );
            }
            warn!(
                "Maximum number of concurrent transfers reached, adding job={} to the pending list",
                uuid
            );
            self.pending.push_back((uuid.clone(), request));
            return format!("OK Id={} added to the pending list", uuid);
        }

        match self.spawn_worker(&uuid, &request).await {
            Ok(()) => format!("OK Id={}", uuid),
            Err(e) => {
                error!("Failed to spawn worker for {}: {}", uuid, e);
                format!("ERROR error: {}", e)
            }
        }
    }

    async fn spawn_worker(&mut self, uuid: &str, request: &TransferRequest) -> Result<()> {
        let payload = serde_json::to_string(request)?;
        let child = Command::new(&self.config.worker_exec)
            .arg(payload)
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.config.worker_exec))?;
        let pid = child.id().unwrap_or(0);
        info!("Spawned worker uuid={} pid={}", uuid, pid);

        self.procs.insert(
            uuid.to_string(),
            ProcEntry {
                uuid: uuid.to_string(),
                pid,
                uid: request.uid,
                gid: request.gid,
                op: request.cmd,
                src: request.src.clone(),
                status: "spawned".to_string(),
                timestamp: now_secs(),
                child: Some(child),
            },
        );
        Ok(())
    }

    /// Periodic tick: reap exited workers, poll the rest for progress,
    /// drop confirmed-dead orphans and launch pending transfers while
    /// slots are free.
    async fn update_status(&mut self) {
        let mut finished = Vec::new();
        for (uuid, entry) in self.procs.iter_mut() {
            if let Some(child) = entry.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(exit)) => {
                        info!(
                            "Worker uuid={} terminated with code={:?}",
                            uuid,
                            exit.code()
                        );
                        finished.push(uuid.clone());
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to poll worker {}: {}", uuid, e),
                }
            }
        }
        for uuid in finished {
            self.procs.remove(&uuid);
        }

        let timeout = Duration::from_millis(self.config.orphan_timeout_ms);
        let uuids: Vec<String> = self.procs.keys().cloned().collect();
        for uuid in uuids {
            let sock = self.config.status_socket(&uuid);
            match query_worker(&sock, StatusRequest::Status, timeout).await {
                Ok(reply) => {
                    if let Some(entry) = self.procs.get_mut(&uuid) {
                        entry.status = reply.status;
                    }
                }
                Err(_) => {
                    // A non-responsive orphan whose pid is gone is
                    // confirmed dead; spawned workers are reaped via
                    // their child handle instead.
                    let confirmed_dead = self
                        .procs
                        .get(&uuid)
                        .map(|e| e.child.is_none() && !process_alive(e.pid))
                        .unwrap_or(false);
                    if confirmed_dead {
                        info!("Orphan uuid={} confirmed dead, dropping", uuid);
                        self.procs.remove(&uuid);
                        let _ = std::fs::remove_file(&sock);
                    }
                }
            }
        }

        while self.procs.len() < self.config.max_transfers {
            let Some((uuid, request)) = self.pending.pop_front() else {
                break;
            };
            if let Err(e) = self.spawn_worker(&uuid, &request).await {
                error!("Failed to start pending job {}: {}", uuid, e);
            }
        }
    }

    /// Startup rendezvous: collect self-identifications from workers that
    /// outlived a previous dispatcher, so the restart neither loses them
    /// nor double-starts their transfers.
    async fn reattach_orphans(&mut self) {
        info!("Get orphans");
        let replies = discover_orphans(
            &self.config.run_dir,
            self.config.orphan_retries,
            Duration::from_millis(self.config.orphan_timeout_ms),
        )
        .await;

        for reply in replies {
            info!("Reattached orphan uuid={} pid={}", reply.uuid, reply.pid);
            self.procs.insert(
                reply.uuid.clone(),
                ProcEntry {
                    uuid: reply.uuid.clone(),
                    pid: reply.pid,
                    uid: reply.uid,
                    gid: reply.gid,
                    op: reply.op,
                    src: reply.root_dir.clone(),
                    status: reply.status,
                    timestamp: reply.timestamp,
                    child: None,
                },
            );
        }
    }

    /// List transfers matching the selector in `arg`: `all`, a UUID, or
    /// an operation kind.
    fn show_transfers(&self, request: &TransferRequest) -> String {
        let selector = request.arg.as_str();
        debug!("Show transfers type={}", selector);

        let matches = |uuid: &str, op: OpKind| {
            selector == "all" || selector == uuid || selector == op.as_str()
        };

        let mut msg = String::from("OK ");
        for entry in self.procs.values() {
            if matches(&entry.uuid, entry.op) {
                msg.push('\n');
                msg.push_str(&self.format_row(
                    entry.timestamp,
                    &entry.uuid,
                    &entry.src,
                    entry.op,
                    &entry.status,
                ));
            }
        }
        for (uuid, request) in &self.pending {
            if matches(uuid, request.cmd) {
                msg.push('\n');
                msg.push_str(&self.format_row(
                    now_secs(),
                    uuid,
                    &request.src,
                    request.cmd,
                    "pending",
                ));
            }
        }
        msg
    }

    fn format_row(&self, timestamp: u64, uuid: &str, src: &str, op: OpKind, status: &str) -> String {
        let date = Local
            .timestamp_opt(timestamp as i64, 0)
            .single()
            .map(|t| t.format("%a %b %e %H:%M:%S %Y").to_string())
            .unwrap_or_default();
        format!(
            "date={},uuid={},path={},op={},status={}",
            date, uuid, src, op, status
        )
    }

    /// Terminate a transfer, owner/root/group-member only.
    fn kill(&self, request: &TransferRequest) -> String {
        let uuid = request.arg.as_str();
        let Some(entry) = self.procs.get(uuid) else {
            return format!(
                "ERROR error: {}",
                ArchiveError::NotFound {
                    uuid: uuid.to_string()
                }
            );
        };

        if !can_kill(request.uid, request.gid, entry.uid, entry.gid) {
            error!(
                "User uid/gid={}/{} permission denied to kill job with uid/gid={}/{}",
                request.uid, request.gid, entry.uid, entry.gid
            );
            return format!(
                "ERROR error: {}",
                ArchiveError::PermissionDenied {
                    uuid: uuid.to_string()
                }
            );
        }

        debug!("Kill uuid={} pid={}", uuid, entry.pid);
        match nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(entry.pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        ) {
            Ok(()) => "OK".to_string(),
            Err(e) => format!("ERROR error: {}", e),
        }
    }

    fn stats(&self) -> String {
        format!(
            "OK max={} running={} pending={}",
            self.config.max_transfers,
            self.procs.len(),
            self.pending.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archived_protocol::RequestOption;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir, max_transfers: usize, max_pending: usize) -> Config {
        Config {
            frontend_socket: tmp.path().join("archived.sock"),
            run_dir: tmp.path().join("run"),
            local_dir: tmp.path().join("scratch"),
            max_transfers,
            max_pending,
            orphan_retries: 1,
            orphan_timeout_ms: 50,
            ..Config::default()
        }
    }

    fn put_request(src: &str) -> TransferRequest {
        TransferRequest {
            cmd: OpKind::Put,
            src: src.to_string(),
            opt: RequestOption::None,
            arg: String::new(),
            uid: 1000,
            gid: 1000,
        }
    }

    #[test]
    fn test_kill_permission_rule() {
        assert!(can_kill(0, 0, 1000, 1000)); // root
        assert!(can_kill(1000, 2000, 1000, 1000)); // owner
        assert!(can_kill(1001, 1000, 1000, 1000)); // same group
        assert!(!can_kill(1001, 2000, 1000, 1000)); // unrelated
    }

    #[tokio::test]
    async fn test_duplicate_signature_is_rejected() {
        let tmp = TempDir::new().unwrap();
        // No free slots, so requests queue instead of spawning processes.
        let mut dispatcher = Dispatcher::new(test_config(&tmp, 0, 10)).await.unwrap();

        let first = dispatcher
            .process(put_request("file:///data/exp1/.archive.init"))
            .await;
        assert!(first.starts_with("OK"), "unexpected reply: {}", first);

        let second = dispatcher
            .process(put_request("file:///data/exp1/.archive.init"))
            .await;
        assert!(second.starts_with("ERROR"), "unexpected reply: {}", second);
        assert!(second.contains("same signature"));

        // A different root is a different signature.
        let third = dispatcher
            .process(put_request("file:///data/exp2/.archive.init"))
            .await;
        assert!(third.starts_with("OK"));
    }

    #[tokio::test]
    async fn test_pending_limit_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let mut dispatcher = Dispatcher::new(test_config(&tmp, 0, 1)).await.unwrap();

        let first = dispatcher
            .process(put_request("file:///data/a/.archive.init"))
            .await;
        assert!(first.contains("pending"));

        let second = dispatcher
            .process(put_request("file:///data/b/.archive.init"))
            .await;
        assert!(second.starts_with("ERROR"));
        assert!(second.contains("pending"));
    }

    #[tokio::test]
    async fn test_stats_and_listing() {
        let tmp = TempDir::new().unwrap();
        let mut dispatcher = Dispatcher::new(test_config(&tmp, 0, 10)).await.unwrap();

        dispatcher
            .process(put_request("file:///data/exp1/.archive.init"))
            .await;

        let stats = dispatcher
            .process(TransferRequest {
                cmd: OpKind::Stats,
                src: String::new(),
                opt: RequestOption::None,
                arg: String::new(),
                uid: 0,
                gid: 0,
            })
            .await;
        assert_eq!(stats, "OK max=0 running=0 pending=1");

        let listing = dispatcher
            .process(TransferRequest {
                cmd: OpKind::Transfers,
                src: String::new(),
                opt: RequestOption::None,
                arg: "all".to_string(),
                uid: 0,
                gid: 0,
            })
            .await;
        assert!(listing.starts_with("OK"));
        assert!(listing.contains("op=put"));
        assert!(listing.contains("status=pending"));

        let filtered = dispatcher
            .process(TransferRequest {
                cmd: OpKind::Transfers,
                src: String::new(),
                opt: RequestOption::None,
                arg: "get".to_string(),
                uid: 0,
                gid: 0,
            })
            .await;
        assert_eq!(filtered, "OK ");
    }

    #[tokio::test]
    async fn test_kill_unknown_job() {
        let tmp = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(test_config(&tmp, 0, 10)).await.unwrap();

        let reply = dispatcher.kill(&TransferRequest {
            cmd: OpKind::Kill,
            src: String::new(),
            opt: RequestOption::None,
            arg: "no-such-uuid".to_string(),
            uid: 0,
            gid: 0,
        });
        assert!(reply.starts_with("ERROR"));
        assert!(reply.contains("not found"));
    }
}
