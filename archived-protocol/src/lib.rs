//! Wire types shared by the archive dispatcher, its worker processes and
//! any submitting client.
//!
//! All IPC is newline-delimited UTF-8 over Unix sockets: requests are one
//! JSON document per line, dispatcher replies are plain strings starting
//! with `OK` or `ERROR`.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Requested archive operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Put,
    Get,
    Purge,
    Delete,
    Backup,
    Transfers,
    Kill,
    Stats,
}

impl OpKind {
    /// Operations that spawn a worker process, as opposed to queries the
    /// dispatcher answers in place.
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            OpKind::Put | OpKind::Get | OpKind::Purge | OpKind::Delete | OpKind::Backup
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Put => "put",
            OpKind::Get => "get",
            OpKind::Purge => "purge",
            OpKind::Delete => "delete",
            OpKind::Backup => "backup",
            OpKind::Transfers => "transfers",
            OpKind::Kill => "kill",
            OpKind::Stats => "stats",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "put" => Ok(OpKind::Put),
            "get" => Ok(OpKind::Get),
            "purge" => Ok(OpKind::Purge),
            "delete" => Ok(OpKind::Delete),
            "backup" => Ok(OpKind::Backup),
            "transfers" => Ok(OpKind::Transfers),
            "kill" => Ok(OpKind::Kill),
            "stats" => Ok(OpKind::Stats),
            _ => Err(anyhow::anyhow!("Invalid operation: {}", s)),
        }
    }
}

/// Request modifier carried in the `opt` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RequestOption {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "retry")]
    Retry,
    #[serde(rename = "force")]
    Force,
}

/// Inbound dispatcher request.
///
/// For transfer operations `src` is the full URL of the manifest file; for
/// `kill` and `transfers` the selector (a UUID, `all` or an operation name)
/// is carried in `arg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub cmd: OpKind,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub opt: RequestOption,
    #[serde(default)]
    pub arg: String,
    pub uid: u32,
    pub gid: u32,
}

/// Status-channel request sent by the dispatcher to a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cmd")]
pub enum StatusRequest {
    /// Poll the current human-readable progress.
    Status,
    /// Ask a possibly-orphaned worker to re-announce its full identity.
    OrphanStatus,
}

/// Status-channel reply: one flat record identifying the worker and its
/// current stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub uuid: String,
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
    pub root_dir: String,
    pub op: OpKind,
    pub status: String,
    pub timestamp: u64,
}

/// Send one JSON document as a single line.
pub async fn send_json<T: Serialize>(
    writer: &mut (dyn AsyncWrite + Unpin + Send),
    msg: &T,
) -> Result<()> {
    let mut buf = serde_json::to_vec(msg).context("Failed to encode message")?;
    buf.push(b'\n');
    writer.write_all(&buf).await.context("Failed to write message")?;
    writer.flush().await.context("Failed to flush writer")?;
    Ok(())
}

/// Receive one JSON document from a single line.
pub async fn recv_json<T: DeserializeOwned>(
    reader: &mut (dyn AsyncBufRead + Unpin + Send),
) -> Result<T> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .context("Failed to read message")?;
    if n == 0 {
        anyhow::bail!("Connection closed");
    }
    serde_json::from_str(line.trim_end()).context("Failed to decode message")
}

/// Send a plain-string reply (`OK ...` / `ERROR ...`).
pub async fn send_reply(writer: &mut (dyn AsyncWrite + Unpin + Send), reply: &str) -> Result<()> {
    writer
        .write_all(reply.as_bytes())
        .await
        .context("Failed to write reply")?;
    writer.write_all(b"\n").await.context("Failed to write reply")?;
    writer.flush().await.context("Failed to flush writer")?;
    Ok(())
}

/// Receive a plain-string reply.
pub async fn recv_reply(reader: &mut (dyn AsyncBufRead + Unpin + Send)) -> Result<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .context("Failed to read reply")?;
    if n == 0 {
        anyhow::bail!("Connection closed");
    }
    Ok(line.trim_end().to_string())
}

/// Derive the stable transfer UUID from the archive's root path.
///
/// Two requests for the same root collide by construction, which is what
/// lets the dispatcher reject duplicate submissions.
pub fn transfer_uuid(root_dir: &str) -> String {
    let digest = Sha256::digest(root_dir.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// The manifest's parent URL, including the trailing slash.
pub fn manifest_root(src: &str) -> String {
    match src.rfind('/') {
        Some(pos) => src[..=pos].to_string(),
        None => src.to_string(),
    }
}

/// Strip the scheme and authority from a root URL, keeping the path.
/// `file://host/data/a/` and `file:///data/a/` both map to `/data/a/`.
pub fn root_path(root_url: &str) -> String {
    match root_url.rfind("//") {
        Some(pos) => root_url[pos + 1..].to_string(),
        None => root_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let req = TransferRequest {
            cmd: OpKind::Put,
            src: "file:///data/exp1/.archive.init".to_string(),
            opt: RequestOption::Retry,
            arg: String::new(),
            uid: 1000,
            gid: 1000,
        };
        let text = serde_json::to_string(&req).unwrap();
        assert!(text.contains("\"cmd\":\"put\""));
        assert!(text.contains("\"opt\":\"retry\""));

        let back: TransferRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.cmd, OpKind::Put);
        assert_eq!(back.opt, RequestOption::Retry);
        assert_eq!(back.src, req.src);
    }

    #[test]
    fn test_empty_opt_is_none() {
        let text = r#"{"cmd":"get","src":"file:///a/.archive","opt":"","uid":0,"gid":0}"#;
        let req: TransferRequest = serde_json::from_str(text).unwrap();
        assert_eq!(req.opt, RequestOption::None);
        assert!(req.arg.is_empty());
    }

    #[test]
    fn test_uuid_is_stable() {
        let a = transfer_uuid("/data/exp1/");
        let b = transfer_uuid("/data/exp1/");
        let c = transfer_uuid("/data/exp2/");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_root_derivation() {
        let src = "file://host/data/exp1/.archive.init";
        let root = manifest_root(src);
        assert_eq!(root, "file://host/data/exp1/");
        assert_eq!(root_path(&root), "/data/exp1/");
        assert_eq!(root_path("file:///data/exp1/"), "/data/exp1/");
    }
}
