use async_trait::async_trait;
use filetime::FileTime;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::backend::{BackendError, BackendResult, CopyJob, EntryStat, StorageBackend};

/// Extended attribute carrying the recorded creation time. Local
/// filesystems do not allow setting ctime, so it is surfaced out of band
/// the way a tape backend would store it.
const CTIME_XATTR: &str = "archived.ctime";

/// Storage backend over the local filesystem.
///
/// URLs are `file://`-style or plain POSIX paths; query suffixes (service
/// class hints) are accepted and ignored. Stage and evict requests are
/// no-ops and every file counts as tape-resident once written.
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        LocalFs
    }

    /// Strip scheme, authority and query from a URL, keeping the path.
    pub fn url_to_path(url: &str) -> PathBuf {
        let no_query = match url.find('?') {
            Some(pos) => &url[..pos],
            None => url,
        };
        let path = match no_query.find("://") {
            Some(pos) => {
                let rest = &no_query[pos + 3..];
                match rest.find('/') {
                    Some(slash) => &rest[slash..],
                    None => "/",
                }
            }
            None => no_query,
        };
        PathBuf::from(path)
    }

    fn io_err(op: &'static str, path: &Path, e: std::io::Error) -> BackendError {
        if e.kind() == ErrorKind::NotFound {
            BackendError::NotFound {
                op,
                path: path.display().to_string(),
            }
        } else {
            BackendError::failed(op, path.display().to_string(), e)
        }
    }

    fn xattr_name(key: &str) -> String {
        format!("user.{}", key)
    }

    async fn compute_checksum(path: &Path, kind: &str) -> BackendResult<String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Self::io_err("checksum", path, e))?;
        let mut buffer = vec![0u8; 64 * 1024];

        match kind {
            "adler" | "adler32" => {
                let mut hasher = adler32::RollingAdler32::new();
                loop {
                    let n = file
                        .read(&mut buffer)
                        .await
                        .map_err(|e| Self::io_err("checksum", path, e))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update_buffer(&buffer[..n]);
                }
                Ok(format!("{:08x}", hasher.hash()))
            }
            "md5" => {
                let mut contents = Vec::new();
                file.read_to_end(&mut contents)
                    .await
                    .map_err(|e| Self::io_err("checksum", path, e))?;
                Ok(format!("{:x}", md5::compute(&contents)))
            }
            "sha256" => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                loop {
                    let n = file
                        .read(&mut buffer)
                        .await
                        .map_err(|e| Self::io_err("checksum", path, e))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
            other => Err(BackendError::failed(
                "checksum",
                path.display().to_string(),
                format!("unsupported checksum type: {}", other),
            )),
        }
    }

    fn stored_ctime(path: &Path) -> Option<String> {
        xattr::get(path, Self::xattr_name(CTIME_XATTR))
            .ok()
            .flatten()
            .map(|v| String::from_utf8_lossy(&v).to_string())
    }

    /// Parse a `sec.nsec` timestamp; a missing fractional part means zero.
    fn parse_time(value: &str) -> (i64, u32) {
        match value.split_once('.') {
            Some((sec, nsec)) => (
                sec.parse().unwrap_or(0),
                nsec.parse().unwrap_or(0),
            ),
            None => (value.parse().unwrap_or(0), 0),
        }
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for LocalFs {
    async fn stat(&self, url: &str) -> BackendResult<EntryStat> {
        let path = Self::url_to_path(url);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::io_err("stat", &path, e))?;

        let ctime = Self::stored_ctime(&path)
            .unwrap_or_else(|| format!("{}.{}", meta.ctime(), meta.ctime_nsec()));

        Ok(EntryStat {
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode(),
            mtime: format!("{}.{}", meta.mtime(), meta.mtime_nsec()),
            ctime,
            offline: false,
            on_tape: true,
        })
    }

    async fn mkdir(&self, url: &str, recursive: bool) -> BackendResult<()> {
        let path = Self::url_to_path(url);
        let res = if recursive {
            tokio::fs::create_dir_all(&path).await
        } else {
            tokio::fs::create_dir(&path).await
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Self::io_err("mkdir", &path, e)),
        }
    }

    async fn rename(&self, src_url: &str, dst_url: &str) -> BackendResult<()> {
        let src = Self::url_to_path(src_url);
        let dst = Self::url_to_path(dst_url);
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| Self::io_err("rename", &src, e))
    }

    async fn remove_file(&self, url: &str) -> BackendResult<()> {
        let path = Self::url_to_path(url);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Self::io_err("rm", &path, e))
    }

    async fn remove_dir(&self, url: &str) -> BackendResult<()> {
        let path = Self::url_to_path(url);
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|e| Self::io_err("rmdir", &path, e))
    }

    async fn list(&self, url: &str) -> BackendResult<Vec<(String, EntryStat)>> {
        let path = Self::url_to_path(url);
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| Self::io_err("list", &path, e))?;

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_err("list", &path, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let stat = self
                .stat(&entry.path().display().to_string())
                .await?;
            out.push((name, stat));
        }
        Ok(out)
    }

    async fn copy_batch(&self, jobs: &[CopyJob]) -> BackendResult<()> {
        for job in jobs {
            let src = Self::url_to_path(&job.src);
            let dst = Self::url_to_path(&job.dst);
            debug!("copy {:?} -> {:?} ({} bytes)", src, dst, job.size);

            tokio::fs::copy(&src, &dst)
                .await
                .map_err(|e| Self::io_err("copy", &src, e))?;

            if let Some(expect) = &job.expect {
                let meta = tokio::fs::metadata(&dst)
                    .await
                    .map_err(|e| Self::io_err("copy", &dst, e))?;
                if meta.len() != expect.size {
                    return Err(BackendError::failed(
                        "copy",
                        dst.display().to_string(),
                        format!("booked size {} but wrote {}", expect.size, meta.len()),
                    ));
                }
                if expect.size != 0 && expect.checksum != "0" && !expect.checksum.is_empty() {
                    let got = Self::compute_checksum(&dst, &expect.checksum_type).await?;
                    if got != expect.checksum {
                        return Err(BackendError::failed(
                            "copy",
                            dst.display().to_string(),
                            format!("checksum {} expected {}", got, expect.checksum),
                        ));
                    }
                }
                self.chown(&job.dst, expect.uid, expect.gid).await?;
                self.utimes(&job.dst, &expect.ctime, &expect.mtime).await?;
            }
        }
        Ok(())
    }

    async fn checksum(&self, url: &str, kind: &str) -> BackendResult<String> {
        let path = Self::url_to_path(url);
        Self::compute_checksum(&path, kind).await
    }

    async fn chown(&self, url: &str, uid: u32, gid: u32) -> BackendResult<()> {
        let path = Self::url_to_path(url);
        nix::unistd::chown(
            &path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(|e| BackendError::failed("chown", path.display().to_string(), e))
    }

    async fn chmod(&self, url: &str, mode: u32) -> BackendResult<()> {
        let path = Self::url_to_path(url);
        let perms = std::fs::Permissions::from_mode(mode & 0o7777);
        tokio::fs::set_permissions(&path, perms)
            .await
            .map_err(|e| Self::io_err("chmod", &path, e))
    }

    async fn utimes(&self, url: &str, ctime: &str, mtime: &str) -> BackendResult<()> {
        let path = Self::url_to_path(url);

        let (sec, nsec) = Self::parse_time(mtime);
        filetime::set_file_mtime(&path, FileTime::from_unix_time(sec, nsec))
            .map_err(|e| Self::io_err("utimes", &path, e))?;

        if !ctime.is_empty() {
            xattr::set(&path, Self::xattr_name(CTIME_XATTR), ctime.as_bytes())
                .map_err(|e| Self::io_err("utimes", &path, e))?;
        }
        Ok(())
    }

    async fn get_xattrs(&self, url: &str) -> BackendResult<BTreeMap<String, String>> {
        let path = Self::url_to_path(url);
        let names = match xattr::list(&path) {
            Ok(names) => names,
            // Filesystems without xattr support hold no attributes.
            Err(e) if e.kind() == ErrorKind::Unsupported => return Ok(BTreeMap::new()),
            Err(e) => return Err(Self::io_err("getxattr", &path, e)),
        };

        let mut out = BTreeMap::new();
        for name in names {
            let name = name.to_string_lossy().to_string();
            let Some(key) = name.strip_prefix("user.") else {
                continue;
            };
            if key == CTIME_XATTR {
                continue;
            }
            if let Some(value) =
                xattr::get(&path, &name).map_err(|e| Self::io_err("getxattr", &path, e))?
            {
                out.insert(key.to_string(), String::from_utf8_lossy(&value).to_string());
            }
        }
        Ok(out)
    }

    async fn set_xattr(&self, url: &str, key: &str, value: &str) -> BackendResult<()> {
        let path = Self::url_to_path(url);
        xattr::set(&path, Self::xattr_name(key), value.as_bytes())
            .map_err(|e| Self::io_err("setxattr", &path, e))
    }

    async fn remove_xattr(&self, url: &str, key: &str) -> BackendResult<()> {
        let path = Self::url_to_path(url);
        xattr::remove(&path, Self::xattr_name(key))
            .map_err(|e| Self::io_err("rmxattr", &path, e))
    }

    async fn stage(&self, _urls: &[String]) -> BackendResult<()> {
        // Local files are never offline.
        Ok(())
    }

    async fn evict(&self, _urls: &[String]) -> BackendResult<()> {
        Ok(())
    }

    async fn fetch(&self, url: &str, local: &Path) -> BackendResult<()> {
        let src = Self::url_to_path(url);
        tokio::fs::copy(&src, local)
            .await
            .map(|_| ())
            .map_err(|e| Self::io_err("fetch", &src, e))
    }

    async fn publish(&self, local: &Path, url: &str) -> BackendResult<()> {
        let dst = Self::url_to_path(url);
        tokio::fs::copy(local, &dst)
            .await
            .map(|_| ())
            .map_err(|e| Self::io_err("publish", local, e))
    }

    async fn write_file(&self, url: &str, data: &[u8]) -> BackendResult<()> {
        let path = Self::url_to_path(url);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| Self::io_err("write", &path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_url_to_path() {
        assert_eq!(
            LocalFs::url_to_path("file:///data/a/x.txt"),
            PathBuf::from("/data/a/x.txt")
        );
        assert_eq!(
            LocalFs::url_to_path("file://host/data/a/"),
            PathBuf::from("/data/a/")
        );
        assert_eq!(
            LocalFs::url_to_path("/data/a/x.txt?svcClass=tape"),
            PathBuf::from("/data/a/x.txt")
        );
        assert_eq!(LocalFs::url_to_path("/plain/path"), PathBuf::from("/plain/path"));
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(LocalFs::parse_time("1700000000.250"), (1700000000, 250));
        assert_eq!(LocalFs::parse_time("1700000000"), (1700000000, 0));
    }

    #[tokio::test]
    async fn test_adler_checksum() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("w.txt");
        tokio::fs::write(&path, b"Wikipedia").await.unwrap();

        let fs = LocalFs::new();
        let xs = fs
            .checksum(&path.display().to_string(), "adler")
            .await
            .unwrap();
        assert_eq!(xs, "11e60398");
    }

    #[tokio::test]
    async fn test_copy_batch_enforces_booked_size() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        tokio::fs::write(&src, b"hello").await.unwrap();
        let dst = tmp.path().join("dst.txt");

        let meta = tokio::fs::metadata(&src).await.unwrap();
        let fs = LocalFs::new();
        let job = CopyJob::new(src.display().to_string(), dst.display().to_string(), 5)
            .with_expectation(crate::backend::CopyExpectation {
                size: 9999,
                uid: meta.uid(),
                gid: meta.gid(),
                mtime: String::new(),
                ctime: String::new(),
                checksum_type: "adler".to_string(),
                checksum: "0".to_string(),
            });

        let err = fs.copy_batch(&[job]).await.unwrap_err();
        assert!(err.to_string().contains("booked size"));
    }

    #[tokio::test]
    async fn test_stat_missing_is_not_found() {
        let fs = LocalFs::new();
        let err = fs.stat("/nonexistent/really/not/here").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!fs.exists("/nonexistent/really/not/here").await.unwrap());
    }
}
