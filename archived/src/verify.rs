use std::sync::Arc;
use tracing::{debug, error};

use crate::backend::{EntryStat, StorageBackend};
use crate::error::ArchiveResult;
use crate::manifest::{DirEntry, Entry, FileEntry, Manifest};
use crate::utils::{is_version_marker, pad_checksum, parse_octal};

/// How much of an entry to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckScope {
    /// Everything the record carries: size, checksum, ownership, mode,
    /// timestamps, extended attributes.
    Full,
    /// Transfer integrity only: existence, size and checksum.
    TransferOnly,
}

/// Why a single entry failed verification.
#[derive(Debug, Clone)]
pub struct Mismatch {
    pub url: String,
    pub reason: String,
}

impl Mismatch {
    fn new(url: &str, reason: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// The setgid bit some destinations add to freshly created directories;
/// tolerated when comparing recorded directory modes.
const SETGID_BIT: u32 = 0o2000;

/// Checks manifest records against their true state at the destination.
pub struct Verifier<'m> {
    manifest: &'m Manifest,
    backend: Arc<dyn StorageBackend>,
    /// Backup semantics: honor the time window and skip version markers.
    backup: bool,
}

impl<'m> Verifier<'m> {
    pub fn new(manifest: &'m Manifest, backend: Arc<dyn StorageBackend>, backup: bool) -> Self {
        Self {
            manifest,
            backend,
            backup,
        }
    }

    /// Verify every entry in manifest order.
    ///
    /// With `best_effort` false the scan stops at the first failure and
    /// returns it alone (archive semantics); with `best_effort` true the
    /// scan continues and returns the full failure list (backup
    /// semantics).
    pub async fn verify_all(
        &self,
        best_effort: bool,
        scope: CheckScope,
    ) -> ArchiveResult<(bool, Vec<Entry>)> {
        debug!("Do transfer verification, scope={:?}", scope);
        let mut failed = Vec::new();

        for entry in self.manifest.entries()? {
            let entry = entry?;
            if let Err(mismatch) = self.verify_entry(&entry, scope).await {
                error!(
                    "Verify failed for entry={} reason={}",
                    mismatch.url, mismatch.reason
                );
                failed.push(entry);
                if !best_effort {
                    break;
                }
            }
        }

        Ok((failed.is_empty(), failed))
    }

    /// Check one entry. Backend failures while inspecting the destination
    /// count as mismatches: an unreadable entry is as corrupt as a wrong
    /// one.
    pub async fn verify_entry(&self, entry: &Entry, scope: CheckScope) -> Result<(), Mismatch> {
        let (_, dst) = self.manifest.endpoints(entry.path());

        if self.manifest.d2t {
            return self.verify_tape_side(entry, &dst).await;
        }

        // Backup transfers skip entries outside the time window and
        // transient version markers entirely.
        if self.backup {
            if let Entry::File(f) = entry {
                if self.outside_time_window(f) {
                    return Ok(());
                }
                if is_version_marker(&f.path) {
                    return Ok(());
                }
            }
        }

        match entry {
            Entry::Dir(d) => self.verify_disk_dir(d, &dst).await,
            Entry::File(f) => self.verify_disk_file(f, &dst, scope).await,
        }
    }

    /// Disk→tape check: existence, and for files size plus checksum when
    /// the recorded type is supported. Zero-length files carry no
    /// checksum on the tape layer.
    async fn verify_tape_side(&self, entry: &Entry, dst: &str) -> Result<(), Mismatch> {
        let stat = self.stat(dst).await?;

        if let Entry::File(f) = entry {
            if stat.size != f.size {
                return Err(Mismatch::new(
                    dst,
                    format!("expect_size={}, size={}", f.size, stat.size),
                ));
            }
            if f.size != 0 && f.xs_type == "adler" {
                let got = self.checksum(dst, &f.xs_type).await?;
                if pad_checksum(&got) != pad_checksum(&f.xs) {
                    return Err(Mismatch::new(
                        dst,
                        format!("xs_expected={} xs_got={}", f.xs, got),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn verify_disk_dir(&self, d: &DirEntry, dst: &str) -> Result<(), Mismatch> {
        let stat = self.stat(dst).await?;
        if !stat.is_dir {
            return Err(Mismatch::new(dst, "expected a directory"));
        }

        if stat.uid.to_string() != d.uid || stat.gid.to_string() != d.gid {
            return Err(Mismatch::new(
                dst,
                format!(
                    "owner {}:{} expected {}:{}",
                    stat.uid, stat.gid, d.uid, d.gid
                ),
            ));
        }
        self.check_dir_mode(d, &stat, dst)?;
        self.check_dir_attrs(d, dst).await?;
        Ok(())
    }

    fn check_dir_mode(&self, d: &DirEntry, stat: &EntryStat, dst: &str) -> Result<(), Mismatch> {
        let recorded = parse_octal(&d.mode)
            .ok_or_else(|| Mismatch::new(dst, format!("unparsable recorded mode {:?}", d.mode)))?;
        let observed = stat.mode & 0o47777;
        let recorded = recorded & 0o47777;

        if observed != recorded && observed != recorded | SETGID_BIT {
            return Err(Mismatch::new(
                dst,
                format!("mode {:o} expected {:o}", observed, recorded),
            ));
        }
        Ok(())
    }

    async fn check_dir_attrs(&self, d: &DirEntry, dst: &str) -> Result<(), Mismatch> {
        let excluded = &self.manifest.header.excl_xattr;
        if excluded.iter().any(|k| k == "*") {
            return Ok(());
        }

        let observed = self
            .backend
            .get_xattrs(dst)
            .await
            .map_err(|e| Mismatch::new(dst, format!("failed getting xattrs: {}", e)))?;

        for (key, val) in &d.attrs {
            if excluded.iter().any(|k| k == key) {
                continue;
            }
            match observed.get(key) {
                Some(got) if got == val => {}
                Some(got) => {
                    return Err(Mismatch::new(
                        dst,
                        format!("xattr {}={:?} expected {:?}", key, got, val),
                    ))
                }
                None => return Err(Mismatch::new(dst, format!("missing xattr {}", key))),
            }
        }
        for key in observed.keys() {
            if !d.attrs.contains_key(key) && !excluded.iter().any(|k| k == key) {
                return Err(Mismatch::new(dst, format!("unexpected xattr {}", key)));
            }
        }
        Ok(())
    }

    async fn verify_disk_file(
        &self,
        f: &FileEntry,
        dst: &str,
        scope: CheckScope,
    ) -> Result<(), Mismatch> {
        let stat = self.stat(dst).await?;

        if stat.size != f.size {
            return Err(Mismatch::new(
                dst,
                format!("expect_size={}, size={}", f.size, stat.size),
            ));
        }
        self.check_file_checksum(f, dst).await?;

        if scope == CheckScope::TransferOnly {
            return Ok(());
        }

        if stat.uid.to_string() != f.uid || stat.gid.to_string() != f.gid {
            return Err(Mismatch::new(
                dst,
                format!("owner {}:{} expected {}:{}", stat.uid, stat.gid, f.uid, f.gid),
            ));
        }
        let recorded_mode = parse_octal(&f.mode)
            .ok_or_else(|| Mismatch::new(dst, format!("unparsable recorded mode {:?}", f.mode)))?;
        if stat.mode & 0o7777 != recorded_mode & 0o7777 {
            return Err(Mismatch::new(
                dst,
                format!("mode {:o} expected {:o}", stat.mode & 0o7777, recorded_mode),
            ));
        }
        if stat.mtime != f.mtime {
            return Err(Mismatch::new(
                dst,
                format!("mtime {} expected {}", stat.mtime, f.mtime),
            ));
        }
        if stat.ctime != f.ctime {
            return Err(Mismatch::new(
                dst,
                format!("ctime {} expected {}", stat.ctime, f.ctime),
            ));
        }
        Ok(())
    }

    async fn check_file_checksum(&self, f: &FileEntry, dst: &str) -> Result<(), Mismatch> {
        // Zero-length files are exempt; `0` means no checksum recorded.
        if f.size == 0 || f.xs == "0" || f.xs.is_empty() || f.xs_type == "0" {
            return Ok(());
        }
        let got = self.checksum(dst, &f.xs_type).await?;
        if pad_checksum(&got) != pad_checksum(&f.xs) {
            return Err(Mismatch::new(
                dst,
                format!("xs_expected={} xs_got={}", f.xs, got),
            ));
        }
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

    async fn stat(&self, url: &str) -> Result<EntryStat, Mismatch> {
        self.backend
            .stat(url)
            .await
            .map_err(|e| Mismatch::new(url, format!("failed stat: {}", e)))
    }

    async fn checksum(&self, url: &str, kind: &str) -> Result<String, Mismatch> {
        self.backend
            .checksum(url, kind)
            .await
            .map_err(|e| Mismatch::new(url, format!("failed xs query: {}", e)))
    }
}
