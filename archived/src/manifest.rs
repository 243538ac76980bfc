use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, ArchiveResult};

/// Manifest header: one JSON object on the first line.
///
/// The `dir_meta` / `file_meta` lists fix the positional meaning of every
/// trailing field in the entry records that follow; they are resolved into
/// typed layouts exactly once, at open time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Disk-side root URL.
    pub src: String,
    /// Tape-side root URL.
    pub dst: String,
    #[serde(default)]
    pub svc_class: String,
    pub dir_meta: Vec<String>,
    pub file_meta: Vec<String>,
    pub num_dirs: u64,
    pub num_files: u64,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub gid: String,
    #[serde(default)]
    pub timestamp: String,
    /// Incremental-backup time window: which timestamp field to compare
    /// and the cutoff in epoch seconds. Empty means no filtering.
    #[serde(default)]
    pub twindow_type: String,
    #[serde(default)]
    pub twindow_val: String,
    /// Extended-attribute keys excluded from comparison; `*` disables the
    /// xattr check entirely.
    #[serde(default)]
    pub excl_xattr: Vec<String>,
}

impl Header {
    pub fn time_window(&self) -> Option<(&str, i64)> {
        if self.twindow_type.is_empty() || self.twindow_val.is_empty() {
            return None;
        }
        let cutoff = self.twindow_val.parse().ok()?;
        Some((self.twindow_type.as_str(), cutoff))
    }
}

/// Directory record, typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub uid: String,
    pub gid: String,
    /// Octal string including type bits, e.g. `40755`.
    pub mode: String,
    pub attrs: BTreeMap<String, String>,
}

/// File record, typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub mtime: String,
    pub ctime: String,
    pub uid: String,
    pub gid: String,
    /// Octal permission string, e.g. `644`.
    pub mode: String,
    pub xs_type: String,
    pub xs: String,
}

impl FileEntry {
    /// The timestamp field selected by a time-window filter, in seconds.
    pub fn time_field_secs(&self, which: &str) -> Option<i64> {
        let raw = match which {
            "mtime" => &self.mtime,
            "ctime" => &self.ctime,
            _ => return None,
        };
        let secs = raw.split('.').next()?;
        secs.parse::<f64>().ok().map(|v| v as i64)
    }
}

/// One manifest record: the tagged union of the two record kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir(DirEntry),
    File(FileEntry),
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Entry::Dir(d) => &d.path,
            Entry::File(f) => &f.path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Dir(_))
    }

    /// Record identity inside one manifest: kind plus relative path.
    pub fn same_record(&self, other: &Entry) -> bool {
        self.is_dir() == other.is_dir() && self.path() == other.path()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
}

/// Positional layout of directory records, resolved from `dir_meta`.
#[derive(Debug, Clone)]
struct DirLayout {
    uid: usize,
    gid: usize,
    mode: usize,
    attr: usize,
}

/// Positional layout of file records, resolved from `file_meta`.
#[derive(Debug, Clone)]
struct FileLayout {
    size: usize,
    mtime: usize,
    ctime: usize,
    uid: usize,
    gid: usize,
    mode: usize,
    xs_type: usize,
    xs: usize,
}

/// Trailing attribute fields start after the kind and path columns.
const FIELD_BASE: usize = 2;

fn field_index(meta: &[String], name: &str, kind: &'static str) -> ArchiveResult<usize> {
    meta.iter()
        .position(|m| m == name)
        .map(|p| p + FIELD_BASE)
        .ok_or_else(|| ArchiveError::Format {
            line: 1,
            reason: format!("{} lacks attribute {:?}", kind, name),
        })
}

impl DirLayout {
    fn resolve(meta: &[String]) -> ArchiveResult<Self> {
        Ok(Self {
            uid: field_index(meta, "uid", "dir_meta")?,
            gid: field_index(meta, "gid", "dir_meta")?,
            mode: field_index(meta, "mode", "dir_meta")?,
            attr: field_index(meta, "attr", "dir_meta")?,
        })
    }
}

impl FileLayout {
    fn resolve(meta: &[String]) -> ArchiveResult<Self> {
        Ok(Self {
            size: field_index(meta, "size", "file_meta")?,
            mtime: field_index(meta, "mtime", "file_meta")?,
            ctime: field_index(meta, "ctime", "file_meta")?,
            uid: field_index(meta, "uid", "file_meta")?,
            gid: field_index(meta, "gid", "file_meta")?,
            mode: field_index(meta, "mode", "file_meta")?,
            xs_type: field_index(meta, "xstype", "file_meta")?,
            xs: field_index(meta, "xs", "file_meta")?,
        })
    }
}

/// An open manifest: parsed header plus the byte offsets of the first
/// directory record and the first file record, so either class can be
/// re-iterated independently without re-reading the whole file.
pub struct Manifest {
    path: PathBuf,
    pub header: Header,
    /// Direction flag: disk to tape.
    pub d2t: bool,
    dir_offset: u64,
    file_offset: u64,
    dir_layout: DirLayout,
    file_layout: FileLayout,
}

impl Manifest {
    /// Parse the header and locate both record sections.
    ///
    /// All directory records precede all file records; a manifest that
    /// opens with anything but a directory record, or that holds no file
    /// section, is malformed.
    pub fn open(path: &Path, d2t: bool) -> ArchiveResult<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut line = String::new();
        let header_len = reader.read_line(&mut line)?;
        if header_len == 0 {
            return Err(ArchiveError::Format {
                line: 1,
                reason: "empty manifest".to_string(),
            });
        }
        let header: Header =
            serde_json::from_str(line.trim_end()).map_err(|e| ArchiveError::Format {
                line: 1,
                reason: e.to_string(),
            })?;

        let dir_layout = DirLayout::resolve(&header.dir_meta)?;
        let file_layout = FileLayout::resolve(&header.file_meta)?;
        let dir_offset = header_len as u64;

        // Scan forward for the first file record; every line until then
        // must be a directory record.
        let mut pos = dir_offset;
        let mut line_no = 1usize;
        let mut file_offset = None;
        let mut saw_dir = false;

        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            line_no += 1;
            let kind = record_kind(line.trim_end(), line_no)?;
            match kind {
                EntryKind::Dir => saw_dir = true,
                EntryKind::File => {
                    file_offset = Some(pos);
                    break;
                }
            }
            pos += n as u64;
        }

        if !saw_dir {
            return Err(ArchiveError::MissingSection { kind: "directory" });
        }
        let file_offset = file_offset.ok_or(ArchiveError::MissingSection { kind: "file" })?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            d2t,
            dir_offset,
            file_offset,
            dir_layout,
            file_layout,
        })
    }

    /// Restartable scan over the directory records, in manifest order.
    pub fn dirs(&self) -> ArchiveResult<EntryIter<'_>> {
        self.iter_from(self.dir_offset, Some(EntryKind::Dir))
    }

    /// Restartable scan over the file records, in manifest order.
    pub fn files(&self) -> ArchiveResult<EntryIter<'_>> {
        self.iter_from(self.file_offset, Some(EntryKind::File))
    }

    /// All records in header-mandated order: directories, then files.
    pub fn entries(&self) -> ArchiveResult<impl Iterator<Item = ArchiveResult<Entry>> + '_> {
        Ok(self.dirs()?.chain(self.files()?))
    }

    fn iter_from(&self, offset: u64, want: Option<EntryKind>) -> ArchiveResult<EntryIter<'_>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(EntryIter {
            reader: BufReader::new(file),
            manifest: self,
            want,
            done: false,
        })
    }

    /// Absolute (source, destination) URLs for a relative path, oriented to
    /// the transfer direction. The header's `src` is always the disk side
    /// and `dst` the tape side; callers must not assume source means disk.
    pub fn endpoints(&self, rel_path: &str) -> (String, String) {
        let rel = if rel_path == "./" { "" } else { rel_path };
        let disk = format!("{}{}", self.header.src, rel);
        let mut tape = format!("{}{}", self.header.dst, rel);
        if !self.header.svc_class.is_empty() {
            tape = format!("{}?svcClass={}", tape, self.header.svc_class);
        }
        if self.d2t {
            (disk, tape)
        } else {
            (tape, disk)
        }
    }

    fn parse_entry(&self, raw: &str, line: usize) -> ArchiveResult<Entry> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ArchiveError::Format {
            line,
            reason: e.to_string(),
        })?;
        let arr = value.as_array().ok_or_else(|| ArchiveError::Format {
            line,
            reason: "record is not a JSON array".to_string(),
        })?;

        let kind = record_kind(raw, line)?;
        let path = str_field(arr, 1, line)?.to_string();

        match kind {
            EntryKind::Dir => {
                let lay = &self.dir_layout;
                let attrs = arr
                    .get(lay.attr)
                    .and_then(Value::as_object)
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| {
                                (k.clone(), v.as_str().unwrap_or_default().to_string())
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Entry::Dir(DirEntry {
                    path,
                    uid: str_field(arr, lay.uid, line)?.to_string(),
                    gid: str_field(arr, lay.gid, line)?.to_string(),
                    mode: str_field(arr, lay.mode, line)?.to_string(),
                    attrs,
                }))
            }
            EntryKind::File => {
                let lay = &self.file_layout;
                let size_raw = str_field(arr, lay.size, line)?;
                let size = size_raw.parse().map_err(|_| ArchiveError::Format {
                    line,
                    reason: format!("invalid size value {:?}", size_raw),
                })?;
                Ok(Entry::File(FileEntry {
                    path,
                    size,
                    mtime: str_field(arr, lay.mtime, line)?.to_string(),
                    ctime: str_field(arr, lay.ctime, line)?.to_string(),
                    uid: str_field(arr, lay.uid, line)?.to_string(),
                    gid: str_field(arr, lay.gid, line)?.to_string(),
                    mode: str_field(arr, lay.mode, line)?.to_string(),
                    xs_type: str_field(arr, lay.xs_type, line)?.to_string(),
                    xs: str_field(arr, lay.xs, line)?.to_string(),
                }))
            }
        }
    }
}

fn record_kind(raw: &str, line: usize) -> ArchiveResult<EntryKind> {
    // Records open with `["d",` or `["f",`; peeking the tag avoids a full
    // parse while locating section offsets.
    let tag = raw.trim_start();
    if tag.starts_with("[\"d\"") {
        Ok(EntryKind::Dir)
    } else if tag.starts_with("[\"f\"") {
        Ok(EntryKind::File)
    } else {
        Err(ArchiveError::Format {
            line,
            reason: "record kind is neither \"d\" nor \"f\"".to_string(),
        })
    }
}

fn str_field<'v>(arr: &'v [Value], idx: usize, line: usize) -> ArchiveResult<&'v str> {
    arr.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| ArchiveError::Format {
            line,
            reason: format!("missing or non-string field at position {}", idx),
        })
}

/// Lazy scan over one record class. The iterator is finite, stops at the
/// first record of the other class and never crosses into it; re-creating
/// it restarts from the stored section offset.
pub struct EntryIter<'m> {
    reader: BufReader<File>,
    manifest: &'m Manifest,
    want: Option<EntryKind>,
    done: bool,
}

impl Iterator for EntryIter<'_> {
    type Item = ArchiveResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                let raw = line.trim_end();
                if raw.is_empty() {
                    self.done = true;
                    return None;
                }
                let kind = match record_kind(raw, 0) {
                    Ok(k) => k,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };
                if let Some(want) = self.want {
                    if kind != want {
                        self.done = true;
                        return None;
                    }
                }
                Some(self.manifest.parse_entry(raw, 0))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e.into()))
            }
        }
    }
}

/// Canonical attribute orders written by `ManifestBuilder`.
pub const DIR_META: [&str; 4] = ["uid", "gid", "mode", "attr"];
pub const FILE_META: [&str; 8] = [
    "size", "mtime", "ctime", "uid", "gid", "mode", "xstype", "xs",
];

/// Serializes a manifest: header line, all directory records, then all
/// file records, preserving insertion order.
pub struct ManifestBuilder {
    header: Header,
    dirs: Vec<DirEntry>,
    files: Vec<FileEntry>,
}

impl ManifestBuilder {
    pub fn new(src: &str, dst: &str) -> Self {
        Self {
            header: Header {
                src: src.to_string(),
                dst: dst.to_string(),
                svc_class: String::new(),
                dir_meta: DIR_META.iter().map(|s| s.to_string()).collect(),
                file_meta: FILE_META.iter().map(|s| s.to_string()).collect(),
                num_dirs: 0,
                num_files: 0,
                uid: "0".to_string(),
                gid: "0".to_string(),
                timestamp: String::new(),
                twindow_type: String::new(),
                twindow_val: String::new(),
                excl_xattr: Vec::new(),
            },
            dirs: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn svc_class(mut self, svc: &str) -> Self {
        self.header.svc_class = svc.to_string();
        self
    }

    pub fn owner(mut self, uid: &str, gid: &str) -> Self {
        self.header.uid = uid.to_string();
        self.header.gid = gid.to_string();
        self
    }

    pub fn time_window(mut self, which: &str, cutoff: i64) -> Self {
        self.header.twindow_type = which.to_string();
        self.header.twindow_val = cutoff.to_string();
        self
    }

    pub fn exclude_xattrs(mut self, keys: &[&str]) -> Self {
        self.header.excl_xattr = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn add_dir(&mut self, entry: DirEntry) -> &mut Self {
        self.dirs.push(entry);
        self
    }

    pub fn add_file(&mut self, entry: FileEntry) -> &mut Self {
        self.files.push(entry);
        self
    }

    pub fn write_to(&self, path: &Path) -> ArchiveResult<()> {
        let mut header = self.header.clone();
        header.num_dirs = self.dirs.len() as u64;
        header.num_files = self.files.len() as u64;

        let mut out = File::create(path)?;
        let header_line = serde_json::to_string(&header).map_err(|e| ArchiveError::Format {
            line: 1,
            reason: e.to_string(),
        })?;
        writeln!(out, "{}", header_line)?;

        for d in &self.dirs {
            let attrs: serde_json::Map<String, Value> = d
                .attrs
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            let record = serde_json::json!(["d", d.path, d.uid, d.gid, d.mode, attrs]);
            writeln!(out, "{}", record)?;
        }
        for f in &self.files {
            let record = serde_json::json!([
                "f",
                f.path,
                f.size.to_string(),
                f.mtime,
                f.ctime,
                f.uid,
                f.gid,
                f.mode,
                f.xs_type,
                f.xs
            ]);
            writeln!(out, "{}", record)?;
        }
        out.flush()?;
        Ok(())
    }
}
