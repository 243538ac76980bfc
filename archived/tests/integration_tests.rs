use anyhow::Result;
use archived::protocol::{OpKind, RequestOption, TransferRequest};
use archived::utils::format_mode;
use archived::{
    ArchiveError, CheckScope, Config, DirEntry, FileEntry, LocalFs, Manifest, ManifestBuilder,
    StorageBackend, Transfer, Verifier,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Tempdirs live under the target directory: the engine round-trips
/// extended attributes and /tmp may sit on a filesystem without them.
fn scratch() -> TempDir {
    tempfile::tempdir_in(env!("CARGO_TARGET_TMPDIR")).unwrap()
}

fn worker_config(base: &TempDir) -> Config {
    Config {
        frontend_socket: base.path().join("run/archived.sock"),
        run_dir: base.path().join("run"),
        local_dir: base.path().join("scratch"),
        batch_size: 2,
        max_threads: 2,
        max_retries: 2,
        join_timeout_ms: 10,
        tape_poll_floor_secs: 1,
        tape_poll_ceiling_secs: 1,
        ..Config::default()
    }
}

fn url(path: &Path) -> String {
    format!("{}/", path.display())
}

async fn make_tree(root: &Path, dirs: &[&str], files: &[(&str, &[u8])]) {
    tokio::fs::create_dir_all(root).await.unwrap();
    for d in dirs {
        tokio::fs::create_dir_all(root.join(d)).await.unwrap();
    }
    for (rel, content) in files {
        tokio::fs::write(root.join(rel), content).await.unwrap();
    }
}

async fn dir_entry(backend: &LocalFs, root_url: &str, rel: &str) -> DirEntry {
    let full = if rel == "./" {
        root_url.to_string()
    } else {
        format!("{}{}", root_url, rel)
    };
    let st = backend.stat(&full).await.unwrap();
    DirEntry {
        path: rel.to_string(),
        uid: st.uid.to_string(),
        gid: st.gid.to_string(),
        mode: format_mode(st.mode, true),
        attrs: BTreeMap::new(),
    }
}

async fn file_entry(backend: &LocalFs, root_url: &str, rel: &str) -> FileEntry {
    let full = format!("{}{}", root_url, rel);
    let st = backend.stat(&full).await.unwrap();
    let xs = if st.size == 0 {
        "0".to_string()
    } else {
        backend.checksum(&full, "adler").await.unwrap()
    };
    FileEntry {
        path: rel.to_string(),
        size: st.size,
        mtime: st.mtime,
        ctime: st.ctime,
        uid: st.uid.to_string(),
        gid: st.gid.to_string(),
        mode: format_mode(st.mode, false),
        xs_type: "adler".to_string(),
        xs,
    }
}

/// Record the given tree into a manifest file. Entries are statted from
/// `stat_url`, the side currently holding the data.
async fn record_manifest(
    backend: &LocalFs,
    disk_url: &str,
    tape_url: &str,
    stat_url: &str,
    dirs: &[&str],
    files: &[&str],
    out: &Path,
) {
    let mut builder = ManifestBuilder::new(disk_url, tape_url);
    for d in dirs {
        let entry = dir_entry(backend, stat_url, d).await;
        builder.add_dir(entry);
    }
    for f in files {
        let entry = file_entry(backend, stat_url, f).await;
        builder.add_file(entry);
    }
    builder.write_to(out).unwrap();
}

fn request(cmd: OpKind, src: &Path, opt: RequestOption) -> TransferRequest {
    TransferRequest {
        cmd,
        src: src.display().to_string(),
        opt,
        arg: String::new(),
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
    }
}

async fn run_transfer(req: &TransferRequest, config: &Config) -> archived::ArchiveResult<()> {
    config.ensure_directories().await.unwrap();
    let mut transfer = Transfer::new(req, config.clone(), Arc::new(LocalFs::new()))?;
    // Workers log into this file; tests stand in for the subscriber.
    std::fs::write(transfer.log_file(), b"").unwrap();
    transfer.execute().await
}

#[tokio::test]
async fn test_put_transfer_end_to_end() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    tokio::fs::create_dir_all(base.path().join("tape")).await?;
    make_tree(
        &disk_root,
        &["sub"],
        &[("x.txt", &[b'A'; 1024][..]), ("sub/y.txt", b"payload-y")],
    )
    .await;

    let manifest_path = disk_root.join(".archive.init");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&disk_root),
        &["./", "sub/"],
        &["x.txt", "sub/y.txt"],
        &manifest_path,
    )
    .await;

    let config = worker_config(&base);
    run_transfer(
        &request(OpKind::Put, &manifest_path, RequestOption::None),
        &config,
    )
    .await?;

    // Data landed on tape with the booked size and checksum.
    let x_stat = backend.stat(&format!("{}x.txt", url(&tape_root))).await.unwrap();
    assert_eq!(x_stat.size, 1024);
    let x_src_xs = backend
        .checksum(&format!("{}x.txt", url(&disk_root)), "adler")
        .await
        .unwrap();
    let x_dst_xs = backend
        .checksum(&format!("{}x.txt", url(&tape_root)), "adler")
        .await
        .unwrap();
    assert_eq!(x_src_xs, x_dst_xs);
    assert!(tape_root.join("sub/y.txt").exists());

    // Initial put ships the manifest itself to tape.
    assert!(tape_root.join(".archive.init").exists());

    // Terminal rename and log shuttling on the disk side.
    assert!(disk_root.join(".archive.put.done").exists());
    assert!(!manifest_path.exists());
    assert!(disk_root.join(".archive.log").exists());

    // Scratch files are cleared.
    let uuid = archived::protocol::transfer_uuid(&archived::protocol::root_path(&url(&disk_root)));
    assert!(!config.op_dir(OpKind::Put).join(format!("{}.tx", uuid)).exists());
    assert!(!config.op_dir(OpKind::Put).join(format!("{}.ps", uuid)).exists());
    Ok(())
}

#[tokio::test]
async fn test_put_rejects_existing_destination_root() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    make_tree(&disk_root, &[], &[("x.txt", b"data")]).await;
    make_tree(&tape_root, &[], &[]).await; // pre-existing archive

    let manifest_path = disk_root.join(".archive");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&disk_root),
        &["./"],
        &["x.txt"],
        &manifest_path,
    )
    .await;

    let config = worker_config(&base);
    let err = run_transfer(
        &request(OpKind::Put, &manifest_path, RequestOption::None),
        &config,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ArchiveError::RootPrecondition { .. }));
    // Finalized as failed: the record keeps its .err name.
    assert!(disk_root.join(".archive.put.err").exists());
    Ok(())
}

#[tokio::test]
async fn test_get_transfer_restores_tree_and_metadata() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    make_tree(
        &tape_root,
        &["sub"],
        &[("x.txt", b"from-tape"), ("sub/y.txt", b"nested"), ("empty.bin", b"")],
    )
    .await;
    // The get destination holds only the manifest file.
    make_tree(&disk_root, &[], &[]).await;

    let manifest_path = disk_root.join(".archive");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&tape_root),
        &["./", "sub/"],
        &["x.txt", "sub/y.txt", "empty.bin"],
        &manifest_path,
    )
    .await;

    let config = worker_config(&base);
    run_transfer(
        &request(OpKind::Get, &manifest_path, RequestOption::None),
        &config,
    )
    .await?;

    assert_eq!(tokio::fs::read(disk_root.join("x.txt")).await?, b"from-tape");
    assert_eq!(tokio::fs::read(disk_root.join("sub/y.txt")).await?, b"nested");
    assert!(disk_root.join("empty.bin").exists());
    assert!(disk_root.join(".archive.get.done").exists());

    // Recorded timestamps were propagated to the restored files.
    let recorded = file_entry(&backend, &url(&tape_root), "x.txt").await;
    let restored = backend.stat(&format!("{}x.txt", url(&disk_root))).await.unwrap();
    assert_eq!(restored.mtime, recorded.mtime);
    assert_eq!(restored.ctime, recorded.ctime);
    Ok(())
}

#[tokio::test]
async fn test_get_rejects_non_empty_destination_root() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    make_tree(&tape_root, &[], &[("x.txt", b"t")]).await;
    // Destination root holds unrelated data next to the manifest.
    make_tree(&disk_root, &["leftover"], &[]).await;

    let manifest_path = disk_root.join(".archive");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&tape_root),
        &["./"],
        &["x.txt"],
        &manifest_path,
    )
    .await;

    let config = worker_config(&base);
    let err = run_transfer(
        &request(OpKind::Get, &manifest_path, RequestOption::None),
        &config,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ArchiveError::RootPrecondition { .. }));
    Ok(())
}

#[tokio::test]
async fn test_verifier_finds_single_corrupted_entry() -> Result<()> {
    let base = scratch();
    let backend = Arc::new(LocalFs::new());

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    make_tree(
        &disk_root,
        &[],
        &[("f0", b"zero"), ("f1", b"one"), ("f2", b"two"), ("f3", b"three")],
    )
    .await;

    let manifest_path = base.path().join(".archive.tx");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&disk_root),
        &["./"],
        &["f0", "f1", "f2", "f3"],
        &manifest_path,
    )
    .await;

    // Materialize the tape side, then corrupt entry f2 (wrong size).
    make_tree(
        &tape_root,
        &[],
        &[("f0", b"zero"), ("f1", b"one"), ("f2", b"two-corrupted"), ("f3", b"three")],
    )
    .await;

    let manifest = Manifest::open(&manifest_path, true)?;
    let verifier = Verifier::new(&manifest, backend.clone(), false);

    let (ok, failed) = verifier.verify_all(false, CheckScope::TransferOnly).await?;
    assert!(!ok);
    assert_eq!(failed.len(), 1, "fail-fast returns the first failure alone");
    assert_eq!(failed[0].path(), "f2");
    Ok(())
}

#[tokio::test]
async fn test_verifier_best_effort_collects_all_failures() -> Result<()> {
    let base = scratch();
    let backend = Arc::new(LocalFs::new());

    let dst_root = base.path().join("dst/a");
    let src_root = base.path().join("src/a");
    make_tree(
        &dst_root,
        &[],
        &[("f0", b"a"), ("f1", b"b"), ("f2", b"c"), ("f3", b"d"), ("f4", b"e")],
    )
    .await;

    // Record the manifest from the destination so everything matches,
    // then corrupt entries f1 and f3.
    let manifest_path = base.path().join(".backup.tx");
    record_manifest(
        &backend,
        &url(&dst_root),
        &url(&src_root),
        &url(&dst_root),
        &["./"],
        &["f0", "f1", "f2", "f3", "f4"],
        &manifest_path,
    )
    .await;
    tokio::fs::write(dst_root.join("f1"), b"grown-longer").await?;
    tokio::fs::write(dst_root.join("f3"), b"also-grown").await?;

    let manifest = Manifest::open(&manifest_path, false)?;
    let verifier = Verifier::new(&manifest, backend.clone(), true);

    let (ok, failed) = verifier.verify_all(true, CheckScope::TransferOnly).await?;
    assert!(!ok);
    let paths: Vec<_> = failed.iter().map(|e| e.path().to_string()).collect();
    assert_eq!(paths, vec!["f1", "f3"], "scan continues past the first failure");
    Ok(())
}

#[tokio::test]
async fn test_retry_resumes_from_checkpoint_without_recopying() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    make_tree(
        &disk_root,
        &[],
        &[("f0", b"zero-payload"), ("f1", b"one-payload"), ("f2", b"two-payload")],
    )
    .await;

    let manifest_path = disk_root.join(".archive");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&disk_root),
        &["./"],
        &["f0", "f1", "f2"],
        &manifest_path,
    )
    .await;

    // Simulate an interrupted put: f0 arrived intact, f1 was truncated
    // mid-copy, f2 never landed correctly either.
    make_tree(
        &tape_root,
        &[],
        &[("f0", b"zero-payload"), ("f1", b"one-"), ("f2", b"two-payload")],
    )
    .await;

    // Stamp f0 so a fresh copy over it would be detectable.
    let marker = "7777777.0";
    backend
        .utimes(&format!("{}f0", url(&tape_root)), "", marker)
        .await
        .unwrap();

    let config = worker_config(&base);
    run_transfer(
        &request(OpKind::Put, &manifest_path, RequestOption::Retry),
        &config,
    )
    .await?;

    // f1 was recopied from the checkpoint onward; f0 was skipped.
    assert_eq!(tokio::fs::read(tape_root.join("f1")).await?, b"one-payload");
    let f0_stat = backend.stat(&format!("{}f0", url(&tape_root))).await.unwrap();
    assert_eq!(f0_stat.mtime, marker, "entries before the checkpoint are not recopied");

    // f2 sits after the checkpoint, so it was reprocessed: the booked
    // metadata from the manifest was applied to it.
    let recorded_f2 = file_entry(&backend, &url(&disk_root), "f2").await;
    let f2_stat = backend.stat(&format!("{}f2", url(&tape_root))).await.unwrap();
    assert_eq!(f2_stat.mtime, recorded_f2.mtime);

    assert!(disk_root.join(".archive.put.done").exists());
    Ok(())
}

#[tokio::test]
async fn test_retry_with_nothing_wrong_is_a_distinguished_noop() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    make_tree(&disk_root, &[], &[("f0", b"payload")]).await;

    let manifest_path = disk_root.join(".archive");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&disk_root),
        &["./"],
        &["f0"],
        &manifest_path,
    )
    .await;

    // The tape side is already complete and correct.
    make_tree(&tape_root, &[], &[("f0", b"payload")]).await;

    let config = worker_config(&base);
    let err = run_transfer(
        &request(OpKind::Put, &manifest_path, RequestOption::Retry),
        &config,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ArchiveError::NothingToDo));
    assert_eq!(err.exit_code(), 0);
    // Still routed through the success finalize path.
    assert!(disk_root.join(".archive.put.done").exists());
    Ok(())
}

#[tokio::test]
async fn test_purge_prunes_disk_copies_and_keeps_root() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    make_tree(&disk_root, &["sub"], &[("x.txt", b"x"), ("sub/y.txt", b"y")]).await;
    make_tree(&tape_root, &["sub"], &[("x.txt", b"x"), ("sub/y.txt", b"y")]).await;

    let manifest_path = disk_root.join(".archive");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&disk_root),
        &["./", "sub/"],
        &["x.txt", "sub/y.txt"],
        &manifest_path,
    )
    .await;

    let config = worker_config(&base);
    run_transfer(
        &request(OpKind::Purge, &manifest_path, RequestOption::None),
        &config,
    )
    .await?;

    // Disk copies pruned, root preserved, tape untouched.
    assert!(!disk_root.join("x.txt").exists());
    assert!(!disk_root.join("sub").exists());
    assert!(disk_root.exists());
    assert!(disk_root.join(".archive.purge.done").exists());
    assert!(tape_root.join("x.txt").exists());
    assert!(tape_root.join("sub/y.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_delete_removes_tape_copies_and_record() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let disk_root = base.path().join("disk/a");
    let tape_root = base.path().join("tape/a");
    make_tree(&disk_root, &[], &[]).await;
    make_tree(&tape_root, &["sub"], &[("x.txt", b"x"), ("sub/y.txt", b"y")]).await;
    // The manifest copy shipped at initial put.
    tokio::fs::write(tape_root.join(".archive.init"), b"{}").await?;

    let manifest_path = disk_root.join(".archive");
    record_manifest(
        &backend,
        &url(&disk_root),
        &url(&tape_root),
        &url(&tape_root),
        &["./", "sub/"],
        &["x.txt", "sub/y.txt"],
        &manifest_path,
    )
    .await;

    let config = worker_config(&base);
    run_transfer(
        &request(OpKind::Delete, &manifest_path, RequestOption::None),
        &config,
    )
    .await?;

    // Tape data gone, including the root and the shipped manifest copy.
    assert!(!tape_root.exists());
    // A fully deleted archive leaves no terminal record behind.
    assert!(!disk_root.join(".archive.delete.done").exists());
    assert!(!disk_root.join(".archive.delete.err").exists());
    Ok(())
}

#[tokio::test]
async fn test_backup_is_best_effort_and_writes_summary() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    // Backups flow like tape→disk: source is the tape-side URL.
    let dst_root = base.path().join("mirror/a");
    let src_root = base.path().join("origin/a");
    make_tree(
        &src_root,
        &[],
        &[("f0", b"keep-zero"), ("f1", b"keep-one"), ("f2", b"keep-two")],
    )
    .await;
    make_tree(&dst_root, &[], &[]).await;

    let manifest_path = dst_root.join(".backup");
    record_manifest(
        &backend,
        &url(&dst_root),
        &url(&src_root),
        &url(&src_root),
        &["./"],
        &["f0", "f1", "f2"],
        &manifest_path,
    )
    .await;

    // Remove one source file after recording: its copy fails, the rest
    // must still be mirrored.
    tokio::fs::remove_file(src_root.join("f1")).await?;

    let config = worker_config(&base);
    let result = run_transfer(
        &request(OpKind::Backup, &manifest_path, RequestOption::None),
        &config,
    )
    .await;

    // Partial success: the operation itself does not abort.
    assert!(result.is_ok());
    assert_eq!(tokio::fs::read(dst_root.join("f0")).await?, b"keep-zero");
    assert_eq!(tokio::fs::read(dst_root.join("f2")).await?, b"keep-two");
    assert!(!dst_root.join("f1").exists());

    // The summary enumerates exactly the failed entry.
    let summary = dst_root.join(".backup.err.1");
    assert!(summary.exists());
    let body = tokio::fs::read_to_string(&summary).await?;
    assert!(body.contains("Failed entry=f1"));
    Ok(())
}

#[tokio::test]
async fn test_backup_time_window_filters_entries() -> Result<()> {
    let base = scratch();
    let backend = LocalFs::new();

    let dst_root = base.path().join("mirror/a");
    let src_root = base.path().join("origin/a");
    make_tree(&src_root, &[], &[("old.txt", b"old"), ("new.txt", b"new")]).await;
    make_tree(&dst_root, &[], &[]).await;

    // Age one file far below the cutoff.
    backend
        .utimes(&format!("{}old.txt", url(&src_root)), "", "1000.0")
        .await
        .unwrap();

    let manifest_path = dst_root.join(".backup");
    let mut builder = ManifestBuilder::new(&url(&dst_root), &url(&src_root)).time_window("mtime", 2000);
    builder.add_dir(dir_entry(&backend, &url(&src_root), "./").await);
    builder.add_file(file_entry(&backend, &url(&src_root), "old.txt").await);
    builder.add_file(file_entry(&backend, &url(&src_root), "new.txt").await);
    builder.write_to(&manifest_path).unwrap();

    let config = worker_config(&base);
    run_transfer(
        &request(OpKind::Backup, &manifest_path, RequestOption::None),
        &config,
    )
    .await?;

    // Only the entry inside the window was mirrored, and the stale one
    // did not count as a failure.
    assert!(dst_root.join("new.txt").exists());
    assert!(!dst_root.join("old.txt").exists());
    assert!(dst_root.join(".backup.done").exists());
    Ok(())
}
