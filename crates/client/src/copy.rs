//! Copy orchestration.
//!
//! Transfers land in a `.cfnew` staging file next to the destination; the
//! previous destination is displaced to `.cfsaved` and restored if the
//! staged copy turns out short or corrupt. Hard-link topology is
//! preserved within one recursive descent, sparseness survives via the
//! hole-eliding writer, and with purging enabled the destination
//! converges to exactly the source's file set.

use crate::connection::AgentConnection;
use crate::error::{ClientError, ClientResult};
use crate::hardlink::HardLinkCache;
use crate::protocol::{self, RemoteFileType, StatType, SyntheticStat, DEFAULT_BLOCK_SIZE};
use crate::sparse::SparseWriter;
use crate::statcache::StatCache;
use converge_core::canonify::canonify;
use converge_core::classes::ClassStore;
use converge_core::constants::{NEW_SUFFIX, SAVED_SUFFIX};
use converge_core::promise::{BackupPolicy, CompareMethod, CopyAttributes};
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How a converged file came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Content was transferred into place
    Copied,
    /// The destination was hard-linked to an earlier copy of the inode
    Linked,
}

/// Per-directory convergence counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    /// Files whose content was (re)copied
    pub copied: usize,
    /// Files already up to date
    pub kept: usize,
    /// Destination files removed because the source lacks them
    pub purged: usize,
    /// Files that could not be converged
    pub failed: usize,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Copies one regular file into place. `conn` is `None` for a local
/// source. The source stat must be fresh; the transferred size is
/// verified against it before installation.
pub fn copy_regular_file(
    mut conn: Option<&mut AgentConnection>,
    source: &str,
    dest: &Path,
    source_stat: &SyntheticStat,
    attrs: &CopyAttributes,
    hardlinks: &mut HardLinkCache,
) -> ClientResult<CopyOutcome> {
    // Preserve hard links: later names of a known inode link to the first
    if source_stat.nlink > 1 {
        if let Some(first) = hardlinks.first_destination(source_stat.dev, source_stat.ino) {
            if first != dest {
                let first = first.to_path_buf();
                info!(
                    dest = %dest.display(),
                    root = %first.display(),
                    "linking to preserve hard-link structure"
                );
                let _ = std::fs::remove_file(dest);
                std::fs::hard_link(&first, dest).map_err(|e| ClientError::Io {
                    operation: format!("hard link {}", dest.display()),
                    reason: e.to_string(),
                })?;
                return Ok(CopyOutcome::Linked);
            }
        } else {
            hardlinks.register(source_stat.dev, source_stat.ino, dest);
        }
    }

    if let Some(c) = &conn {
        if c.error {
            return Err(ClientError::ConnectionUnusable {
                server: c.server_name.clone(),
            });
        }
    }

    let staging = with_suffix(dest, NEW_SUFFIX);
    // Remove any stale staging file to avoid link attacks
    let _ = std::fs::remove_file(&staging);

    let preserve_holes = conn.is_none() || source_stat.makeholes;
    let mut writer = SparseWriter::create(&staging, preserve_holes)?;

    let transfer = match &mut conn {
        Some(c) => {
            if attrs.encrypt {
                protocol::get_file_encrypted(
                    c,
                    source,
                    source_stat.size,
                    &mut writer,
                    DEFAULT_BLOCK_SIZE,
                )
            } else {
                protocol::get_file(c, source, source_stat.size, &mut writer, DEFAULT_BLOCK_SIZE)
            }
        }
        None => stream_local_file(Path::new(source), &mut writer),
    };
    if let Err(e) = transfer {
        let _ = std::fs::remove_file(&staging);
        return Err(e);
    }
    writer.finish()?;

    install_staged(conn, source, dest, &staging, source_stat, attrs)?;
    Ok(CopyOutcome::Copied)
}

/// Displaces the old destination, verifies the staged file, and renames
/// it into place; on verification failure the old destination is put back
fn install_staged(
    conn: Option<&mut AgentConnection>,
    source: &str,
    dest: &Path,
    staging: &Path,
    source_stat: &SyntheticStat,
    attrs: &CopyAttributes,
) -> ClientResult<()> {
    let discard_backup = attrs.backup == BackupPolicy::NoBackup;
    let backup = match attrs.backup {
        BackupPolicy::Timestamp => {
            let stamp = format!("_{}", unix_now());
            with_suffix(&with_suffix(dest, &stamp), SAVED_SUFFIX)
        }
        _ => with_suffix(dest, SAVED_SUFFIX),
    };

    let mut backup_ok = false;
    if discard_backup {
        // Mainly important if there is a directory in the way
        if let Ok(meta) = std::fs::metadata(dest) {
            if meta.is_dir() {
                info!(dest = %dest.display(), "removing directory in the way of copy");
                let _ = std::fs::remove_dir_all(dest);
            }
        }
    } else {
        if let Ok(meta) = std::fs::symlink_metadata(&backup) {
            if meta.is_dir() {
                let _ = std::fs::remove_dir_all(&backup);
            } else {
                let _ = std::fs::remove_file(&backup);
            }
        }
        let _ = std::fs::rename(dest, &backup);
        backup_ok = std::fs::symlink_metadata(&backup).is_ok();
    }

    let rollback = |staging: &Path| {
        if backup_ok {
            let _ = std::fs::rename(&backup, dest);
        }
        let _ = std::fs::remove_file(staging);
    };

    let staged_meta = std::fs::symlink_metadata(staging).map_err(|e| {
        rollback(staging);
        ClientError::Io {
            operation: format!("stat staged {}", staging.display()),
            reason: e.to_string(),
        }
    })?;
    if staged_meta.is_file() && staged_meta.len() != source_stat.size {
        warn!(
            staged = staged_meta.len(),
            announced = source_stat.size,
            dest = %dest.display(),
            "staged file seems corrupted in transit, aborting"
        );
        rollback(staging);
        return Err(ClientError::SizeMismatch {
            path: dest.display().to_string(),
            expected: source_stat.size,
            actual: staged_meta.len(),
        });
    }

    if attrs.verify {
        let verified = match conn {
            Some(conn) => {
                // The server compares against our digest of the staged file
                !protocol::compare_hash(conn, source, staging, attrs.encrypt)?
            }
            None => {
                protocol::local_file_md5(Path::new(source))
                    == protocol::local_file_md5(staging)
            }
        };
        if !verified {
            warn!(dest = %dest.display(), "staged file failed final verification");
            rollback(staging);
            return Err(ClientError::ChecksumMismatch {
                path: dest.display().to_string(),
            });
        }
    }

    if let Err(e) = std::fs::rename(staging, dest) {
        rollback(staging);
        return Err(ClientError::Io {
            operation: format!("install copy as {}", dest.display()),
            reason: e.to_string(),
        });
    }
    debug!(dest = %dest.display(), "copy installed");
    Ok(())
}

/// Streams a local file through the hole-eliding writer
fn stream_local_file(source: &Path, writer: &mut SparseWriter) -> ClientResult<()> {
    use std::io::Read;
    let mut file = std::fs::File::open(source).map_err(|e| ClientError::Io {
        operation: format!("open {}", source.display()),
        reason: e.to_string(),
    })?;
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf).map_err(|e| ClientError::Io {
            operation: format!("read {}", source.display()),
            reason: e.to_string(),
        })?;
        if n == 0 {
            return Ok(());
        }
        writer.write_block(&buf[..n])?;
    }
}

/// A synthetic stat of a local file, for the local copy path
pub fn local_stat(path: &Path) -> ClientResult<SyntheticStat> {
    let meta = std::fs::metadata(path).map_err(|e| ClientError::Io {
        operation: format!("stat {}", path.display()),
        reason: e.to_string(),
    })?;
    Ok(SyntheticStat {
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.len(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        ino: meta.ino(),
        nlink: meta.nlink(),
        dev: meta.dev(),
        makeholes: true,
        file_type: if meta.is_dir() {
            RemoteFileType::Dir
        } else {
            RemoteFileType::Regular
        },
    })
}

/// Removes destination entries that are not part of the source file set.
/// Refuses pathologically short directory names.
pub fn purge_local_files(dir: &Path, keep: &HashSet<String>) -> ClientResult<usize> {
    if dir.as_os_str().len() < 2 {
        return Err(ClientError::Io {
            operation: format!("purge {}", dir.display()),
            reason: "refusing, too dangerous".to_string(),
        });
    }

    let mut purged = 0;
    let entries = std::fs::read_dir(dir).map_err(|e| ClientError::Io {
        operation: format!("open {}", dir.display()),
        reason: e.to_string(),
    })?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if keep.contains(&name) {
            continue;
        }
        // Our own artifacts are not subject to purging
        if name.ends_with(SAVED_SUFFIX) || name.ends_with(NEW_SUFFIX) {
            continue;
        }
        let path = entry.path();
        info!(path = %path.display(), "purging file not in source");
        let removed = match entry.file_type() {
            Ok(t) if t.is_dir() => std::fs::remove_dir_all(&path),
            _ => std::fs::remove_file(&path),
        };
        match removed {
            Ok(()) => purged += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "couldn't purge"),
        }
    }
    Ok(purged)
}

/// Defines the `auto_<destination>` class after a successful repair, so
/// later promises can react to the change
pub fn auto_define_class(classes: &ClassStore, dest: &Path) {
    let class = format!("auto_{}", canonify(&dest.display().to_string()));
    info!(class = class.as_str(), "auto defining class");
    classes.define_soft(class);
}

/// Converges `dest_dir` to the content of the remote `source_dir`:
/// missing or differing files are copied, up-to-date files are left
/// alone, and with purging enabled files absent from the source are
/// removed. Subdirectories are descended while `attrs.depth` allows.
pub fn sync_directory(
    conn: &mut AgentConnection,
    cache: &mut StatCache,
    hardlinks: &mut HardLinkCache,
    source_dir: &str,
    dest_dir: &Path,
    attrs: &CopyAttributes,
    now: i64,
) -> ClientResult<SyncStats> {
    let mut stats = SyncStats::default();

    let names: Vec<String> = protocol::open_dir(conn, source_dir, attrs.encrypt)?
        .into_iter()
        .filter(|n| n != "." && n != "..")
        .collect();

    std::fs::create_dir_all(dest_dir).map_err(|e| ClientError::Io {
        operation: format!("create {}", dest_dir.display()),
        reason: e.to_string(),
    })?;

    for name in &names {
        let source_path = format!("{}/{}", source_dir.trim_end_matches('/'), name);
        let dest_path = dest_dir.join(name);

        let stat = match protocol::remote_stat(
            conn,
            cache,
            &source_path,
            StatType::File,
            attrs.encrypt,
            now,
        ) {
            Ok(stat) => stat,
            Err(e) => {
                warn!(path = source_path.as_str(), error = %e, "cannot stat source entry");
                stats.failed += 1;
                continue;
            }
        };

        match stat.file_type {
            RemoteFileType::Regular => {
                if needs_copy(conn, &source_path, &dest_path, &stat, attrs)? {
                    match copy_regular_file(
                        Some(&mut *conn),
                        &source_path,
                        &dest_path,
                        &stat,
                        attrs,
                        hardlinks,
                    ) {
                        Ok(_) => stats.copied += 1,
                        Err(e) => {
                            warn!(path = source_path.as_str(), error = %e, "copy failed");
                            stats.failed += 1;
                        }
                    }
                } else {
                    debug!(dest = %dest_path.display(), "file is an up to date copy of source");
                    stats.kept += 1;
                }
            }
            RemoteFileType::Dir => {
                if attrs.depth > 0 {
                    let mut sub_attrs = attrs.clone();
                    sub_attrs.depth -= 1;
                    let sub = sync_directory(
                        conn,
                        cache,
                        hardlinks,
                        &source_path,
                        &dest_path,
                        &sub_attrs,
                        now,
                    )?;
                    stats.copied += sub.copied;
                    stats.kept += sub.kept;
                    stats.purged += sub.purged;
                    stats.failed += sub.failed;
                }
            }
            other => {
                debug!(path = source_path.as_str(), ?other, "skipping special file");
            }
        }
    }

    if attrs.purge {
        let keep: HashSet<String> = names.into_iter().collect();
        stats.purged += purge_local_files(dest_dir, &keep)?;
    }

    Ok(stats)
}

/// Whether the destination needs the source copied over it
fn needs_copy(
    conn: &mut AgentConnection,
    source_path: &str,
    dest_path: &Path,
    stat: &SyntheticStat,
    attrs: &CopyAttributes,
) -> ClientResult<bool> {
    if attrs.force_update {
        return Ok(true);
    }
    let Ok(dest_meta) = std::fs::symlink_metadata(dest_path) else {
        return Ok(true);
    };
    match attrs.compare {
        CompareMethod::Exists => Ok(false),
        CompareMethod::Digest => {
            protocol::compare_hash(conn, source_path, dest_path, attrs.encrypt)
        }
        CompareMethod::Mtime => Ok(stat.mtime > dest_meta.mtime()),
        CompareMethod::Ctime => Ok(stat.ctime > dest_meta.ctime()),
        CompareMethod::Atime => {
            Ok(stat.mtime > dest_meta.mtime() || stat.ctime > dest_meta.ctime())
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).expect("source written");
        path
    }

    #[test]
    fn test_local_copy_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "src", b"configuration data");
        let dest = dir.path().join("dst");

        let stat = local_stat(&source).expect("source stats");
        let mut hardlinks = HardLinkCache::new();
        let outcome = copy_regular_file(
            None,
            &source.display().to_string(),
            &dest,
            &stat,
            &CopyAttributes::default(),
            &mut hardlinks,
        )
        .expect("copy succeeds");
        assert_eq!(outcome, CopyOutcome::Copied);
        assert_eq!(
            std::fs::read(&dest).expect("dest readable"),
            b"configuration data"
        );
    }

    #[test]
    fn test_local_sparse_copy_preserves_layout() {
        let dir = TempDir::new().expect("temp dir");
        let mut content = vec![0u8; 4096];
        content.extend_from_slice(&[b'x'; 4096]);
        content.extend_from_slice(&vec![0u8; 4096]);
        let source = write_source(dir.path(), "sparse_src", &content);
        let dest = dir.path().join("sparse_dst");

        let stat = local_stat(&source).expect("source stats");
        let mut hardlinks = HardLinkCache::new();
        copy_regular_file(
            None,
            &source.display().to_string(),
            &dest,
            &stat,
            &CopyAttributes::default(),
            &mut hardlinks,
        )
        .expect("copy succeeds");

        let meta = std::fs::metadata(&dest).expect("dest stats");
        assert_eq!(meta.len(), content.len() as u64);
        assert_eq!(std::fs::read(&dest).expect("dest readable"), content);
    }

    #[test]
    fn test_size_change_mid_copy_rolls_back() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "src", b"grown since the stat");
        let dest = dir.path().join("dst");
        std::fs::write(&dest, b"previous contents").expect("dest seeded");

        let mut stat = local_stat(&source).expect("source stats");
        // The announced size no longer matches what the stream will carry
        stat.size -= 5;

        let mut hardlinks = HardLinkCache::new();
        let err = copy_regular_file(
            None,
            &source.display().to_string(),
            &dest,
            &stat,
            &CopyAttributes::default(),
            &mut hardlinks,
        )
        .expect_err("short announcement must fail");
        assert!(matches!(err, ClientError::SizeMismatch { .. }));
        assert_eq!(
            std::fs::read(&dest).expect("dest restored"),
            b"previous contents"
        );
        assert!(!with_suffix(&dest, NEW_SUFFIX).exists());
    }

    #[test]
    fn test_backup_is_left_beside_destination() {
        let dir = TempDir::new().expect("temp dir");
        let source = write_source(dir.path(), "src", b"new");
        let dest = dir.path().join("dst");
        std::fs::write(&dest, b"old").expect("dest seeded");

        let stat = local_stat(&source).expect("source stats");
        let mut hardlinks = HardLinkCache::new();
        copy_regular_file(
            None,
            &source.display().to_string(),
            &dest,
            &stat,
            &CopyAttributes::default(),
            &mut hardlinks,
        )
        .expect("copy succeeds");

        assert_eq!(std::fs::read(&dest).expect("dest readable"), b"new");
        assert_eq!(
            std::fs::read(with_suffix(&dest, SAVED_SUFFIX)).expect("backup readable"),
            b"old"
        );
    }

    #[test]
    fn test_hard_link_topology_preserved() {
        let dir = TempDir::new().expect("temp dir");
        let source_a = write_source(dir.path(), "name_a", b"shared inode");
        let source_b = dir.path().join("name_b");
        std::fs::hard_link(&source_a, &source_b).expect("source links");

        let dest_a = dir.path().join("dst_a");
        let dest_b = dir.path().join("dst_b");
        let mut hardlinks = HardLinkCache::new();

        let stat_a = local_stat(&source_a).expect("stats");
        copy_regular_file(
            None,
            &source_a.display().to_string(),
            &dest_a,
            &stat_a,
            &CopyAttributes::default(),
            &mut hardlinks,
        )
        .expect("first copy succeeds");

        let stat_b = local_stat(&source_b).expect("stats");
        let outcome = copy_regular_file(
            None,
            &source_b.display().to_string(),
            &dest_b,
            &stat_b,
            &CopyAttributes::default(),
            &mut hardlinks,
        )
        .expect("second copy succeeds");
        assert_eq!(outcome, CopyOutcome::Linked);

        let meta_a = std::fs::metadata(&dest_a).expect("stats");
        let meta_b = std::fs::metadata(&dest_b).expect("stats");
        assert_eq!(meta_a.ino(), meta_b.ino());
        assert_eq!(meta_a.nlink(), 2);
    }

    #[test]
    fn test_purge_keeps_only_source_set() {
        let dir = TempDir::new().expect("temp dir");
        for name in ["a", "b", "c", "d", "e"] {
            std::fs::write(dir.path().join(name), name).expect("seeded");
        }
        let keep: HashSet<String> =
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let purged = purge_local_files(dir.path(), &keep).expect("purge works");
        assert_eq!(purged, 2);

        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .expect("readable")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_purge_refuses_short_paths() {
        let keep = HashSet::new();
        assert!(purge_local_files(Path::new("/"), &keep).is_err());
    }

    #[test]
    fn test_auto_define_class() {
        let classes = ClassStore::new();
        auto_define_class(&classes, Path::new("/etc/motd"));
        assert!(classes.is_defined("auto__etc_motd"));
    }
}
