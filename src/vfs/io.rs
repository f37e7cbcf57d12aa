//! Host filesystem primitives: blocking reads, staged atomic writes, stats.
//!
//! Everything here operates on already-resolved disk paths; mount handling
//! lives in the layer above.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::alloc::AllocatorRef;
use crate::blob::{Blob, GrowPolicy};

use super::{FileInfo, PathKind, VfsFlags};

/// Read a whole file into a blob carved from `alloc`. The `TEXT_FILE` flag
/// appends a trailing NUL. Failures return an empty blob and a log line.
pub(super) fn disk_read(path: &str, flags: VfsFlags, alloc: AllocatorRef) -> Blob {
    let mut blob = Blob::with_allocator(alloc).with_grow_policy(GrowPolicy::Multiply);

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            log::debug!("open '{}' failed: {}", path, err);
            return blob;
        }
    };

    let size = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
    if size > 0 {
        let extra = if flags.contains(VfsFlags::TEXT_FILE) { 1 } else { 0 };
        blob.reserve(size + extra);

        let mut chunk = [0u8; 64 * 1024];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    blob.write(&chunk[..n]);
                }
                Err(err) => {
                    log::warn!("reading '{}' failed: {}", path, err);
                    blob.free();
                    return blob;
                }
            }
        }
        if flags.contains(VfsFlags::TEXT_FILE) {
            blob.write_u8(0);
        }
    }
    blob
}

/// Write a blob to disk. Returns bytes written, zero on failure.
///
/// The write is staged to a temp file in the destination directory and moved
/// over the target on success, so a crash mid-write leaves the original
/// untouched. If the staging file cannot be created the write falls back to a
/// direct (non-atomic) write. `APPEND` writes directly.
pub(super) fn disk_write(path: &str, flags: VfsFlags, data: &[u8]) -> u64 {
    let target = Path::new(path);

    if flags.contains(VfsFlags::CREATE_DIRS) {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                if let Err(err) = std::fs::create_dir_all(parent) {
                    log::warn!("creating directories for '{}' failed: {}", path, err);
                    return 0;
                }
            }
        }
    }

    if flags.contains(VfsFlags::APPEND) {
        return match OpenOptions::new().create(true).append(true).open(target) {
            Ok(mut file) => match file.write_all(data) {
                Ok(()) => data.len() as u64,
                Err(err) => {
                    log::warn!("appending to '{}' failed: {}", path, err);
                    0
                }
            },
            Err(err) => {
                log::warn!("opening '{}' for append failed: {}", path, err);
                0
            }
        };
    }

    let staging_dir = target.parent().filter(|p| !p.as_os_str().is_empty());
    let staged = staging_dir.and_then(|dir| tempfile::NamedTempFile::new_in(dir).ok());

    match staged {
        Some(mut staging) => {
            if let Err(err) = staging.write_all(data) {
                log::warn!("writing staging file for '{}' failed: {}", path, err);
                return 0;
            }
            match staging.persist(target) {
                Ok(_) => data.len() as u64,
                Err(err) => {
                    log::warn!("moving staging file over '{}' failed: {}", path, err.error);
                    0
                }
            }
        }
        None => {
            log::warn!("making temp file failed: {}", path);
            match std::fs::write(target, data) {
                Ok(()) => data.len() as u64,
                Err(err) => {
                    log::warn!("writing '{}' failed: {}", path, err);
                    0
                }
            }
        }
    }
}

/// Stat a disk path into the wire-friendly [`FileInfo`] form.
pub(super) fn disk_info(path: &str) -> FileInfo {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let kind = if meta.is_dir() {
                PathKind::Directory
            } else {
                PathKind::File
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            FileInfo {
                kind,
                size: meta.len(),
                mtime,
            }
        }
        Err(_) => FileInfo::invalid(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::heap;

    #[test]
    fn test_read_missing_file_is_empty() {
        let blob = disk_read("/definitely/not/here.bin", VfsFlags::NONE, heap());
        assert!(!blob.is_valid());
        assert_eq!(blob.size(), 0);
    }

    #[test]
    fn test_read_and_text_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.bin");
        std::fs::write(&path, (0u8..12).collect::<Vec<_>>()).unwrap();
        let path = path.to_string_lossy().into_owned();

        let blob = disk_read(&path, VfsFlags::NONE, heap());
        assert_eq!(blob.size(), 12);
        assert_eq!(blob.data(), &(0u8..12).collect::<Vec<_>>()[..]);

        let text = disk_read(&path, VfsFlags::TEXT_FILE, heap());
        assert_eq!(text.size(), 13);
        assert_eq!(text.data()[12], 0);
    }

    #[test]
    fn test_write_creates_directory_chain() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new/sub/file.bin");
        let written = disk_write(
            &target.to_string_lossy(),
            VfsFlags::CREATE_DIRS,
            &[1, 2, 3, 4],
        );
        assert_eq!(written, 4);
        assert_eq!(std::fs::read(&target).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.bin");
        std::fs::write(&target, b"old").unwrap();

        let written = disk_write(&target.to_string_lossy(), VfsFlags::NONE, b"newcontent");
        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&target).unwrap(), b"newcontent");
        // No staging files left behind.
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_failed_rename_leaves_target_untouched() {
        // A target that is a directory makes the final rename fail, standing
        // in for a crash between the staged write and the move.
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("occupied");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("inner.bin"), b"keep").unwrap();

        let written = disk_write(&target.to_string_lossy(), VfsFlags::NONE, b"clobber");
        assert_eq!(written, 0);
        assert_eq!(std::fs::read(target.join("inner.bin")).unwrap(), b"keep");
    }

    #[test]
    fn test_append() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("log.txt");
        disk_write(&target.to_string_lossy(), VfsFlags::NONE, b"one");
        disk_write(&target.to_string_lossy(), VfsFlags::APPEND, b"two");
        assert_eq!(std::fs::read(&target).unwrap(), b"onetwo");
    }

    #[test]
    fn test_info() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("f.bin");
        std::fs::write(&target, b"12345").unwrap();

        let info = disk_info(&target.to_string_lossy());
        assert_eq!(info.kind, PathKind::File);
        assert_eq!(info.size, 5);
        assert!(info.mtime > 0);

        let dir_info = disk_info(&dir.path().to_string_lossy());
        assert_eq!(dir_info.kind, PathKind::Directory);

        let missing = disk_info("/definitely/not/here");
        assert_eq!(missing.kind, PathKind::Invalid);
    }
}
