// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Directory copy, mirror, size and content-hash helpers.
//!
//! All functions are blocking; async callers run them on
//! `tokio::task::spawn_blocking`.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Lock marker GRASS writes into an open mapset.
pub const GISLOCK: &str = ".gislock";

fn is_excluded(name: &std::ffi::OsStr, exclude: &[&str]) -> bool {
    exclude.iter().any(|ex| name == *ex)
}

/// Recursively copy `src` into `dst`, skipping entries named in `exclude`.
///
/// Symlinks are recreated, not followed. Returns the number of files copied.
pub fn copy_dir(src: &Path, dst: &Path, exclude: &[&str]) -> io::Result<u64> {
    let mut copied = 0;
    fs::create_dir_all(dst)?;
    let walker = WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_excluded(e.file_name(), exclude));
    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Make `dst` an exact copy of `src`: the destination is removed first, so
/// files deleted in `src` disappear from `dst` too.
pub fn mirror_dir(src: &Path, dst: &Path, exclude: &[&str]) -> io::Result<u64> {
    remove_dir_if_exists(dst)?;
    copy_dir(src, dst, exclude)
}

/// Merge the entries of `src` into `dst`, replacing entries of the same name.
///
/// Files are hard-linked when possible and copied otherwise.
pub fn merge_dir(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut merged = 0;
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            if target.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(&target)?;
            }
            fs::create_dir_all(&target)?;
            continue;
        }
        if target.symlink_metadata().is_ok() {
            if target.is_dir() && !target.is_symlink() {
                fs::remove_dir_all(&target)?;
            } else {
                fs::remove_file(&target)?;
            }
        }
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else if fs::hard_link(entry.path(), &target).is_err() {
            fs::copy(entry.path(), &target)?;
        }
        merged += 1;
    }
    Ok(merged)
}

/// Move a directory, falling back to copy and delete across filesystems.
///
/// Never merges: an existing `dst` is an `AlreadyExists` error.
pub fn move_dir(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.symlink_metadata().is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", dst.display()),
        ));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir(src, dst, &[])?;
            fs::remove_dir_all(src)
        }
    }
}

/// Remove a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Total size in bytes of the regular files below `path`.
pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut size = 0;
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            size += entry.metadata()?.len();
        }
    }
    Ok(size)
}

/// SHA-256 over the relative paths and contents of a tree, in sorted order.
///
/// Two trees hash equal exactly when they hold the same files with the same
/// bytes (entries named in `exclude` ignored).
pub fn tree_hash(path: &Path, exclude: &[&str]) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(path)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded(e.file_name(), exclude));
    for entry in walker {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let file_type = entry.file_type();
        let tag: &[u8] = if file_type.is_dir() {
            b"d"
        } else if file_type.is_symlink() {
            b"l"
        } else {
            b"f"
        };
        hasher.update(tag);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if file_type.is_symlink() {
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        } else if file_type.is_file() {
            let mut file = fs::File::open(entry.path())?;
            io::copy(&mut file, &mut hasher)?;
        }
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}
