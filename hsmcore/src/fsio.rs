// hsmcore is the cryptographic core shared by the HSM dispatcher and the
// static channel backup engine of a Lightning-style payment node.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Crash-atomic file writing.
//!
//! Both the seed store and the SCB engine replace a file by writing a
//! sibling temporary, `fsync`ing it, `fsync`ing the containing directory,
//! and renaming over the target — the pattern `hsmd.c`'s
//! `maybe_create_new_hsm` and `chanbackup.c`'s `maybe_create_new_scb` /
//! `update_scb` both use. Collected here so both callers share one
//! implementation instead of three slightly different copies.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Creates `path` exclusively (fails if it already exists) with `mode`,
/// writes `data`, then `fsync`s the file and its containing directory.
///
/// Returns `Ok(false)` without writing anything if `path` already exists
/// (mirrors `maybe_create_new_hsm`'s EEXIST-silent-return).
pub fn create_new_exclusive(path: &Path, mode: u32, data: &[u8]) -> std::io::Result<bool> {
    let mut f = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };

    f.write_all(data)?;
    f.sync_all()?;
    drop(f);

    fsync_parent_dir(path)?;

    Ok(true)
}

/// Atomically replaces `path` with `data`: writes to the sibling
/// `path.with_extension(tmp_suffix)`, `fsync`s it, `fsync`s the directory,
/// then `rename`s over `path`.
pub fn atomic_replace(path: &Path, tmp_path: &Path, mode: u32, data: &[u8]) -> std::io::Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(tmp_path)?;

    f.write_all(data)?;
    f.sync_all()?;
    drop(f);

    fsync_parent_dir(tmp_path)?;

    fs::rename(tmp_path, path)?;

    fsync_parent_dir(path)
}

/// Removes `path` if present, ignoring a not-found error. Used to clean
/// up a leftover temporary file from a previous crash at startup.
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn fsync_parent_dir(path: &Path) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let dir = dir.unwrap_or_else(|| Path::new("."));

    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn tmp_dir() -> std::path::PathBuf {
        let mut dir = env::temp_dir();
        dir.push(format!("hsmcore-fsio-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn create_new_exclusive_refuses_to_overwrite() {
        let dir = tmp_dir();
        let path = dir.join("exclusive_refuse");
        fs::remove_file(&path).ok();

        assert!(create_new_exclusive(&path, 0o400, b"first").unwrap());
        assert!(!create_new_exclusive(&path, 0o400, b"second").unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"first");

        fs::remove_file(&path).ok();
    }

    #[test]
    fn atomic_replace_leaves_no_temp_file() {
        let dir = tmp_dir();
        let path = dir.join("replace_target");
        let tmp_path = dir.join("replace_target.tmp");
        fs::remove_file(&path).ok();
        fs::remove_file(&tmp_path).ok();

        atomic_replace(&path, &tmp_path, 0o400, b"payload").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"payload");
        assert!(!tmp_path.exists());

        fs::remove_file(&path).ok();
    }
}
