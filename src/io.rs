//! # Positional Block I/O
//!
//! This module provides the narrow file-system contract the table consumes:
//! positional reads and writes of fixed-size blocks, durability barriers,
//! and the atomic-rename step of the commit protocol.
//!
//! ## Partial I/O
//!
//! `pread`/`pwrite` may transfer fewer bytes than requested or fail with
//! `EINTR`. Both cases are resumed at the remaining offset; a zero-length
//! read inside a block is surfaced as a storage fault (the block file must
//! never end mid-block).
//!
//! ## Rename Tolerance
//!
//! On NFS a rename can succeed on the server yet be reported as failed after
//! a server crash and retry. The rename helper therefore treats a failed
//! rename as successful when the source file is already gone; the source is
//! removed as part of the check since the caller wants it gone either way.

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use eyre::Result;

use crate::error::TableError;

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

/// Reads block `n` of the data file into `buf` (whose length is the block
/// size).
pub fn read_block(file: &File, block_size: usize, n: u32, buf: &mut [u8]) -> Result<()> {
    debug_assert_eq!(buf.len(), block_size);
    let mut offset = block_size as u64 * u64::from(n);
    let mut rest = &mut buf[..];
    while !rest.is_empty() {
        match pread(file, rest, offset) {
            Ok(0) => {
                return Err(TableError::storage(format!(
                    "error reading block {n}: got end of file"
                )))
            }
            Ok(m) => {
                rest = &mut rest[m..];
                offset += m as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TableError::storage(format!("error reading block {n}: {e}")))
            }
        }
    }
    Ok(())
}

/// Writes `buf` as block `n` of the data file.
pub fn write_block(file: &File, block_size: usize, n: u32, buf: &[u8]) -> Result<()> {
    debug_assert_eq!(buf.len(), block_size);
    let mut offset = block_size as u64 * u64::from(n);
    let mut rest = buf;
    while !rest.is_empty() {
        match pwrite(file, rest, offset) {
            Ok(0) => {
                return Err(TableError::storage(format!(
                    "error writing block {n}: wrote no data"
                )))
            }
            Ok(m) => {
                rest = &rest[m..];
                offset += m as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TableError::storage(format!("error writing block {n}: {e}")))
            }
        }
    }
    Ok(())
}

/// Flushes file contents and metadata to stable storage.
pub fn sync(file: &File) -> Result<()> {
    file.sync_all()
        .map_err(|e| TableError::storage(format!("fsync failed: {e}")))
}

/// Removes `path`, reporting only whether the file existed. Other failures
/// (permissions, a directory in the way) are swallowed: the callers want the
/// name gone and cannot act on the failure anyway.
pub fn unlink_tolerant(path: &Path) -> bool {
    std::fs::remove_file(path).is_ok()
}

/// Renames `from` over `to`, treating an already-vanished source as success.
pub fn rename_base(from: &Path, to: &Path) -> Result<()> {
    if let Err(rename_err) = std::fs::rename(from, to) {
        // The source surviving the failed rename means the new base is not
        // in place; report. If it is gone, assume an NFS-style retried
        // rename that actually succeeded.
        match std::fs::remove_file(from) {
            Ok(()) => {
                return Err(TableError::storage(format!(
                    "couldn't update base file {}: {rename_err}",
                    to.display()
                )))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(_) => {
                return Err(TableError::storage(format!(
                    "couldn't update base file {}: {rename_err}",
                    to.display()
                )))
            }
        }
    }
    Ok(())
}
