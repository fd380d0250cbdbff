// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory streams and resumable packing of their entries

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::errno::Errno;
use reefs_proto::messages::write_dirent;

use crate::error::{ReefsError, ReefsResult};

/// One entry as produced by a directory stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDirEntry {
    pub name: Vec<u8>,
    pub d_type: u8,
    /// Stream position just after this entry
    pub cookie: i64,
}

/// Positionable sequence of directory entries
pub trait EntrySource {
    fn tell(&mut self) -> i64;
    fn seek(&mut self, cookie: i64);
    fn next_entry(&mut self) -> io::Result<Option<RawDirEntry>>;
}

/// Result of one `readdir` request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaddirOutcome {
    /// Bytes of packed records written to the output buffer
    Packed(usize),
    EndOfDirectory,
}

/// Pack as many entries as fit into `out`, skipping `.` and `..`.
///
/// An entry that does not fit is pushed back onto the stream so the next
/// call offers it again. If not even the first entry fits the call fails
/// with [`ReefsError::EntryTooLarge`] and the stream does not move.
pub fn pack_entries<S: EntrySource + ?Sized>(
    source: &mut S,
    out: &mut [u8],
) -> ReefsResult<ReaddirOutcome> {
    let mut written = 0usize;
    loop {
        let resume = source.tell();
        let entry = match source.next_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                if written == 0 {
                    return Err(err.into());
                }
                source.seek(resume);
                break;
            }
        };
        if entry.name == b"." || entry.name == b".." {
            continue;
        }
        match write_dirent(&mut out[written..], entry.cookie, entry.d_type, &entry.name) {
            Some(reclen) => written += reclen,
            None => {
                source.seek(resume);
                if written == 0 {
                    return Err(ReefsError::EntryTooLarge);
                }
                return Ok(ReaddirOutcome::Packed(written));
            }
        }
    }

    if written == 0 {
        Ok(ReaddirOutcome::EndOfDirectory)
    } else {
        Ok(ReaddirOutcome::Packed(written))
    }
}

/// Owned host directory stream (`DIR *`)
#[derive(Debug)]
pub struct DirStream {
    dir: NonNull<libc::DIR>,
}

// SAFETY: the stream is owned by a single value and never shared.
unsafe impl Send for DirStream {}

impl DirStream {
    pub fn open(path: &Path) -> io::Result<Self> {
        let c_path = CString::new(path.as_os_str().as_bytes())?;
        // SAFETY: `c_path` is a valid NUL-terminated string
        let dir = unsafe { libc::opendir(c_path.as_ptr()) };
        NonNull::new(dir)
            .map(|dir| Self { dir })
            .ok_or_else(io::Error::last_os_error)
    }

    /// Close the stream and report the host's result
    pub fn close(self) -> io::Result<()> {
        let dir = self.dir;
        std::mem::forget(self);
        // SAFETY: `dir` is live and no longer owned by anything else
        if unsafe { libc::closedir(dir.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl EntrySource for DirStream {
    fn tell(&mut self) -> i64 {
        // SAFETY: `self.dir` is a live stream
        unsafe { libc::telldir(self.dir.as_ptr()) as i64 }
    }

    fn seek(&mut self, cookie: i64) {
        // SAFETY: `self.dir` is a live stream; glibc tolerates unknown cookies
        unsafe { libc::seekdir(self.dir.as_ptr(), cookie as libc::c_long) }
    }

    fn next_entry(&mut self) -> io::Result<Option<RawDirEntry>> {
        // readdir signals errors only through errno
        Errno::clear();
        // SAFETY: `self.dir` is a live stream
        let entry = unsafe { libc::readdir(self.dir.as_ptr()) };
        if entry.is_null() {
            return match Errno::last_raw() {
                0 => Ok(None),
                errno => Err(io::Error::from_raw_os_error(errno)),
            };
        }
        // SAFETY: a non-null dirent stays valid until the next stream call
        let (name, d_type) = unsafe {
            let entry = &*entry;
            (
                CStr::from_ptr(entry.d_name.as_ptr()).to_bytes().to_vec(),
                entry.d_type,
            )
        };
        Ok(Some(RawDirEntry {
            name,
            d_type,
            cookie: self.tell(),
        }))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: `self.dir` is live; `close` forgets `self` before closing
        unsafe {
            libc::closedir(self.dir.as_ptr());
        }
    }
}
