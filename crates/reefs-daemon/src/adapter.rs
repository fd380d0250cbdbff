// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host filesystem operations behind the REEFS command set
//!
//! Every path goes through [`ConfinedRoot::resolve`]; files and directory
//! streams are only reachable through handles issued by this adapter.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::IntoRawFd;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use tracing::debug;

use crate::confine::{ConfinedPath, ConfinedRoot};
use crate::dirent::{DirStream, EntrySource, ReaddirOutcome, pack_entries};
use crate::error::{ReefsError, ReefsResult};
use crate::handles::{DEFAULT_HANDLE_CAPACITY, HandleTable};

/// Mode of files created on behalf of the secure side
pub const FILE_CREATE_MODE: u32 = 0o600;
/// Mode of parent directories created implicitly by `open`
pub const PARENT_DIR_MODE: u32 = 0o700;

pub struct FsAdapter {
    root: ConfinedRoot,
    files: HandleTable<File>,
    dirs: HandleTable<DirStream>,
}

impl FsAdapter {
    pub fn new(root: ConfinedRoot) -> Self {
        Self::with_capacity(root, DEFAULT_HANDLE_CAPACITY, DEFAULT_HANDLE_CAPACITY)
    }

    pub fn with_capacity(root: ConfinedRoot, max_files: usize, max_dirs: usize) -> Self {
        Self {
            root,
            files: HandleTable::new(max_files),
            dirs: HandleTable::new(max_dirs),
        }
    }

    pub fn root(&self) -> &ConfinedRoot {
        &self.root
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    pub fn open_dirs(&self) -> usize {
        self.dirs.len()
    }

    /// Close every file and directory stream. Used when a session ends.
    pub fn reset(&mut self) {
        if !self.files.is_empty() || !self.dirs.is_empty() {
            debug!(
                files = self.files.len(),
                dirs = self.dirs.len(),
                "Dropping handles of the previous session"
            );
        }
        self.files.clear();
        self.dirs.clear();
    }

    fn resolve(&self, path: &[u8]) -> ReefsResult<ConfinedPath> {
        self.root.resolve(path)
    }

    pub fn open(&mut self, path: &[u8], flags: i32) -> ReefsResult<i32> {
        let target = self.resolve(path)?;
        if flags & libc::O_CREAT != 0 {
            if let Some(parent) = target.host.parent() {
                create_dirs(parent, PARENT_DIR_MODE)?;
            }
        }

        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => options.read(true),
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => return Err(ReefsError::InvalidArgument("access mode")),
        };
        options
            .custom_flags(flags & !libc::O_ACCMODE)
            .mode(FILE_CREATE_MODE);

        let file = options.open(&target.host)?;
        self.files.insert(file)
    }

    pub fn close(&mut self, fd: i32) -> ReefsResult<()> {
        let raw = self.files.remove(fd)?.into_raw_fd();
        // SAFETY: `raw` was just released by its owning `File`
        if unsafe { libc::close(raw) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Read until `buf` is full or the file ends
    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> ReefsResult<usize> {
        let file = self.files.get_mut(fd)?;
        transfer_all(buf.len(), |done| file.read(&mut buf[done..]))
    }

    /// Write all of `data` unless the host stops accepting bytes
    pub fn write(&mut self, fd: i32, data: &[u8]) -> ReefsResult<usize> {
        let file = self.files.get_mut(fd)?;
        transfer_all(data.len(), |done| file.write(&data[done..]))
    }

    pub fn truncate(&mut self, fd: i32, len: i64) -> ReefsResult<()> {
        let len = u64::try_from(len).map_err(|_| ReefsError::InvalidArgument("negative length"))?;
        self.files.get_mut(fd)?.set_len(len)?;
        Ok(())
    }

    pub fn unlink(&mut self, path: &[u8]) -> ReefsResult<()> {
        let target = self.resolve(path)?;
        if target.is_root {
            return Err(ReefsError::RootBusy);
        }
        fs::remove_file(&target.host)?;
        Ok(())
    }

    /// Move `from` to `to`; never replaces an existing destination
    pub fn rename(&mut self, from: &[u8], to: &[u8]) -> ReefsResult<()> {
        let source = self.resolve(from)?;
        let destination = self.resolve(to)?;
        if source.is_root {
            return Err(ReefsError::RootBusy);
        }
        if fs::symlink_metadata(&destination.host).is_ok() {
            return Err(ReefsError::DestinationExists);
        }
        fs::rename(&source.host, &destination.host)?;
        Ok(())
    }

    pub fn mkdir(&mut self, path: &[u8], mode: u32) -> ReefsResult<()> {
        let target = self.resolve(path)?;
        let mode = match mode & 0o7777 {
            0 => PARENT_DIR_MODE,
            mode => mode,
        };
        create_dirs(&target.host, mode)
    }

    pub fn rmdir(&mut self, path: &[u8]) -> ReefsResult<()> {
        let target = self.resolve(path)?;
        if target.is_root {
            return Err(ReefsError::RootBusy);
        }
        fs::remove_dir(&target.host)?;
        Ok(())
    }

    /// Reposition a file; returns the new offset
    pub fn seek(&mut self, fd: i32, offset: i64, whence: i32) -> ReefsResult<u64> {
        let position = match whence {
            libc::SEEK_SET => SeekFrom::Start(
                u64::try_from(offset).map_err(|_| ReefsError::InvalidArgument("negative offset"))?,
            ),
            libc::SEEK_CUR => SeekFrom::Current(offset),
            libc::SEEK_END => SeekFrom::End(offset),
            _ => return Err(ReefsError::InvalidArgument("whence")),
        };
        Ok(self.files.get_mut(fd)?.seek(position)?)
    }

    pub fn opendir(&mut self, path: &[u8]) -> ReefsResult<i32> {
        let target = self.resolve(path)?;
        let stream = DirStream::open(&target.host)?;
        // on failure the stream is dropped, and thereby closed, by the table
        self.dirs.insert(stream)
    }

    pub fn closedir(&mut self, handle: i32) -> ReefsResult<()> {
        self.dirs.remove(handle)?.close()?;
        Ok(())
    }

    pub fn readdir(&mut self, handle: i32, out: &mut [u8]) -> ReefsResult<ReaddirOutcome> {
        pack_entries(self.dirs.get_mut(handle)?, out)
    }

    pub fn seekdir(&mut self, handle: i32, cookie: i64) -> ReefsResult<()> {
        self.dirs.get_mut(handle)?.seek(cookie);
        Ok(())
    }
}

fn create_dirs(path: &Path, mode: u32) -> ReefsResult<()> {
    DirBuilder::new().recursive(true).mode(mode).create(path)?;
    Ok(())
}

/// Repeat a partial transfer until `len` bytes moved or the host reports
/// end of stream. An error is surfaced only if nothing was transferred.
fn transfer_all(
    len: usize,
    mut step: impl FnMut(usize) -> io::Result<usize>,
) -> ReefsResult<usize> {
    let mut done = 0usize;
    while done < len {
        match step(done) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if done == 0 {
                    return Err(err.into());
                }
                break;
            }
        }
    }
    Ok(done)
}
