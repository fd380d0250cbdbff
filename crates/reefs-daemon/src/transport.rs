// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel-mediated channel to the secure OS

use std::fs::{File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::mman::{MapFlags, ProtFlags, mmap};
use reefs_proto::tee::{
    TEE_IOC_MAGIC, TEE_IOC_SHM_ALLOC_NR, TEE_IOC_SUPPL_RECV_NR, TEE_IOC_SUPPL_SEND_NR,
    TEE_IOC_VERSION_NR,
};
use reefs_proto::{
    CommandRecord, TeeIoctlBufData, TeeIoctlShmAllocData, TeeIoctlVersionData,
};
use tracing::{debug, info};

use crate::arena::SharedArena;
use crate::error::TransportError;

nix::ioctl_read!(tee_ioc_version, TEE_IOC_MAGIC, TEE_IOC_VERSION_NR, TeeIoctlVersionData);
nix::ioctl_readwrite!(tee_ioc_shm_alloc, TEE_IOC_MAGIC, TEE_IOC_SHM_ALLOC_NR, TeeIoctlShmAllocData);
nix::ioctl_read!(tee_ioc_suppl_recv, TEE_IOC_MAGIC, TEE_IOC_SUPPL_RECV_NR, TeeIoctlBufData);
nix::ioctl_read!(tee_ioc_suppl_send, TEE_IOC_MAGIC, TEE_IOC_SUPPL_SEND_NR, TeeIoctlBufData);

/// Synchronous request/response channel used by the supervisor.
///
/// `receive` blocks until the driver delivers the next request into the
/// record (and, for filesystem requests, into the arena); `send` hands the
/// completed record back. Any error ends the session.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    fn open(&mut self) -> Result<(), TransportError>;

    /// Implementation identity declared by the driver
    fn version(&mut self) -> Result<TeeIoctlVersionData, TransportError>;

    fn alloc_arena(&mut self, size: usize) -> Result<SharedArena, TransportError>;

    fn receive(
        &mut self,
        record: &mut CommandRecord,
        arena: &mut SharedArena,
    ) -> Result<(), TransportError>;

    fn send(&mut self, record: &CommandRecord, arena: &SharedArena)
    -> Result<(), TransportError>;

    /// Release the channel; calling it on a closed transport is a no-op
    fn close(&mut self);
}

/// Transport over a Linux TEE character device (`/dev/teeN`)
#[derive(Debug)]
pub struct TeeTransport {
    device: PathBuf,
    file: Option<File>,
}

impl TeeTransport {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            file: None,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    fn raw_fd(&self) -> Result<i32, TransportError> {
        self.file.as_ref().map(|f| f.as_raw_fd()).ok_or(TransportError::NotOpen)
    }

    fn exchange(
        &self,
        record: *mut CommandRecord,
        wire_len: usize,
        send: bool,
    ) -> Result<(), Errno> {
        let fd = self.raw_fd().map_err(|_| Errno::EBADF)?;
        let mut buf = TeeIoctlBufData {
            buf_ptr: record as u64,
            buf_len: wire_len as u64,
        };
        loop {
            // SAFETY: `buf` points at a live record whose first `wire_len`
            // bytes are valid; the driver does not access it past the call.
            let result = unsafe {
                if send {
                    tee_ioc_suppl_send(fd, &mut buf)
                } else {
                    tee_ioc_suppl_recv(fd, &mut buf)
                }
            };
            match result {
                Err(Errno::EINTR) => continue,
                other => return other.map(|_| ()),
            }
        }
    }
}

impl Transport for TeeTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(|source| TransportError::Open {
                path: self.device.clone(),
                source,
            })?;
        info!(device = %self.device.display(), "Opened TEE device");
        self.file = Some(file);
        Ok(())
    }

    fn version(&mut self) -> Result<TeeIoctlVersionData, TransportError> {
        let fd = self.raw_fd()?;
        let mut data = TeeIoctlVersionData::default();
        // SAFETY: `data` is a properly sized `tee_ioctl_version_data`
        unsafe { tee_ioc_version(fd, &mut data) }
            .map_err(|errno| TransportError::Version(io::Error::from(errno)))?;
        Ok(data)
    }

    fn alloc_arena(&mut self, size: usize) -> Result<SharedArena, TransportError> {
        let fd = self.raw_fd()?;
        let length = NonZeroUsize::new(size).ok_or_else(|| {
            TransportError::ArenaAlloc(io::Error::from_raw_os_error(libc::EINVAL))
        })?;
        let mut data = TeeIoctlShmAllocData {
            size: size as u64,
            ..Default::default()
        };
        // SAFETY: `data` is a properly sized `tee_ioctl_shm_alloc_data`
        let shm_fd = unsafe { tee_ioc_shm_alloc(fd, &mut data) }
            .map_err(|errno| TransportError::ArenaAlloc(io::Error::from(errno)))?;
        // SAFETY: on success the driver returns a fresh descriptor we now own
        let shm_fd = unsafe { OwnedFd::from_raw_fd(shm_fd) };

        // SAFETY: maps a new shared region; nothing else references it yet
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &shm_fd,
                0,
            )
        }
        .map_err(|errno| TransportError::Map(io::Error::from(errno)))?;
        // The mapping keeps the shared memory alive after the fd is closed.
        drop(shm_fd);

        debug!(shm_id = data.id, size, "Allocated shared arena");
        // SAFETY: `ptr` is the live `size`-byte mapping created above
        Ok(unsafe { SharedArena::from_mapping(data.id, ptr, size) })
    }

    fn receive(
        &mut self,
        record: &mut CommandRecord,
        _arena: &mut SharedArena,
    ) -> Result<(), TransportError> {
        let wire_len = record.wire_len();
        self.exchange(record.as_mut_ptr(), wire_len, false)
            .map_err(|errno| TransportError::Receive(io::Error::from(errno)))
    }

    fn send(&mut self, record: &CommandRecord, _arena: &SharedArena) -> Result<(), TransportError> {
        let wire_len = record.wire_len();
        // The driver only reads the record on send.
        let ptr = record as *const CommandRecord as *mut CommandRecord;
        self.exchange(ptr, wire_len, true)
            .map_err(|errno| TransportError::Send(io::Error::from(errno)))
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(device = %self.device.display(), "Closed TEE device");
        }
    }
}
