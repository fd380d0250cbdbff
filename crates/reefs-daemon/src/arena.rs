// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared memory region exchanged with the TEE driver

use std::ffi::c_void;
use std::ptr::NonNull;

use tracing::warn;

enum Backing {
    /// Driver-allocated shared memory mapped into this process
    Mapped { ptr: NonNull<c_void>, len: usize },
    /// Process-local buffer for in-process transports
    Heap(Box<[u8]>),
}

/// Fixed-size arena identified by the driver's shared memory id.
///
/// The mapping is released when the arena is dropped.
pub struct SharedArena {
    id: i32,
    backing: Backing,
}

// SAFETY: the mapping is owned exclusively by this value and only accessed
// through `&self`/`&mut self`.
unsafe impl Send for SharedArena {}

impl SharedArena {
    pub fn heap(id: i32, size: usize) -> Self {
        Self {
            id,
            backing: Backing::Heap(vec![0u8; size].into_boxed_slice()),
        }
    }

    /// Take ownership of an existing mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live read/write mapping of `len` bytes created
    /// with `mmap` that nothing else unmaps.
    pub unsafe fn from_mapping(id: i32, ptr: NonNull<c_void>, len: usize) -> Self {
        Self {
            id,
            backing: Backing::Mapped { ptr, len },
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Mapped { len, .. } => *len,
            Backing::Heap(buf) => buf.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            // SAFETY: guaranteed live and `len` bytes long by `from_mapping`
            Backing::Mapped { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr() as *const u8, *len)
            },
            Backing::Heap(buf) => buf,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            // SAFETY: as above, and `&mut self` gives exclusive access
            Backing::Mapped { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut u8, *len)
            },
            Backing::Heap(buf) => buf,
        }
    }
}

impl std::fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArena")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("mapped", &matches!(self.backing, Backing::Mapped { .. }))
            .finish()
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        if let Backing::Mapped { ptr, len } = self.backing {
            // SAFETY: the mapping came from mmap and is unmapped exactly once
            if let Err(err) = unsafe { nix::sys::mman::munmap(ptr, len) } {
                warn!(shm_id = self.id, error = %err, "Failed to unmap shared arena");
            }
        }
    }
}
