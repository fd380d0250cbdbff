// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! TEE driver ABI used by the supplicant side of `/dev/teeN`
//!
//! These mirror `linux/tee.h`. The command record is one buffer reused for
//! both `SUPPL_RECV` (tag = function code) and `SUPPL_SEND` (tag = return
//! value); only `RECORD_HEADER_SIZE + num_params * PARAM_SLOT_SIZE` bytes of it
//! are exchanged with the driver.

use std::mem::size_of;

pub const TEE_IOC_MAGIC: u8 = 0xa4;
pub const TEE_IOC_VERSION_NR: u8 = 0;
pub const TEE_IOC_SHM_ALLOC_NR: u8 = 1;
pub const TEE_IOC_SUPPL_RECV_NR: u8 = 6;
pub const TEE_IOC_SUPPL_SEND_NR: u8 = 7;

/// Upper bound the driver accepts for one supplicant argument buffer
pub const TEE_MAX_ARG_SIZE: usize = 1024;

pub const TEE_IOCTL_PARAM_ATTR_TYPE_NONE: u64 = 0;
pub const TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_INPUT: u64 = 1;
pub const TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_OUTPUT: u64 = 2;
pub const TEE_IOCTL_PARAM_ATTR_TYPE_VALUE_INOUT: u64 = 3;
pub const TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_INPUT: u64 = 5;
pub const TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_OUTPUT: u64 = 6;
pub const TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_INOUT: u64 = 7;
pub const TEE_IOCTL_PARAM_ATTR_TYPE_MASK: u64 = 0xff;

/// Implementation id reported by the mbedtee driver in `TEE_IOC_VERSION`
pub const TEE_IMPL_ID_MBEDTEE: u32 = 4;

/// Supplicant function code for filesystem (REEFS) requests
pub const SUPP_REEFS: u32 = 1;

/// `struct tee_ioctl_version_data`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeeIoctlVersionData {
    pub impl_id: u32,
    pub impl_caps: u32,
    pub gen_caps: u32,
}

/// `struct tee_ioctl_shm_alloc_data`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeeIoctlShmAllocData {
    pub size: u64,
    pub flags: u32,
    pub id: i32,
}

/// `struct tee_ioctl_buf_data`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeeIoctlBufData {
    pub buf_ptr: u64,
    pub buf_len: u64,
}

/// `struct tee_ioctl_param`: a type/attribute tag plus three generic fields.
///
/// For memrefs `a` is the offset into the shared memory, `b` the size and
/// `c` the shared memory id.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeeIoctlParam {
    pub attr: u64,
    pub a: u64,
    pub b: u64,
    pub c: u64,
}

impl TeeIoctlParam {
    pub fn memref_inout(offset: u64, size: u64, shm_id: i32) -> Self {
        Self {
            attr: TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_INOUT,
            a: offset,
            b: size,
            c: shm_id as u32 as u64,
        }
    }

    pub fn kind(&self) -> u64 {
        self.attr & TEE_IOCTL_PARAM_ATTR_TYPE_MASK
    }

    pub fn is_memref(&self) -> bool {
        matches!(
            self.kind(),
            TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_INPUT
                | TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_OUTPUT
                | TEE_IOCTL_PARAM_ATTR_TYPE_MEMREF_INOUT
        )
    }

    /// Shared memory id of a memref parameter
    pub fn shm_id(&self) -> i32 {
        self.c as u32 as i32
    }
}

pub const RECORD_HEADER_SIZE: usize = 2 * size_of::<u32>();
pub const PARAM_SLOT_SIZE: usize = size_of::<TeeIoctlParam>();
pub const MAX_PARAMS: usize = (TEE_MAX_ARG_SIZE - RECORD_HEADER_SIZE) / PARAM_SLOT_SIZE;

/// Union of `tee_iocl_supp_recv_arg` and `tee_iocl_supp_send_arg`
#[repr(C)]
#[derive(Clone, Debug)]
pub struct CommandRecord {
    tag: u32,
    num_params: u32,
    params: [TeeIoctlParam; MAX_PARAMS],
}

impl Default for CommandRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRecord {
    pub fn new() -> Self {
        Self {
            tag: 0,
            num_params: 0,
            params: [TeeIoctlParam::default(); MAX_PARAMS],
        }
    }

    /// Reset the record for the next `SUPPL_RECV`: one in/out memref
    /// covering the whole arena.
    pub fn prime_receive(&mut self, shm_id: i32, arena_capacity: usize) {
        *self = Self::new();
        self.num_params = 1;
        self.params[0] = TeeIoctlParam::memref_inout(0, arena_capacity as u64, shm_id);
    }

    /// Function code delivered by the driver
    pub fn func(&self) -> u32 {
        self.tag
    }

    pub fn set_func(&mut self, func: u32) {
        self.tag = func;
    }

    /// Return value as the driver will read it on `SUPPL_SEND`
    pub fn ret(&self) -> i32 {
        self.tag as i32
    }

    /// Store a result; values outside `i32` saturate because the send
    /// header only carries 32 bits.
    pub fn set_return(&mut self, ret: i64) {
        let clamped = ret.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        self.tag = clamped as u32;
    }

    /// Parameter count exactly as declared by the peer (may be out of range)
    pub fn declared_params(&self) -> u32 {
        self.num_params
    }

    pub fn num_params(&self) -> usize {
        (self.num_params as usize).min(MAX_PARAMS)
    }

    /// Overwrite the declared count; used by tests and transports that
    /// need to model a misbehaving peer.
    pub fn set_declared_params(&mut self, count: u32) {
        self.num_params = count;
    }

    pub fn push_param(&mut self, param: TeeIoctlParam) -> bool {
        let index = self.num_params();
        if index >= MAX_PARAMS || self.num_params as usize > MAX_PARAMS {
            return false;
        }
        self.params[index] = param;
        self.num_params += 1;
        true
    }

    pub fn clear_params(&mut self) {
        self.num_params = 0;
        self.params = [TeeIoctlParam::default(); MAX_PARAMS];
    }

    pub fn params(&self) -> &[TeeIoctlParam] {
        &self.params[..self.num_params()]
    }

    pub fn param(&self, index: usize) -> Option<&TeeIoctlParam> {
        self.params().get(index)
    }

    /// Bytes exchanged with the driver for this record
    pub fn wire_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.num_params() * PARAM_SLOT_SIZE
    }

    pub fn as_mut_ptr(&mut self) -> *mut Self {
        self as *mut Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_fits_driver_argument_limit() {
        assert_eq!(PARAM_SLOT_SIZE, 32);
        assert_eq!(MAX_PARAMS, 31);
        assert!(size_of::<CommandRecord>() <= TEE_MAX_ARG_SIZE);
    }

    #[test]
    fn primed_record_declares_one_memref() {
        let mut record = CommandRecord::new();
        record.prime_receive(9, 32 * 1024);

        assert_eq!(record.num_params(), 1);
        assert_eq!(record.wire_len(), RECORD_HEADER_SIZE + PARAM_SLOT_SIZE);
        let param = record.param(0).unwrap();
        assert!(param.is_memref());
        assert_eq!((param.a, param.b, param.shm_id()), (0, 32 * 1024, 9));
    }

    #[test]
    fn wire_len_never_exceeds_capacity() {
        let mut record = CommandRecord::new();
        record.set_declared_params(1000);
        assert_eq!(record.num_params(), MAX_PARAMS);
        assert_eq!(record.wire_len(), RECORD_HEADER_SIZE + MAX_PARAMS * PARAM_SLOT_SIZE);
        assert!(!record.push_param(TeeIoctlParam::default()));
    }

    #[test]
    fn return_value_saturates() {
        let mut record = CommandRecord::new();
        record.set_return(-(libc::ENOTSUP as i64));
        assert_eq!(record.ret(), -libc::ENOTSUP);
        record.set_return(i64::MAX);
        assert_eq!(record.ret(), i32::MAX);
    }
}
