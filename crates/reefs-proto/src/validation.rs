// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Structural checks for requests arriving from the secure side

use crate::tee::{CommandRecord, MAX_PARAMS};
use thiserror::Error;

/// Validation error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("declared parameter count {count} exceeds capacity {max}")]
    TooManyParams { count: u32, max: usize },
    #[error("request carries no parameters")]
    MissingParams,
    #[error("parameter 0 is not a memref (attr {0:#x})")]
    NotMemref(u64),
    #[error("memref references shm {found}, arena is {expected}")]
    ForeignShm { found: i32, expected: i32 },
    #[error("memref [{offset}, +{size}) lies outside the {capacity}-byte arena")]
    MemrefOutOfBounds {
        offset: u64,
        size: u64,
        capacity: usize,
    },
    #[error("command truncated: only {0} bytes available")]
    Truncated(usize),
    #[error("path is not NUL-terminated")]
    UnterminatedPath,
    #[error("path exceeds the maximum length")]
    PathTooLong,
    #[error("length {len} does not fit the {capacity}-byte data region")]
    LengthOutOfBounds { len: i64, capacity: usize },
    #[error("unknown operation code {0}")]
    UnknownOp(i32),
}

impl ValidationError {
    /// Positive errno reported back to the secure side
    pub fn errno(&self) -> i32 {
        match self {
            ValidationError::UnknownOp(_) => libc::ENOTSUP,
            ValidationError::PathTooLong => libc::ENAMETOOLONG,
            _ => libc::EINVAL,
        }
    }
}

/// The declared parameter count must fit the record's static capacity
pub fn validate_param_count(record: &CommandRecord) -> Result<(), ValidationError> {
    let count = record.declared_params();
    if count as usize > MAX_PARAMS {
        return Err(ValidationError::TooManyParams {
            count,
            max: MAX_PARAMS,
        });
    }
    Ok(())
}

/// Validate the memref a filesystem request points at and return the
/// `(offset, size)` window of the arena it covers.
pub fn validate_memref(
    record: &CommandRecord,
    shm_id: i32,
    arena_capacity: usize,
) -> Result<(usize, usize), ValidationError> {
    validate_param_count(record)?;
    let param = record.param(0).ok_or(ValidationError::MissingParams)?;
    if !param.is_memref() {
        return Err(ValidationError::NotMemref(param.attr));
    }
    if param.shm_id() != shm_id {
        return Err(ValidationError::ForeignShm {
            found: param.shm_id(),
            expected: shm_id,
        });
    }
    let out_of_bounds = ValidationError::MemrefOutOfBounds {
        offset: param.a,
        size: param.b,
        capacity: arena_capacity,
    };
    let end = param.a.checked_add(param.b).ok_or_else(|| out_of_bounds.clone())?;
    if end > arena_capacity as u64 {
        return Err(out_of_bounds);
    }
    Ok((param.a as usize, param.b as usize))
}

/// Caller-supplied transfer length, bounded by the data region
pub fn validate_io_length(len: i64, capacity: usize) -> Result<usize, ValidationError> {
    if len < 0 || len as u64 > capacity as u64 {
        return Err(ValidationError::LengthOutOfBounds { len, capacity });
    }
    Ok(len as usize)
}
