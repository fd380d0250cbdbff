// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the supplicant
//!
//! [`ReefsError`] covers a single request and is always converted into a
//! negative errno for the secure side. [`TransportError`] ends the current
//! session and is handled by the supervisor.

use std::io;
use std::path::PathBuf;

use reefs_proto::ValidationError;

/// Per-request error, reported to the caller as `-errno()`
#[derive(thiserror::Error, Debug)]
pub enum ReefsError {
    #[error("malformed request: {0}")]
    Protocol(#[from] ValidationError),
    #[error("unsupported function code {0}")]
    UnsupportedFunction(u32),
    #[error("invalid handle {0}")]
    InvalidHandle(i32),
    #[error("handle table exhausted")]
    HandlesExhausted,
    #[error("directory entry does not fit the output buffer")]
    EntryTooLarge,
    #[error("path escapes the confinement root")]
    PathEscape,
    #[error("path name too long")]
    NameTooLong,
    #[error("operation not permitted on the confinement root")]
    RootBusy,
    #[error("destination already exists")]
    DestinationExists,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Which part of the system rejected a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Filesystem,
    Resource,
}

impl ReefsError {
    /// Positive errno value for this error
    pub fn errno(&self) -> i32 {
        match self {
            ReefsError::Protocol(err) => err.errno(),
            ReefsError::UnsupportedFunction(_) => libc::ENOTSUP,
            ReefsError::InvalidHandle(_) => libc::EINVAL,
            ReefsError::HandlesExhausted => libc::EMFILE,
            ReefsError::EntryTooLarge => libc::E2BIG,
            ReefsError::PathEscape => libc::EACCES,
            ReefsError::NameTooLong => libc::ENAMETOOLONG,
            ReefsError::RootBusy => libc::EBUSY,
            ReefsError::DestinationExists => libc::EEXIST,
            ReefsError::InvalidArgument(_) => libc::EINVAL,
            ReefsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ReefsError::Protocol(_) | ReefsError::UnsupportedFunction(_) => ErrorClass::Protocol,
            ReefsError::InvalidHandle(_)
            | ReefsError::HandlesExhausted
            | ReefsError::EntryTooLarge => ErrorClass::Resource,
            _ => ErrorClass::Filesystem,
        }
    }

    /// Value stored in the result fields
    pub fn to_result(&self) -> i64 {
        -(self.errno() as i64)
    }
}

pub type ReefsResult<T> = Result<T, ReefsError>;

/// Channel failure; ends the serving session
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to open TEE device {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("TEE implementation id {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("version query failed: {0}")]
    Version(#[source] io::Error),
    #[error("shared memory allocation failed: {0}")]
    ArenaAlloc(#[source] io::Error),
    #[error("shared memory mapping failed: {0}")]
    Map(#[source] io::Error),
    #[error("supplicant receive failed: {0}")]
    Receive(#[source] io::Error),
    #[error("supplicant send failed: {0}")]
    Send(#[source] io::Error),
    #[error("transport is not open")]
    NotOpen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(ReefsError::RootBusy.to_result(), -(libc::EBUSY as i64));
        assert_eq!(ReefsError::DestinationExists.errno(), libc::EEXIST);
        assert_eq!(ReefsError::EntryTooLarge.errno(), libc::E2BIG);
        assert_eq!(ReefsError::InvalidHandle(3).errno(), libc::EINVAL);
        assert_eq!(
            ReefsError::from(io::Error::from_raw_os_error(libc::ENOENT)).errno(),
            libc::ENOENT
        );
        assert_eq!(ReefsError::from(io::Error::other("boom")).errno(), libc::EIO);
        assert_eq!(
            ReefsError::from(ValidationError::UnknownOp(77)).errno(),
            libc::ENOTSUP
        );
    }

    #[test]
    fn error_classes() {
        assert_eq!(ReefsError::UnsupportedFunction(9).class(), ErrorClass::Protocol);
        assert_eq!(ReefsError::HandlesExhausted.class(), ErrorClass::Resource);
        assert_eq!(ReefsError::RootBusy.class(), ErrorClass::Filesystem);
    }
}
