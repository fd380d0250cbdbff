// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! REEFS protocol: wire layouts shared with the secure OS
//!
//! This crate defines the bit-exact structures exchanged with the TEE driver
//! (`tee` module), the filesystem command carried inside the shared arena and
//! the packed directory entry records (`messages` module), plus the checks a
//! request has to pass before the supplicant acts on it (`validation` module).
//!
//! Nothing in here performs I/O.

pub mod messages;
pub mod tee;
pub mod validation;

// Re-export key types
pub use messages::{
    DirentIter, DirentRef, FsCommandHeader, ReefsOp, DIRENT_ALIGN, DIRENT_HEADER_LEN,
    FS_COMMAND_HEADER_LEN, REEFS_DIR_END, REEFS_PATH_MAX,
};
pub use tee::{
    CommandRecord, TeeIoctlBufData, TeeIoctlParam, TeeIoctlShmAllocData, TeeIoctlVersionData,
    MAX_PARAMS, PARAM_SLOT_SIZE, RECORD_HEADER_SIZE, SUPP_REEFS, TEE_IMPL_ID_MBEDTEE,
};
pub use validation::*;
