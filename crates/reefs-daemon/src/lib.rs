// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! REEFS supplicant library
//!
//! Serves filesystem requests issued by the secure OS through the Linux TEE
//! supplicant interface. The [`Supervisor`] owns the channel and the shared
//! arena, the [`Dispatcher`] decodes each request and the [`FsAdapter`]
//! executes it below a fixed confinement root.

pub mod adapter;
pub mod arena;
pub mod config;
pub mod confine;
pub mod dirent;
pub mod dispatcher;
pub mod error;
pub mod handles;
pub mod handshake;
pub mod lock;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use adapter::FsAdapter;
pub use arena::SharedArena;
pub use config::{ConfigOverrides, SupplicantConfig};
pub use confine::{ConfinedPath, ConfinedRoot};
pub use dirent::{DirStream, ReaddirOutcome};
pub use dispatcher::Dispatcher;
pub use error::{ErrorClass, ReefsError, ReefsResult, TransportError};
pub use handshake::verify_version;
pub use lock::InstanceLock;
pub use supervisor::{
    RestartPolicy, Supervisor, SupervisorOptions, SupervisorState, SupervisorStats,
};
pub use transport::{TeeTransport, Transport};
