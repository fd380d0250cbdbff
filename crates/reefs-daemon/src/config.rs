// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Supplicant configuration
//!
//! Built-in defaults, optionally replaced by a TOML file, then by command
//! line flags or their environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reefs_proto::{FS_COMMAND_HEADER_LEN, TEE_IMPL_ID_MBEDTEE};
use serde::{Deserialize, Serialize};

use crate::handles::DEFAULT_HANDLE_CAPACITY;
use crate::supervisor::{DEFAULT_ARENA_SIZE, RestartPolicy, SupervisorOptions};

pub const DEFAULT_ROOT: &str = "/data/mbedtee/reefs";
pub const DEFAULT_DEVICE: &str = "/dev/tee0";
pub const DEFAULT_LOCK_FILE: &str = "/var/tmp/mbedtee-supp";

/// Smallest usable arena: one command header plus room for a path
pub const MIN_ARENA_SIZE: usize = FS_COMMAND_HEADER_LEN + 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SupplicantConfig {
    /// Host directory every remote path is resolved under
    pub root: PathBuf,
    pub device: PathBuf,
    pub arena_size: usize,
    pub expected_impl_id: u32,
    pub max_open_files: usize,
    pub max_open_dirs: usize,
    pub lock_file: PathBuf,
    pub realtime: bool,
    pub restart_initial_backoff_ms: u64,
    pub restart_max_backoff_ms: u64,
}

impl Default for SupplicantConfig {
    fn default() -> Self {
        let restart = RestartPolicy::default();
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            device: PathBuf::from(DEFAULT_DEVICE),
            arena_size: DEFAULT_ARENA_SIZE,
            expected_impl_id: TEE_IMPL_ID_MBEDTEE,
            max_open_files: DEFAULT_HANDLE_CAPACITY,
            max_open_dirs: DEFAULT_HANDLE_CAPACITY,
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            realtime: true,
            restart_initial_backoff_ms: restart.initial_backoff.as_millis() as u64,
            restart_max_backoff_ms: restart.max_backoff.as_millis() as u64,
        }
    }
}

impl SupplicantConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("parsing supplicant configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        Self::from_toml_str(&content).with_context(|| format!("in config file {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            anyhow::bail!("root must be an absolute path, got {:?}", self.root);
        }
        if self.arena_size < MIN_ARENA_SIZE {
            anyhow::bail!(
                "arena-size {} is below the minimum of {} bytes",
                self.arena_size,
                MIN_ARENA_SIZE
            );
        }
        if self.max_open_files == 0 || self.max_open_dirs == 0 {
            anyhow::bail!("handle capacities must be greater than zero");
        }
        if self.restart_max_backoff_ms < self.restart_initial_backoff_ms {
            anyhow::bail!("restart-max-backoff-ms must not be below restart-initial-backoff-ms");
        }
        Ok(())
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            initial_backoff: Duration::from_millis(self.restart_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.restart_max_backoff_ms),
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            arena_size: self.arena_size,
            expected_impl_id: self.expected_impl_id,
            realtime: self.realtime,
            restart: self.restart_policy(),
        }
    }
}

/// Values given on the command line (or via environment) that take
/// precedence over the file
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub root: Option<PathBuf>,
    pub device: Option<PathBuf>,
    pub arena_size: Option<usize>,
    pub expected_impl_id: Option<u32>,
    pub lock_file: Option<PathBuf>,
    pub no_realtime: bool,
}

impl ConfigOverrides {
    pub fn apply(self, mut config: SupplicantConfig) -> SupplicantConfig {
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(arena_size) = self.arena_size {
            config.arena_size = arena_size;
        }
        if let Some(impl_id) = self.expected_impl_id {
            config.expected_impl_id = impl_id;
        }
        if let Some(lock_file) = self.lock_file {
            config.lock_file = lock_file;
        }
        if self.no_realtime {
            config.realtime = false;
        }
        config
    }
}
