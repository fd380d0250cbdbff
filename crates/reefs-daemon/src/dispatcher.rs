// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Decoding of received command records and routing to the adapter

use reefs_proto::messages::{command_data_mut, parse_path, parse_path_pair};
use reefs_proto::{
    CommandRecord, FsCommandHeader, ReefsOp, REEFS_DIR_END, SUPP_REEFS, validate_io_length,
    validate_memref, validate_param_count,
};
use tracing::{debug, warn};

use crate::adapter::FsAdapter;
use crate::arena::SharedArena;
use crate::dirent::ReaddirOutcome;
use crate::error::{ReefsError, ReefsResult};

/// Handles exactly one request at a time; never fails across its boundary
pub struct Dispatcher {
    adapter: FsAdapter,
}

impl Dispatcher {
    pub fn new(adapter: FsAdapter) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &FsAdapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut FsAdapter {
        &mut self.adapter
    }

    /// Serve one received record in place. The result is stored in the
    /// record (and, for filesystem commands, in the command header) and
    /// returned.
    pub fn dispatch(&mut self, record: &mut CommandRecord, arena: &mut SharedArena) -> i32 {
        let ret = match self.route(record, arena) {
            Ok(ret) => ret,
            Err(err) => {
                warn!(func = record.func(), error = %err, "Rejected supplicant request");
                err.to_result()
            }
        };
        record.set_return(ret);
        record.ret()
    }

    fn route(&mut self, record: &mut CommandRecord, arena: &mut SharedArena) -> ReefsResult<i64> {
        if let Err(err) = validate_param_count(record) {
            // keep the response within the record's capacity
            record.clear_params();
            return Err(err.into());
        }

        match record.func() {
            SUPP_REEFS => {
                let (offset, size) = validate_memref(record, arena.id(), arena.capacity())?;
                let window = &mut arena.as_mut_slice()[offset..offset + size];
                self.serve_command(window)
            }
            other => Err(ReefsError::UnsupportedFunction(other)),
        }
    }

    /// Execute the filesystem command in `window` and write back its result
    fn serve_command(&mut self, window: &mut [u8]) -> ReefsResult<i64> {
        let header = FsCommandHeader::decode(window)?;
        let ret = match self.execute(&header, command_data_mut(window)) {
            Ok(ret) => ret,
            Err(err) => {
                debug!(
                    op = header.op,
                    fd = header.fd,
                    errno = err.errno(),
                    class = ?err.class(),
                    error = %err,
                    "Filesystem command failed"
                );
                err.to_result()
            }
        };
        FsCommandHeader::store_ret(window, ret)?;
        Ok(ret)
    }

    fn execute(&mut self, header: &FsCommandHeader, data: &mut [u8]) -> ReefsResult<i64> {
        let op = ReefsOp::try_from(header.op)?;
        debug!(
            operation = op.name(),
            fd = header.fd,
            flags = header.flags,
            len = header.len,
            "Serving filesystem command"
        );

        let adapter = &mut self.adapter;
        let ret = match op {
            ReefsOp::Open => adapter.open(parse_path(data)?, header.flags)? as i64,
            ReefsOp::Close => adapter.close(header.fd).map(|_| 0)?,
            ReefsOp::Read => {
                let len = validate_io_length(header.len, data.len())?;
                adapter.read(header.fd, &mut data[..len])? as i64
            }
            ReefsOp::Write => {
                let len = validate_io_length(header.len, data.len())?;
                adapter.write(header.fd, &data[..len])? as i64
            }
            ReefsOp::Truncate => adapter.truncate(header.fd, header.len).map(|_| 0)?,
            ReefsOp::Unlink => adapter.unlink(parse_path(data)?).map(|_| 0)?,
            ReefsOp::Rename => {
                let (from, to) = parse_path_pair(data)?;
                adapter.rename(from, to).map(|_| 0)?
            }
            ReefsOp::Mkdir => adapter.mkdir(parse_path(data)?, header.flags as u32).map(|_| 0)?,
            ReefsOp::Rmdir => adapter.rmdir(parse_path(data)?).map(|_| 0)?,
            ReefsOp::Seek => {
                let offset = adapter.seek(header.fd, header.len, header.flags)?;
                i64::try_from(offset).map_err(|_| ReefsError::InvalidArgument("offset"))?
            }
            ReefsOp::Opendir => adapter.opendir(parse_path(data)?)? as i64,
            ReefsOp::Closedir => adapter.closedir(header.fd).map(|_| 0)?,
            ReefsOp::Readdir => {
                let len = validate_io_length(header.len, data.len())?;
                match adapter.readdir(header.fd, &mut data[..len])? {
                    ReaddirOutcome::Packed(written) => written as i64,
                    ReaddirOutcome::EndOfDirectory => REEFS_DIR_END,
                }
            }
            ReefsOp::Seekdir => adapter.seekdir(header.fd, header.len).map(|_| 0)?,
        };
        Ok(ret)
    }
}
