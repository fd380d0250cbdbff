// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process transport driven by a script of requests
//!
//! Stands in for the TEE driver so the supervisor, dispatcher and adapter
//! can be exercised together. Each `receive` places the next scripted
//! request in the arena; each `send` records the response. When the script
//! runs out, the shutdown flag is raised and `receive` fails.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reefs_proto::messages::command_data;
use reefs_proto::{
    CommandRecord, FS_COMMAND_HEADER_LEN, FsCommandHeader, ReefsOp, SUPP_REEFS,
    TEE_IMPL_ID_MBEDTEE, TeeIoctlVersionData,
};

use crate::arena::SharedArena;
use crate::error::TransportError;
use crate::transport::Transport;

type RawStep = Box<dyn FnMut(&mut CommandRecord, &mut [u8]) + Send>;

enum Step {
    Request { func: u32, payload: Vec<u8> },
    Raw(RawStep),
    ReceiveFailure,
}

/// What the supplicant handed back for one request
#[derive(Clone, Debug)]
pub struct Response {
    pub func: u32,
    /// Result carried in the command record
    pub ret: i32,
    /// Command header as left in the arena, for filesystem requests
    pub header: Option<FsCommandHeader>,
    /// Data region following the header
    pub data: Vec<u8>,
}

pub struct ScriptedTransport {
    script: VecDeque<Step>,
    responses: Vec<Response>,
    shutdown: Arc<AtomicBool>,
    impl_id: u32,
    open: bool,
    opens: usize,
    closes: usize,
    next_shm_id: i32,
    last_func: u32,
    fail_opens: usize,
    fail_allocs: usize,
    fail_sends: usize,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            responses: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            impl_id: TEE_IMPL_ID_MBEDTEE,
            open: false,
            opens: 0,
            closes: 0,
            next_shm_id: 1,
            last_func: 0,
            fail_opens: 0,
            fail_allocs: 0,
            fail_sends: 0,
        }
    }

    /// Flag raised once the script is exhausted; pass it to the supervisor
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn with_impl_id(mut self, impl_id: u32) -> Self {
        self.impl_id = impl_id;
        self
    }

    /// Make the next `count` opens fail
    pub fn fail_opens(&mut self, count: usize) -> &mut Self {
        self.fail_opens = count;
        self
    }

    pub fn fail_allocs(&mut self, count: usize) -> &mut Self {
        self.fail_allocs = count;
        self
    }

    pub fn fail_sends(&mut self, count: usize) -> &mut Self {
        self.fail_sends = count;
        self
    }

    /// Deliver a filesystem command
    pub fn push_command(&mut self, header: FsCommandHeader, data: &[u8]) -> &mut Self {
        let mut payload = vec![0u8; FS_COMMAND_HEADER_LEN];
        // the buffer is exactly one header long
        let _ = header.encode(&mut payload);
        payload.extend_from_slice(data);
        self.script.push_back(Step::Request {
            func: SUPP_REEFS,
            payload,
        });
        self
    }

    /// Deliver a request for an arbitrary supplicant function
    pub fn push_function(&mut self, func: u32) -> &mut Self {
        self.script.push_back(Step::Request {
            func,
            payload: Vec::new(),
        });
        self
    }

    /// Let a closure shape the record and arena, e.g. to model a broken peer
    pub fn push_raw<F>(&mut self, step: F) -> &mut Self
    where
        F: FnMut(&mut CommandRecord, &mut [u8]) + Send + 'static,
    {
        self.script.push_back(Step::Raw(Box::new(step)));
        self
    }

    pub fn push_receive_failure(&mut self) -> &mut Self {
        self.script.push_back(Step::ReceiveFailure);
        self
    }

    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    pub fn opens(&self) -> usize {
        self.opens
    }

    pub fn closes(&self) -> usize {
        self.closes
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open { Ok(()) } else { Err(TransportError::NotOpen) }
    }
}

impl Transport for ScriptedTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(TransportError::Open {
                path: "scripted".into(),
                source: io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        self.open = true;
        self.opens += 1;
        Ok(())
    }

    fn version(&mut self) -> Result<TeeIoctlVersionData, TransportError> {
        self.ensure_open()?;
        Ok(TeeIoctlVersionData {
            impl_id: self.impl_id,
            ..Default::default()
        })
    }

    fn alloc_arena(&mut self, size: usize) -> Result<SharedArena, TransportError> {
        self.ensure_open()?;
        if self.fail_allocs > 0 {
            self.fail_allocs -= 1;
            return Err(TransportError::ArenaAlloc(io::Error::from_raw_os_error(
                libc::ENOMEM,
            )));
        }
        let id = self.next_shm_id;
        self.next_shm_id += 1;
        Ok(SharedArena::heap(id, size))
    }

    fn receive(
        &mut self,
        record: &mut CommandRecord,
        arena: &mut SharedArena,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Some(step) = self.script.pop_front() else {
            self.shutdown.store(true, Ordering::SeqCst);
            return Err(TransportError::Receive(io::Error::from(
                io::ErrorKind::Interrupted,
            )));
        };

        match step {
            Step::Request { func, payload } => {
                let buf = arena.as_mut_slice();
                if payload.len() > buf.len() {
                    return Err(TransportError::Receive(io::Error::from_raw_os_error(
                        libc::EMSGSIZE,
                    )));
                }
                buf.fill(0);
                buf[..payload.len()].copy_from_slice(&payload);
                record.set_func(func);
            }
            Step::Raw(mut shape) => shape(record, arena.as_mut_slice()),
            Step::ReceiveFailure => {
                return Err(TransportError::Receive(io::Error::from_raw_os_error(
                    libc::EIO,
                )));
            }
        }
        self.last_func = record.func();
        Ok(())
    }

    fn send(&mut self, record: &CommandRecord, arena: &SharedArena) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.fail_sends > 0 {
            self.fail_sends -= 1;
            return Err(TransportError::Send(io::Error::from_raw_os_error(libc::EIO)));
        }
        let buf = arena.as_slice();
        let header = if self.last_func == SUPP_REEFS {
            FsCommandHeader::decode(buf).ok()
        } else {
            None
        };
        self.responses.push(Response {
            func: self.last_func,
            ret: record.ret(),
            header,
            data: command_data(buf).to_vec(),
        });
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.closes += 1;
        }
    }
}

/// Header for `op` with the remaining fields zeroed
pub fn command(op: ReefsOp) -> FsCommandHeader {
    FsCommandHeader::new(op.code())
}

/// One NUL-terminated path
pub fn path_data(path: &str) -> Vec<u8> {
    let mut data = path.as_bytes().to_vec();
    data.push(0);
    data
}

/// Source and destination paths for `rename`
pub fn path_pair_data(from: &str, to: &str) -> Vec<u8> {
    let mut data = path_data(from);
    data.extend_from_slice(&path_data(to));
    data
}
