// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Outer serve loop: session setup, request rotation and restart on
//! transport failure

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use reefs_proto::{CommandRecord, TEE_IMPL_ID_MBEDTEE};
use tracing::{debug, error, info, warn};

use crate::arena::SharedArena;
use crate::dispatcher::Dispatcher;
use crate::error::TransportError;
use crate::handshake::verify_version;
use crate::transport::Transport;

pub const DEFAULT_ARENA_SIZE: usize = 32 * 1024;
const BACKOFF_MIN: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
const BACKOFF_SLICE: Duration = Duration::from_millis(10);

/// Delay between restarts that follow sessions which served nothing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: BACKOFF_MIN,
            max_backoff: BACKOFF_MAX,
        }
    }
}

impl RestartPolicy {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    pub arena_size: usize,
    pub expected_impl_id: u32,
    /// Request `SCHED_FIFO` for the serving thread before the first session
    pub realtime: bool,
    pub restart: RestartPolicy,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            expected_impl_id: TEE_IMPL_ID_MBEDTEE,
            realtime: true,
            restart: RestartPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    OpenTransport,
    VerifyVersion,
    AllocArena,
    Serve,
    ReleaseResources,
    Stopped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub sessions: u64,
    pub restart_count: u64,
    pub requests_served: u64,
}

enum SessionEnd {
    Shutdown,
    Failed(TransportError),
}

pub struct Supervisor<T: Transport> {
    transport: T,
    dispatcher: Dispatcher,
    options: SupervisorOptions,
    shutdown: Arc<AtomicBool>,
    state: SupervisorState,
    stats: SupervisorStats,
    elevated: bool,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(transport: T, dispatcher: Dispatcher, options: SupervisorOptions) -> Self {
        Self {
            transport,
            dispatcher,
            options,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: SupervisorState::Init,
            stats: SupervisorStats::default(),
            elevated: false,
        }
    }

    /// Share an externally owned shutdown flag
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Serve until shutdown is requested or a session cannot be set up.
    ///
    /// Failing to open, verify or allocate is terminal. A failure while
    /// serving tears the session down and starts a new one.
    pub fn run(&mut self) -> Result<SupervisorStats, TransportError> {
        let mut backoff = self.options.restart.initial_backoff;

        while !self.shutdown_requested() {
            let mut arena = match self.establish() {
                Ok(arena) => arena,
                Err(err) => {
                    error!(state = ?self.state, error = %err, "Failed to establish supplicant session");
                    self.transport.close();
                    self.state = SupervisorState::Stopped;
                    return Err(err);
                }
            };
            self.stats.sessions += 1;
            self.elevate_once();

            let served_before = self.stats.requests_served;
            let end = self.serve(&mut arena);
            self.release(arena);

            let err = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(err) => err,
            };
            if self.shutdown_requested() {
                debug!(error = %err, "Transport closed during shutdown");
                break;
            }

            self.stats.restart_count += 1;
            if self.stats.requests_served > served_before {
                backoff = self.options.restart.initial_backoff;
                warn!(
                    restart_count = self.stats.restart_count,
                    error = %err,
                    "Transport failed; restarting session"
                );
                continue;
            }

            warn!(
                restart_count = self.stats.restart_count,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Transport failed before serving a request; restarting with backoff"
            );
            if self.wait_backoff(backoff) {
                break;
            }
            backoff = self.options.restart.next(backoff);
        }

        self.state = SupervisorState::Stopped;
        info!(
            sessions = self.stats.sessions,
            restart_count = self.stats.restart_count,
            requests_served = self.stats.requests_served,
            "Supervisor stopped"
        );
        Ok(self.stats)
    }

    fn establish(&mut self) -> Result<SharedArena, TransportError> {
        self.state = SupervisorState::OpenTransport;
        self.transport.open()?;

        self.state = SupervisorState::VerifyVersion;
        verify_version(&mut self.transport, self.options.expected_impl_id)?;

        self.state = SupervisorState::AllocArena;
        let arena = self.transport.alloc_arena(self.options.arena_size)?;
        info!(
            shm_id = arena.id(),
            capacity = arena.capacity(),
            "Supplicant session established"
        );
        Ok(arena)
    }

    fn serve(&mut self, arena: &mut SharedArena) -> SessionEnd {
        self.state = SupervisorState::Serve;
        let mut record = CommandRecord::new();

        loop {
            if self.shutdown_requested() {
                return SessionEnd::Shutdown;
            }

            record.prime_receive(arena.id(), arena.capacity());
            if let Err(err) = self.transport.receive(&mut record, arena) {
                return SessionEnd::Failed(err);
            }

            let func = record.func();
            let started = Instant::now();
            let ret = self.dispatcher.dispatch(&mut record, arena);
            debug!(
                func,
                ret,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Request handled"
            );

            if let Err(err) = self.transport.send(&record, arena) {
                return SessionEnd::Failed(err);
            }
            self.stats.requests_served += 1;
        }
    }

    fn release(&mut self, arena: SharedArena) {
        self.state = SupervisorState::ReleaseResources;
        drop(arena);
        self.transport.close();
        self.dispatcher.adapter_mut().reset();
    }

    fn elevate_once(&mut self) {
        if self.elevated || !self.options.realtime {
            return;
        }
        self.elevated = true;
        match elevate_priority() {
            Ok(priority) => info!(priority, "Serving thread runs with SCHED_FIFO"),
            Err(err) => warn!(error = %err, "Could not raise serving thread priority"),
        }
    }

    /// Sleep for `delay` in short slices; returns true if shutdown was
    /// requested meanwhile.
    fn wait_backoff(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.shutdown_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(BACKOFF_SLICE.min(deadline - now));
        }
    }
}

/// Switch the calling thread to `SCHED_FIFO` at maximum priority
fn elevate_priority() -> io::Result<i32> {
    // SAFETY: plain libc queries on constants
    let priority = unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) };
    if priority < 0 {
        return Err(io::Error::last_os_error());
    }
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `param` is valid for the duration of the call
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FsAdapter;
    use crate::confine::ConfinedRoot;
    use crate::transport::MockTransport;
    use reefs_proto::TeeIoctlVersionData;

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            arena_size: 4096,
            realtime: false,
            restart: RestartPolicy {
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    fn dispatcher(dir: &tempfile::TempDir) -> Dispatcher {
        Dispatcher::new(FsAdapter::new(ConfinedRoot::new(dir.path())))
    }

    fn expect_healthy_setup(transport: &mut MockTransport, sessions: usize) {
        transport.expect_open().times(sessions).returning(|| Ok(()));
        transport.expect_version().times(sessions).returning(|| {
            Ok(TeeIoctlVersionData {
                impl_id: TEE_IMPL_ID_MBEDTEE,
                ..Default::default()
            })
        });
        transport
            .expect_alloc_arena()
            .times(sessions)
            .returning(|size| Ok(SharedArena::heap(7, size)));
        transport.expect_close().returning(|| ());
    }

    #[test]
    fn open_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockTransport::new();
        transport.expect_open().times(1).returning(|| {
            Err(TransportError::Open {
                path: "/dev/tee0".into(),
                source: io::Error::from_raw_os_error(libc::ENOENT),
            })
        });
        transport.expect_close().returning(|| ());

        let mut supervisor = Supervisor::new(transport, dispatcher(&dir), options());
        assert!(matches!(supervisor.run(), Err(TransportError::Open { .. })));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(supervisor.stats().sessions, 0);
    }

    #[test]
    fn version_mismatch_never_allocates() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockTransport::new();
        transport.expect_open().times(1).returning(|| Ok(()));
        transport
            .expect_version()
            .returning(|| Ok(TeeIoctlVersionData::default()));
        transport.expect_alloc_arena().never();
        transport.expect_close().times(1).returning(|| ());

        let mut supervisor = Supervisor::new(transport, dispatcher(&dir), options());
        assert!(matches!(
            supervisor.run(),
            Err(TransportError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn receive_failure_restarts_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor_transport = MockTransport::new();
        expect_healthy_setup(&mut supervisor_transport, 2);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let mut calls = 0;
        supervisor_transport
            .expect_receive()
            .times(3)
            .returning(move |record, _arena| {
                calls += 1;
                match calls {
                    2 => {
                        // unknown supplicant function; answered with -ENOTSUP
                        record.set_func(0x77);
                        Ok(())
                    }
                    3 => {
                        flag.store(true, Ordering::SeqCst);
                        Err(TransportError::Receive(io::Error::from(
                            io::ErrorKind::Interrupted,
                        )))
                    }
                    _ => Err(TransportError::Receive(io::Error::from_raw_os_error(
                        libc::EIO,
                    ))),
                }
            });
        supervisor_transport
            .expect_send()
            .times(1)
            .withf(|record, _| record.ret() == -libc::ENOTSUP)
            .returning(|_, _| Ok(()));

        let mut supervisor =
            Supervisor::new(supervisor_transport, dispatcher(&dir), options()).with_shutdown(shutdown);
        let stats = supervisor.run().unwrap();

        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.restart_count, 1);
        assert_eq!(stats.requests_served, 1);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[test]
    fn send_failure_is_session_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockTransport::new();
        expect_healthy_setup(&mut transport, 1);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        transport.expect_receive().times(1).returning(|record, _| {
            record.set_func(0x77);
            Ok(())
        });
        transport.expect_send().times(1).returning(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Err(TransportError::Send(io::Error::from_raw_os_error(libc::EIO)))
        });

        let mut supervisor =
            Supervisor::new(transport, dispatcher(&dir), options()).with_shutdown(shutdown);
        let stats = supervisor.run().unwrap();
        assert_eq!(stats.requests_served, 0);
        assert_eq!(stats.restart_count, 0);
    }

    #[test]
    fn shutdown_before_start_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = MockTransport::new();
        transport.expect_open().never();

        let mut supervisor = Supervisor::new(transport, dispatcher(&dir), options());
        supervisor.shutdown_handle().store(true, Ordering::SeqCst);
        assert_eq!(supervisor.run().unwrap(), SupervisorStats::default());
    }

    #[test]
    fn backoff_doubles_up_to_the_limit() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.next(Duration::from_millis(50)), Duration::from_millis(100));
        assert_eq!(policy.next(Duration::from_secs(4)), BACKOFF_MAX);
    }
}
