//! The per-thread event loop: the single place a session's state is read
//! or mutated (spec §5).
//!
//! Grounded in the teacher's two event-loop shapes —
//! `examples/ryanseipp-rask-old/src/multilistener.rs`'s single-threaded
//! `Poll`/`Events` loop (accept, read, parse, write, deregister) and this
//! file's own channel-driven dispatch in its prior form — merged into one
//! loop that also drains a task queue and a timer queue each iteration,
//! per spec §4.3.

use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use crate::acceptor::{Acceptor, LISTEN_TOKEN};
use crate::associator;
use crate::buffer::Payload;
use crate::connector;
use crate::id::Sid;
use crate::service::{Ctx, Service, SessionOrigin, ShutdownWay};
use crate::session::{Session, SessionState};
use crate::table::{Liveness, SessionTable};
use crate::task::{AssociateCallback, ConnectTarget, ListenCallback, RecycleFn, Task, TaskQueue, TaskSender, TransformFn};
use crate::timer::{TimerKind, TimerQueue};

/// Reserved token the task-queue waker is registered under.
pub const WAKE_TOKEN: Token = Token(usize::MAX - 1);

const SCRATCH_BUF_LEN: usize = 64 * 1024;
const MAX_TASKS_PER_ITERATION: usize = 4096;

/// One I/O thread: owns a reactor, a session table, a timer queue, and an
/// inbound task queue. Everything here runs on exactly one OS thread for
/// the worker's entire lifetime.
pub struct Worker {
    id: u8,
    poll: Poll,
    sessions: SessionTable<Session>,
    tasks: TaskQueue,
    timers: TimerQueue,
    acceptor: Option<Acceptor>,
    iocontext: Ctx,
    transform: Option<(TransformFn, Ctx)>,
    realtime: bool,
    stopped: bool,
    destroying: bool,
    scratch: Vec<u8>,
}

impl Worker {
    /// Builds a worker with an empty session table sized for `capacity`
    /// sessions and a fresh task queue/waker pair.
    pub fn new(id: u8, capacity: usize, iocontext: Ctx, realtime: bool) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = std::sync::Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            id,
            poll,
            sessions: SessionTable::new(id, capacity),
            tasks: TaskQueue::new(waker),
            timers: TimerQueue::new(),
            acceptor: None,
            iocontext,
            transform: None,
            realtime,
            stopped: false,
            destroying: false,
            scratch: vec![0u8; SCRATCH_BUF_LEN],
        })
    }

    /// A handle other threads use to submit tasks to this worker.
    pub fn sender(&self) -> TaskSender {
        self.tasks.sender()
    }

    /// A cross-thread-visible snapshot of this worker's session occupancy,
    /// for resolving `Error::NotFound` synchronously at the dispatch facade.
    pub fn liveness(&self) -> Liveness {
        self.sessions.liveness()
    }

    /// Installs the layer-wide transform hook (`set_transform`).
    pub fn set_transform(&mut self, f: TransformFn, ctx: Ctx) {
        self.transform = Some((f, ctx));
    }

    /// Registers this worker's acceptor, which must already be bound.
    pub fn install_acceptor(&mut self, mut acceptor: Acceptor) -> io::Result<()> {
        self.poll
            .registry()
            .register(acceptor.socket_mut(), LISTEN_TOKEN, Interest::READABLE)?;
        self.acceptor = Some(acceptor);
        Ok(())
    }

    /// Number of live sessions currently owned by this worker.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Enters quiesce: the acceptor (if any) is detached, so no further
    /// inbound connections land on this worker (spec §4.9). Idempotent.
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.acceptor = None;
    }

    /// Runs the event loop until a `Task::Destroy` has been processed and
    /// every session this worker owned has been killed.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(1024);
        loop {
            let now = Instant::now();
            let timeout = self.poll_timeout(now);

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                warn!(worker = self.id, error = %e, "poll failed, worker exiting");
                return;
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => {
                        if let Some(acceptor) = self.acceptor.as_mut() {
                            acceptor.accept_ready();
                        }
                    }
                    WAKE_TOKEN => {}
                    token => self.dispatch_session_event(token, event),
                }
            }

            self.drain_tasks();
            self.drain_timers(Instant::now());

            if self.destroying && self.sessions.is_empty() {
                return;
            }
        }
    }

    fn poll_timeout(&self, now: Instant) -> Option<Duration> {
        if self.tasks.has_pending() {
            return Some(Duration::ZERO);
        }
        let next_timer = self.timers.next_deadline(now);
        if self.realtime {
            // §10: the realtime construction flag clamps coalescing latency
            // so a worker never blocks longer than this, keeping wakeups
            // responsive for latency-sensitive deployments.
            const REALTIME_CEILING: Duration = Duration::from_millis(5);
            return Some(next_timer.map_or(REALTIME_CEILING, |d| d.min(REALTIME_CEILING)));
        }
        next_timer
    }

    // ---- readiness dispatch -------------------------------------------------

    fn dispatch_session_event(&mut self, token: Token, event: &mio::event::Event) {
        let slot = token.0;
        let sid = match self.sessions.get_by_slot_mut(slot) {
            Some((sid, _)) => sid,
            None => return,
        };

        if event.is_error() {
            self.fail_session(sid, io::Error::new(io::ErrorKind::Other, "socket error"));
            return;
        }

        let is_connecting = self
            .sessions
            .get(sid)
            .map(|s| s.state() == SessionState::Connecting)
            .unwrap_or(false);

        if is_connecting {
            self.complete_connect(sid);
            return;
        }

        if event.is_readable() {
            self.read_session(sid);
        }

        if event.is_writable() {
            self.flush_session(sid);
        }

        self.reregister(sid);
    }

    fn complete_connect(&mut self, sid: Sid) {
        let status = match self.sessions.get(sid) {
            Some(session) => connector::completion_status(&session.stream),
            None => return,
        };
        match status {
            Ok(None) => self.finish_connect_success(sid),
            Ok(Some(e)) | Err(e) => self.finish_connect_failure(sid, e),
        }
    }

    fn finish_connect_success(&mut self, sid: Sid) {
        let target = match self.sessions.get_mut(sid) {
            Some(session) => {
                session.mark_connected();
                session.connect_target.clone().expect("connected session has a target")
            }
            None => return,
        };

        let rc = (target.cb)(&target.app_ctx, &self.iocontext, 0, &target.host, target.port, sid);
        if rc < 0 {
            self.destroy_session(sid, ShutdownWay::Application);
            return;
        }

        let start_rc = match self.sessions.get_mut(sid) {
            Some(session) => {
                let ctx = session.ctx().clone();
                session.service_mut().start(&ctx)
            }
            None => return,
        };
        if start_rc < 0 {
            self.destroy_session(sid, ShutdownWay::Peer);
            return;
        }
        self.reregister(sid);
        debug!(worker = self.id, %sid, host = %target.host, port = target.port, "connect succeeded");
    }

    fn finish_connect_failure(&mut self, sid: Sid, err: io::Error) {
        let mut session = match self.sessions.remove(sid) {
            Some(session) => session,
            None => return,
        };
        let _ = self.poll.registry().deregister(&mut session.stream);
        if let Some(target) = session.connect_target {
            let rc = err.raw_os_error().unwrap_or(-1).max(1);
            let _ = (target.cb)(&target.app_ctx, &self.iocontext, rc, &target.host, target.port, Sid::INVALID);
        }
    }

    fn read_session(&mut self, sid: Sid) {
        let now = Instant::now();
        loop {
            let read_result = match self.sessions.get_mut(sid) {
                Some(session) => session.stream.read(&mut self.scratch),
                None => return,
            };

            match read_result {
                Ok(0) => {
                    // Peer close is an IOError like any other (spec §7): route
                    // through `error` so a connected-origin session gets its
                    // reconnect option rather than being torn down unconditionally.
                    self.fail_session(sid, io::Error::new(ErrorKind::UnexpectedEof, "peer closed connection"));
                    return;
                }
                Ok(n) => {
                    let idle_secs = match self.sessions.get_mut(sid) {
                        Some(session) => {
                            session.mark_received(now);
                            session.idle_timeout_secs()
                        }
                        None => return,
                    };
                    if let Some(secs) = idle_secs {
                        let deadline = now + Duration::from_secs(secs.max(1) as u64);
                        self.timers.schedule(sid, TimerKind::Idle, now, Duration::from_secs(secs.max(1) as u64));
                        if let Some(session) = self.sessions.get_mut(sid) {
                            session.set_idle_deadline(deadline);
                        }
                    }

                    if self.stopped {
                        // §4.9: reads still drain so the peer isn't stalled,
                        // but bytes are discarded rather than processed.
                        continue;
                    }

                    if !self.dispatch_process(sid, n) {
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail_session(sid, e);
                    return;
                }
            }
        }
    }

    /// Feeds `n` freshly-read scratch bytes, prepended with whatever the
    /// session carried over from its last call, to `Service::process` in a
    /// loop until it reports needing more data. Any bytes still unconsumed
    /// when that happens are stashed back on the session (spec §4.3: a
    /// return of `0` means the remaining bytes stay buffered, not that they
    /// are discarded) so the next read picks up where this one left off.
    /// Returns `false` if the session was destroyed mid-dispatch.
    fn dispatch_process(&mut self, sid: Sid, n: usize) -> bool {
        let mut buf = match self.sessions.get_mut(sid) {
            Some(session) => session.take_read_carry(),
            None => return false,
        };
        buf.extend_from_slice(&self.scratch[..n]);

        let mut consumed_total = 0usize;
        let destroyed = loop {
            if consumed_total >= buf.len() {
                break false;
            }
            let rc = match self.sessions.get_mut(sid) {
                Some(session) if session.is_alive() => {
                    let ctx = session.ctx().clone();
                    let remaining = &buf[consumed_total..];
                    session.service_mut().process(&ctx, remaining)
                }
                _ => break true,
            };

            if rc < 0 {
                self.fail_session(sid, io::Error::new(io::ErrorKind::InvalidData, "process() reported an error"));
                break true;
            }
            if rc == 0 {
                // Need more data; the remainder stays buffered on the
                // session until the next read brings more bytes in.
                break false;
            }
            consumed_total += rc as usize;
        };

        if !destroyed {
            if let Some(session) = self.sessions.get_mut(sid) {
                if consumed_total < buf.len() {
                    buf.drain(..consumed_total);
                    session.set_read_carry(buf);
                }
            }
        }
        !destroyed
    }

    fn flush_session(&mut self, sid: Sid) {
        let drained = match self.sessions.get_mut(sid) {
            Some(session) => {
                let _ = session.flush();
                session.state() == SessionState::Draining && !session.has_pending_writes()
            }
            None => return,
        };
        if drained {
            self.destroy_session(sid, ShutdownWay::Application);
        }
    }

    fn reregister(&mut self, sid: Sid) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        if !session.is_alive() {
            return;
        }
        let interest = if session.has_pending_writes() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let _ = self.poll.registry().reregister(&mut session.stream, session.token, interest);
    }

    fn fail_session(&mut self, sid: Sid, err: io::Error) {
        let origin = match self.sessions.get(sid) {
            Some(session) => session.origin(),
            None => return,
        };
        let rc = err.raw_os_error().unwrap_or(-1);

        let decision = match self.sessions.get_mut(sid) {
            Some(session) => {
                let ctx = session.ctx().clone();
                session.service_mut().error(&ctx, origin, rc)
            }
            None => return,
        };

        if origin == SessionOrigin::Connected && decision == 0 {
            let now = Instant::now();
            let reconnected = match self.sessions.get_mut(sid) {
                Some(session) => connector::reconnect(&self.poll, session, &mut self.timers, now).is_ok(),
                None => return,
            };
            if reconnected {
                return;
            }
        }
        self.destroy_session(sid, ShutdownWay::Peer);
    }

    // ---- task queue ----------------------------------------------------

    fn drain_tasks(&mut self) {
        for task in self.tasks.drain(MAX_TASKS_PER_ITERATION) {
            self.run_task(task);
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Send { sid, payload } => self.task_send(sid, payload),
            Task::Broadcast { sids, payload } => {
                for sid in sids {
                    self.task_send(sid, payload.clone());
                }
            }
            Task::BroadcastAll { payload } => {
                let sids: Vec<_> = self.sessions.iter().map(|(sid, _)| sid).collect();
                for sid in sids {
                    self.task_send(sid, payload.clone());
                }
            }
            Task::Shutdown { sid } => self.task_shutdown(sid),
            Task::SetTimeout { sid, secs } => self.task_set_timeout(sid, secs),
            Task::SetKeepalive { sid, secs } => self.task_set_keepalive(sid, secs),
            Task::SetService { sid, service, ctx } => self.task_set_service(sid, service, ctx),
            Task::UserPerform { sid, kind, payload, recycle } => self.task_user_perform(sid, kind, payload, recycle),
            Task::Accepted { stream, remote, cb, app_ctx } => self.task_accepted(stream, remote, cb, app_ctx),
            Task::StartConnect { target } => self.task_start_connect(target),
            Task::Associated { stream, cb, app_ctx } => self.task_associated(stream, cb, app_ctx),
            Task::IolayerPerform { payload, run } => run(&self.iocontext, payload),
            Task::InstallAcceptor { acceptor } => {
                if let Err(e) = self.install_acceptor(acceptor) {
                    warn!(worker = self.id, error = %e, "failed to install acceptor");
                }
            }
            Task::SetIoContext { ctx } => self.iocontext = ctx,
            Task::SetTransform { f, ctx } => self.transform = Some((f, ctx)),
            Task::Stop => self.stop(),
            Task::Destroy => {
                self.stop();
                self.destroying = true;
                let sids: Vec<_> = self.sessions.iter().map(|(sid, _)| sid).collect();
                for sid in sids {
                    self.destroy_session(sid, ShutdownWay::Peer);
                }
            }
        }
    }

    fn task_send(&mut self, sid: Sid, payload: Payload) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        if !session.is_alive() {
            return;
        }
        let payload = match payload {
            Payload::Owned(bytes) => {
                let bytes = match &self.transform {
                    Some((f, ctx)) => f(ctx, &bytes),
                    None => bytes,
                };
                let ctx = session.ctx().clone();
                Payload::Owned(session.service_mut().transform(&ctx, &bytes))
            }
            shared @ Payload::Shared(_) => shared,
        };
        session.write_buffer_mut().push(payload);
        self.reregister(sid);
        self.flush_session(sid);
    }

    /// Installs a freshly supplied service and runs its `start` hook — the
    /// common case where a listen/connect/associate callback calls
    /// `set_service` deferred off the placeholder installed at creation, so
    /// `start` must run again on the real service rather than only once on
    /// the placeholder.
    fn task_set_service(&mut self, sid: Sid, service: Box<dyn Service>, ctx: Ctx) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        session.set_service(service, ctx);
        let ctx = session.ctx().clone();
        let rc = session.service_mut().start(&ctx);
        if rc < 0 {
            self.destroy_session(sid, ShutdownWay::Peer);
        }
    }

    fn task_shutdown(&mut self, sid: Sid) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        if session.begin_shutdown() {
            self.destroy_session(sid, ShutdownWay::Application);
        }
    }

    fn task_set_timeout(&mut self, sid: Sid, secs: u32) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        session.set_idle_timeout_secs(secs);
        if secs > 0 {
            let now = Instant::now();
            let deadline = now + Duration::from_secs(secs as u64);
            session.set_idle_deadline(deadline);
            self.timers.schedule(sid, TimerKind::Idle, now, Duration::from_secs(secs as u64));
        }
    }

    fn task_set_keepalive(&mut self, sid: Sid, secs: u32) {
        let Some(session) = self.sessions.get_mut(sid) else { return };
        session.set_keepalive_secs(secs);
        if secs > 0 {
            let now = Instant::now();
            let deadline = now + Duration::from_secs(secs as u64);
            session.set_keepalive_deadline(deadline);
            self.timers.schedule(sid, TimerKind::Keepalive, now, Duration::from_secs(secs as u64));
        }
    }

    fn task_user_perform(&mut self, sid: Sid, kind: i32, payload: Box<dyn std::any::Any + Send>, recycle: Option<RecycleFn>) {
        match self.sessions.get_mut(sid) {
            Some(session) if session.is_alive() => {
                let ctx = session.ctx().clone();
                session.service_mut().perform(&ctx, kind, payload);
            }
            _ => {
                if let Some(recycle) = recycle {
                    recycle(kind, payload);
                }
            }
        }
    }

    fn task_accepted(&mut self, stream: mio::net::TcpStream, remote: SocketAddr, cb: ListenCallback, app_ctx: Ctx) {
        let now = Instant::now();
        let host = remote.ip().to_string();
        let port = remote.port();

        let sid = match self.sessions.insert_with(|sid| {
            Session::new(
                sid,
                stream,
                Token(sid.slot() as usize),
                remote,
                associator::unconfigured(),
                app_ctx.clone(),
                SessionOrigin::Accepted,
                now,
            )
        }) {
            Some(sid) => sid,
            None => {
                warn!(worker = self.id, "accepted connection dropped: session table full");
                return;
            }
        };

        // spec §4.6 step 3→4: run the callback (and `start()`) before the
        // descriptor is ever reactor-readable, so bytes can't reach
        // `associator::unconfigured()`'s discard-everything service in the
        // window between accept and the real service being installed.
        let rc = cb(&app_ctx, &self.iocontext, sid, &host, port);
        if rc < 0 {
            self.destroy_session(sid, ShutdownWay::Peer);
            return;
        }

        let start_rc = match self.sessions.get_mut(sid) {
            Some(session) => {
                let ctx = session.ctx().clone();
                session.service_mut().start(&ctx)
            }
            None => return,
        };
        if start_rc < 0 {
            self.destroy_session(sid, ShutdownWay::Peer);
            return;
        }

        let registered = match self.sessions.get_mut(sid) {
            Some(session) => self.poll.registry().register(&mut session.stream, session.token, Interest::READABLE).is_ok(),
            None => return,
        };
        if !registered {
            let _ = self.sessions.remove(sid);
        }
    }

    fn task_start_connect(&mut self, target: ConnectTarget) {
        let now = Instant::now();
        if connector::start(&self.poll, &mut self.sessions, &mut self.timers, self.iocontext.clone(), target.clone(), now).is_err() {
            warn!(worker = self.id, host = %target.host, port = target.port, "connect attempt failed to start");
            let _ = (target.cb)(&target.app_ctx, &self.iocontext, -1, &target.host, target.port, Sid::INVALID);
        }
    }

    fn task_associated(&mut self, stream: mio::net::TcpStream, cb: AssociateCallback, app_ctx: Ctx) {
        let now = Instant::now();
        let fd = stream.as_raw_fd();
        let sid = match associator::adopt(&mut self.sessions, app_ctx.clone(), stream, now) {
            Ok(sid) => sid,
            Err(e) => {
                warn!(worker = self.id, error = %e, "associate failed");
                return;
            }
        };

        // spec §4.8: the callback (and `start()`) run before the descriptor
        // is installed into the reactor, for the same reason as the accept
        // path above.
        let rc = cb(&app_ctx, &self.iocontext, fd, sid);
        if rc < 0 {
            self.destroy_session(sid, ShutdownWay::Peer);
            return;
        }

        let start_rc = match self.sessions.get_mut(sid) {
            Some(session) => {
                let ctx = session.ctx().clone();
                session.service_mut().start(&ctx)
            }
            None => return,
        };
        if start_rc < 0 {
            self.destroy_session(sid, ShutdownWay::Peer);
            return;
        }

        let registered = match self.sessions.get_mut(sid) {
            Some(session) => self.poll.registry().register(&mut session.stream, session.token, Interest::READABLE).is_ok(),
            None => return,
        };
        if !registered {
            let _ = self.sessions.remove(sid);
        }
    }

    // ---- timers ----------------------------------------------------------

    fn drain_timers(&mut self, now: Instant) {
        let sessions = &self.sessions;
        let fired = self.timers.pop_expired(now, |sid, kind, deadline| {
            let Some(session) = sessions.get(sid) else { return false };
            let is_current_deadline = match kind {
                TimerKind::Idle => session.is_alive() && session.idle_deadline() == Some(deadline),
                TimerKind::Keepalive => session.is_alive() && session.keepalive_deadline() == Some(deadline),
                TimerKind::Connect => session.state() == SessionState::Connecting && session.connect_deadline == Some(deadline),
            };
            is_current_deadline && deadline <= now
        });

        for fire in fired {
            self.fire_timer(fire.sid, fire.kind, now);
        }
    }

    fn fire_timer(&mut self, sid: Sid, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::Idle => {
                let rc = match self.sessions.get_mut(sid) {
                    Some(session) => {
                        let ctx = session.ctx().clone();
                        session.service_mut().timeout(&ctx)
                    }
                    None => return,
                };
                if rc < 0 {
                    self.destroy_session(sid, ShutdownWay::Peer);
                } else if let Some(session) = self.sessions.get_mut(sid) {
                    let secs = session.idle_timeout_secs().unwrap_or(0);
                    if secs > 0 {
                        let deadline = now + Duration::from_secs(secs as u64);
                        session.set_idle_deadline(deadline);
                        self.timers.schedule(sid, TimerKind::Idle, now, Duration::from_secs(secs as u64));
                    }
                }
            }
            TimerKind::Keepalive => {
                let rc = match self.sessions.get_mut(sid) {
                    Some(session) => {
                        let ctx = session.ctx().clone();
                        session.service_mut().keepalive(&ctx)
                    }
                    None => return,
                };
                if rc < 0 {
                    self.destroy_session(sid, ShutdownWay::Peer);
                } else if let Some(session) = self.sessions.get_mut(sid) {
                    let secs = session.keepalive_secs().unwrap_or(0);
                    if secs > 0 {
                        let deadline = now + Duration::from_secs(secs as u64);
                        session.set_keepalive_deadline(deadline);
                        self.timers.schedule(sid, TimerKind::Keepalive, now, Duration::from_secs(secs as u64));
                    }
                }
            }
            TimerKind::Connect => {
                trace!(worker = self.id, %sid, "connect attempt timed out");
                self.finish_connect_failure(sid, io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
        }
    }

    // ---- teardown ----------------------------------------------------------

    fn destroy_session(&mut self, sid: Sid, way: ShutdownWay) {
        if let Some(session) = self.sessions.get_mut(sid) {
            session.mark_dead(way);
        }
        if let Some(mut session) = self.sessions.remove(sid) {
            let _ = self.poll.registry().deregister(&mut session.stream);
        }
    }
}
