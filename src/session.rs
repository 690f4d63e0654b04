//! Session state and its finite-state machine.
//!
//! Generalizes the teacher's `Connection` (`examples/ryanseipp-rask-old/src/
//! connection.rs`): same shape — a socket, a pending-write queue, and a
//! `closed` flag driving whether the listener's event loop deregisters the
//! descriptor — but replaced `closed: bool` with the four-state machine the
//! spec requires (`Connecting` / `Alive` / `Draining` / `Dead`), since a
//! binary "open vs closed" can't express draining-after-shutdown.

use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Token;

use crate::buffer::WriteBuffer;
use crate::id::Sid;
use crate::service::{Ctx, Service, SessionOrigin, ShutdownWay};
use crate::task::ConnectTarget;

/// Where a session currently sits in its lifecycle (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Outbound connect in flight; not yet confirmed writable.
    Connecting,
    /// Live and eligible for reads, writes, and callbacks.
    Alive,
    /// Shutdown requested while the write buffer was non-empty; still
    /// flushing, no longer accepting new writes.
    Draining,
    /// Terminal. `Service::shutdown` has been invoked exactly once.
    Dead,
}

/// One connection's full state, owned exclusively by its worker thread.
pub struct Session {
    sid: Sid,
    pub(crate) stream: TcpStream,
    pub(crate) token: Token,
    remote: SocketAddr,
    service: Box<dyn Service>,
    ctx: Ctx,
    origin: SessionOrigin,
    write_buffer: WriteBuffer,
    /// Bytes read off the wire but not yet consumed by `Service::process`,
    /// because it returned `0` (need more data) partway through the last
    /// read. Prepended to the next read's bytes before dispatch.
    read_carry: Vec<u8>,
    state: SessionState,
    idle_timeout_secs: Option<u32>,
    keepalive_secs: Option<u32>,
    /// Deadline of the most recently scheduled idle timer, used to tell a
    /// live heap entry apart from one superseded by a later reschedule.
    idle_deadline: Option<Instant>,
    /// Deadline of the most recently scheduled keepalive timer, same role
    /// as `idle_deadline`.
    keepalive_deadline: Option<Instant>,
    /// Deadline of the in-flight connect attempt's timeout, if any.
    pub(crate) connect_deadline: Option<Instant>,
    last_recv: Instant,
    /// Set when a connected session's `error` callback asked for a retry;
    /// consumed by the connector's reconnect path.
    pub(crate) pending_reconnect: bool,
    /// Remote target this session was `connect`ed to, retained so a
    /// reconnect can reissue the same attempt (spec §4.7).
    pub(crate) connect_target: Option<ConnectTarget>,
}

impl Session {
    /// Creates a new session in `Connecting` or `Alive` state depending on
    /// origin — accepted/associated sessions start `Alive` directly, per
    /// spec §4.2.
    pub fn new(
        sid: Sid,
        stream: TcpStream,
        token: Token,
        remote: SocketAddr,
        service: Box<dyn Service>,
        ctx: Ctx,
        origin: SessionOrigin,
        now: Instant,
    ) -> Self {
        let state = match origin {
            SessionOrigin::Connected => SessionState::Connecting,
            SessionOrigin::Accepted | SessionOrigin::Associated => SessionState::Alive,
        };
        Self {
            sid,
            stream,
            token,
            remote,
            service,
            ctx,
            origin,
            write_buffer: WriteBuffer::new(),
            read_carry: Vec::new(),
            state,
            idle_timeout_secs: None,
            keepalive_secs: None,
            idle_deadline: None,
            keepalive_deadline: None,
            connect_deadline: None,
            last_recv: now,
            pending_reconnect: false,
            connect_target: None,
        }
    }

    /// The id this session was assigned.
    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// The current FSM state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session will accept new `process` dispatch and writes.
    pub fn is_alive(&self) -> bool {
        matches!(self.state, SessionState::Alive | SessionState::Draining)
    }

    /// Whether the session is terminal.
    pub fn is_dead(&self) -> bool {
        self.state == SessionState::Dead
    }

    /// Remote endpoint captured at accept/connect/associate time.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// How this session was created.
    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    /// The session's own opaque context, passed to every `Service` call.
    pub fn ctx(&self) -> &Ctx {
        &self.ctx
    }

    /// Replaces the service vtable and context, e.g. `set_service` called
    /// from inside an `associate` callback.
    pub fn set_service(&mut self, service: Box<dyn Service>, ctx: Ctx) {
        self.service = service;
        self.ctx = ctx;
    }

    /// Mutable access to the installed service, for dispatching callbacks.
    pub fn service_mut(&mut self) -> &mut dyn Service {
        self.service.as_mut()
    }

    /// Mutable access to the pending write queue.
    pub fn write_buffer_mut(&mut self) -> &mut WriteBuffer {
        &mut self.write_buffer
    }

    /// Takes ownership of whatever bytes `process` left unconsumed on its
    /// last call, leaving the session's carry empty.
    pub fn take_read_carry(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_carry)
    }

    /// Stores bytes `process` hasn't consumed yet, to be prepended to the
    /// next read.
    pub fn set_read_carry(&mut self, carry: Vec<u8>) {
        self.read_carry = carry;
    }

    /// Flushes as much of the write buffer as the socket currently accepts.
    /// A method on `Session` itself so the borrow checker sees
    /// `write_buffer` and `stream` as the disjoint fields they are — a
    /// caller holding separate `&mut` borrows to each can't call this.
    pub fn flush(&mut self) -> std::io::Result<usize> {
        self.write_buffer.flush_to(&mut self.stream)
    }

    /// Whether the write buffer currently has anything queued.
    pub fn has_pending_writes(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    /// Idle-timeout duration in seconds, if configured.
    pub fn idle_timeout_secs(&self) -> Option<u32> {
        self.idle_timeout_secs
    }

    /// Sets the idle-timeout duration; `0` disables it.
    pub fn set_idle_timeout_secs(&mut self, secs: u32) {
        self.idle_timeout_secs = if secs == 0 { None } else { Some(secs) };
        if secs == 0 {
            self.idle_deadline = None;
        }
    }

    /// Keepalive interval in seconds, if configured.
    pub fn keepalive_secs(&self) -> Option<u32> {
        self.keepalive_secs
    }

    /// Sets the keepalive interval; `0` disables it.
    pub fn set_keepalive_secs(&mut self, secs: u32) {
        self.keepalive_secs = if secs == 0 { None } else { Some(secs) };
        if secs == 0 {
            self.keepalive_deadline = None;
        }
    }

    /// The deadline of the idle timer entry that is still current, if any.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    /// Records the deadline of a freshly (re)scheduled idle timer,
    /// superseding whatever heap entry came before it.
    pub fn set_idle_deadline(&mut self, deadline: Instant) {
        self.idle_deadline = Some(deadline);
    }

    /// The deadline of the keepalive timer entry that is still current, if
    /// any.
    pub fn keepalive_deadline(&self) -> Option<Instant> {
        self.keepalive_deadline
    }

    /// Records the deadline of a freshly (re)scheduled keepalive timer.
    pub fn set_keepalive_deadline(&mut self, deadline: Instant) {
        self.keepalive_deadline = Some(deadline);
    }

    /// Timestamp of the most recent successful read.
    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    /// Records that bytes were just received, resetting the idle clock.
    pub fn mark_received(&mut self, now: Instant) {
        self.last_recv = now;
    }

    /// Confirms an in-flight outbound connect succeeded.
    pub fn mark_connected(&mut self) {
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.state = SessionState::Alive;
    }

    /// Drops back into `Connecting` after `error` requested a reconnect
    /// and a fresh attempt has been issued on a new descriptor.
    pub fn begin_reconnect(&mut self) {
        self.state = SessionState::Connecting;
        self.pending_reconnect = false;
    }

    /// Requests a graceful shutdown. If the write buffer is empty the
    /// session dies immediately (caller should follow with
    /// [`Session::mark_dead`]); otherwise it enters `Draining` and dies
    /// once the buffer flushes.
    ///
    /// Returns `true` if the caller should finalize the session as dead
    /// right away.
    pub fn begin_shutdown(&mut self) -> bool {
        if self.state == SessionState::Dead {
            return false;
        }
        if self.write_buffer.is_empty() {
            true
        } else {
            self.state = SessionState::Draining;
            false
        }
    }

    /// Transitions to `Dead`, invoking `Service::shutdown` exactly once.
    /// Calling this on an already-dead session is a no-op, satisfying the
    /// "exactly once" invariant under repeated teardown paths.
    pub fn mark_dead(&mut self, way: ShutdownWay) {
        if self.state == SessionState::Dead {
            return;
        }
        self.state = SessionState::Dead;
        self.write_buffer.discard();
        self.service.shutdown(&self.ctx, way);
    }
}
