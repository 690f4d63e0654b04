//! Cross-thread task queue: the callback types a `Layer` hands to workers,
//! and the per-worker MPSC channel + wakeup pair that carries them.
//!
//! Grounded directly in the teacher's own cross-thread plumbing
//! (`examples/ryanseipp-rask-old/src/listener.rs`,
//! `examples/ryanseipp-rask-old/src/worker.rs`): a `crossbeam_channel`
//! `Sender`/`Receiver` pair plus a `mio::Waker` so a producer thread can
//! wake a blocked `Poll::poll`. The teacher uses this to hand accepted
//! connections to workers and to hand closed tokens back to the listener;
//! this generalizes it to the full task vocabulary of spec §3.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use mio::net::TcpStream;
use mio::Waker;

use crate::acceptor::Acceptor;
use crate::buffer::Payload;
use crate::error::Error;
use crate::id::Sid;
use crate::service::{Ctx, Service};

/// `cb(app_ctx, iocontext, sid, host, port) -> i32`, invoked on the worker
/// that owns the newly accepted/associated session.
pub type ListenCallback = Arc<dyn Fn(&Ctx, &Ctx, Sid, &str, u16) -> i32 + Send + Sync>;

/// `cb(app_ctx, iocontext, result, host, port, sid) -> i32`.
pub type ConnectCallback = Arc<dyn Fn(&Ctx, &Ctx, i32, &str, u16, Sid) -> i32 + Send + Sync>;

/// `cb(app_ctx, iocontext, fd, sid) -> i32`.
pub type AssociateCallback = Arc<dyn Fn(&Ctx, &Ctx, i32, Sid) -> i32 + Send + Sync>;

/// Pre-send byte transform installed layer-wide via `set_transform`.
pub type TransformFn = Arc<dyn Fn(&Ctx, &[u8]) -> Vec<u8> + Send + Sync>;

/// Reclaims a `perform` task's payload after a failed submission.
pub type RecycleFn = Arc<dyn Fn(i32, Box<dyn Any + Send>) + Send + Sync>;

/// Clones a `perform2` task once per additional worker.
pub type CloneFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Runs a cloned `perform2` task on one worker with that worker's context.
pub type PerformFn = Arc<dyn Fn(&Ctx, Box<dyn Any + Send + Sync>) + Send + Sync>;

/// The destination a `connect` attempt is aimed at, retained on the session
/// so a reconnect (spec §4.7) can reissue the same attempt without the
/// caller resubmitting anything.
#[derive(Clone)]
pub struct ConnectTarget {
    /// Remote host, as given to `connect`.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Per-attempt connect timeout.
    pub timeout_secs: u32,
    /// Invoked once per attempt with the outcome.
    pub cb: ConnectCallback,
    /// Application context forwarded to `cb`.
    pub app_ctx: Ctx,
}

/// A unit of cross-thread work addressed to one worker.
pub enum Task {
    /// Append `payload` to `sid`'s write buffer.
    Send { sid: Sid, payload: Payload },
    /// Append `payload` to each listed session's write buffer.
    Broadcast { sids: Vec<Sid>, payload: Payload },
    /// Append `payload` to every session this worker owns.
    BroadcastAll { payload: Payload },
    /// Begin graceful shutdown of `sid` (`ShutdownWay::Application`).
    Shutdown { sid: Sid },
    /// `set_timeout`, submitted from outside a service callback.
    SetTimeout { sid: Sid, secs: u32 },
    /// `set_keepalive`, submitted from outside a service callback.
    SetKeepalive { sid: Sid, secs: u32 },
    /// `set_service`, submitted from outside a service callback.
    SetService { sid: Sid, service: Box<dyn Service>, ctx: Ctx },
    /// A `perform` task addressed to one session.
    UserPerform {
        sid: Sid,
        kind: i32,
        payload: Box<dyn Any + Send>,
        recycle: Option<RecycleFn>,
    },
    /// A fresh inbound connection handed off by the acceptor.
    Accepted {
        stream: TcpStream,
        remote: SocketAddr,
        cb: ListenCallback,
        app_ctx: Ctx,
    },
    /// Request this worker start (or restart) an outbound connect.
    StartConnect { target: ConnectTarget },
    /// An externally obtained descriptor to adopt.
    Associated {
        stream: TcpStream,
        cb: AssociateCallback,
        app_ctx: Ctx,
    },
    /// A `perform2` task, already cloned for this specific worker.
    IolayerPerform {
        payload: Box<dyn Any + Send + Sync>,
        run: PerformFn,
    },
    /// Installs a bound acceptor on this worker's reactor (`listen`).
    InstallAcceptor { acceptor: Acceptor },
    /// Replaces this worker's per-thread context (`set_iocontext`).
    SetIoContext { ctx: Ctx },
    /// Installs the layer-wide transform hook (`set_transform`).
    SetTransform { f: TransformFn, ctx: Ctx },
    /// Enters quiesce on this worker (`stop`, spec §4.9).
    Stop,
    /// Enters the terminal phase on this worker (`destroy`, spec §4.9):
    /// detaches the acceptor and kills every remaining session with
    /// `ShutdownWay::Peer` once the task queue has drained.
    Destroy,
}

/// One worker's inbound task queue: an MPSC channel plus the `mio::Waker`
/// needed to interrupt a blocked `Poll::poll`.
pub struct TaskQueue {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    waker: Arc<Waker>,
}

impl TaskQueue {
    /// Builds a new queue paired with the given waker (registered by the
    /// worker against its own `Poll` at a reserved token).
    pub fn new(waker: Arc<Waker>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver, waker }
    }

    /// A cloneable handle producers use to submit tasks to this worker.
    pub fn sender(&self) -> TaskSender {
        TaskSender { sender: self.sender.clone(), waker: self.waker.clone() }
    }

    /// Whether anything is currently queued, without removing it — used to
    /// decide whether the reactor should poll with a zero timeout.
    pub fn has_pending(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Drains up to `max` queued tasks without blocking — bounded per the
    /// worker's event loop iteration so a busy queue can't starve I/O
    /// (spec §4.3 step 4).
    pub fn drain(&self, max: usize) -> Vec<Task> {
        let mut out = Vec::with_capacity(max.min(64));
        for _ in 0..max {
            match self.receiver.try_recv() {
                Ok(task) => out.push(task),
                Err(_) => break,
            }
        }
        out
    }
}

/// A cloneable producer handle for one worker's task queue.
#[derive(Clone)]
pub struct TaskSender {
    sender: Sender<Task>,
    waker: Arc<Waker>,
}

impl TaskSender {
    /// Enqueues `task`, waking the worker's reactor so it's seen promptly.
    ///
    /// Returns [`Error::QueueRejected`] if the worker has shut down its
    /// receiving end (teardown in progress); the caller is responsible for
    /// invoking any `recycle` hook on the returned task.
    pub fn send(&self, task: Task) -> Result<(), (Error, Task)> {
        match self.sender.try_send(task) {
            Ok(()) => {
                let _ = self.waker.wake();
                Ok(())
            }
            Err(TrySendError::Disconnected(task)) => Err((Error::QueueRejected, task)),
            Err(TrySendError::Full(task)) => Err((Error::QueueRejected, task)),
        }
    }
}
