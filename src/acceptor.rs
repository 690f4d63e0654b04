//! The listen-side acceptor.
//!
//! Shaped directly after the teacher's `Listener::accept`
//! (`examples/ryanseipp-rask-old/src/listener.rs`): a loop over
//! `TcpListener::accept` until `WouldBlock`, registered at a reserved
//! `Token` on one worker's `Poll`. The difference from the teacher is what
//! happens next — instead of keeping the connection on the accepting
//! worker, each one is hashed round-robin across every worker via its
//! `TaskSender`, per spec §4.6.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::net::TcpListener;

use crate::service::Ctx;
use crate::task::{ListenCallback, Task, TaskSender};

/// Reserved token the acceptor's listening socket is registered under.
pub const LISTEN_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Bound to one host:port; distributes accepted connections round-robin
/// across every worker's task queue.
pub struct Acceptor {
    listener: TcpListener,
    workers: Vec<TaskSender>,
    next: Arc<AtomicUsize>,
    cb: ListenCallback,
    app_ctx: Ctx,
}

impl Acceptor {
    /// Binds `addr` and prepares to fan accepted connections out to
    /// `workers`, starting from a shared round-robin cursor.
    pub fn bind(
        addr: SocketAddr,
        workers: Vec<TaskSender>,
        next: Arc<AtomicUsize>,
        cb: ListenCallback,
        app_ctx: Ctx,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, workers, next, cb, app_ctx })
    }

    /// The underlying listening socket, for registration with a worker's
    /// `Poll` at [`LISTEN_TOKEN`].
    pub fn socket_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accepts every ready connection and hands each to the next worker in
    /// round-robin order. Stops cleanly on `WouldBlock`; any other error
    /// is logged and the loop continues, matching the teacher's stance
    /// that one bad accept should not take down the listener.
    pub fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, remote)) => self.dispatch(stream, remote),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(error = %e, "acceptor: accept() failed");
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, stream: mio::net::TcpStream, remote: SocketAddr) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let task = Task::Accepted {
            stream,
            remote,
            cb: self.cb.clone(),
            app_ctx: self.app_ctx.clone(),
        };
        if let Err((err, _task)) = self.workers[idx].send(task) {
            tracing::warn!(%err, worker = idx, "acceptor: failed to hand off accepted connection");
        }
    }
}
