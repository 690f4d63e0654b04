//! The public dispatch facade: the `Layer` handle the embedding
//! application holds, and every operation in its external interface.
//!
//! Grounded in the teacher's `Server`/`MultiListener` construction
//! (`examples/ryanseipp-rask-old/src/lib.rs`,
//! `examples/ryanseipp-rask-old/src/multilistener.rs`): a fixed pool of
//! worker threads spun up once, each handed a channel endpoint the facade
//! uses afterward. This generalizes "spawn N identical HTTP workers" to
//! "spawn N identical session-multiplexer workers and route every call by
//! `sid`".

use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::warn;

use crate::acceptor::Acceptor;
use crate::buffer::Payload;
use crate::error::{Error, Result};
use crate::id::Sid;
use crate::service::{Ctx, Service};
use crate::table::Liveness;
use crate::task::{
    AssociateCallback, CloneFn, ConnectCallback, ConnectTarget, ListenCallback, PerformFn, RecycleFn, Task, TaskSender,
    TransformFn,
};
use crate::worker::Worker;

/// Construction parameters for [`Layer::create`].
///
/// Corresponds to `create(nthreads, nclients, realtime)`'s argument list
/// (spec §6), pulled into a named struct in the teacher's
/// `ServerConfig`/`Config` style rather than a positional tuple.
#[derive(Debug, Clone, Copy)]
pub struct LayerConfig {
    /// Number of I/O worker threads. Must be at least 1.
    pub nthreads: u8,
    /// Total session capacity across all workers; divided evenly
    /// (rounded up) into each worker's table.
    pub nclients: usize,
    /// When true, workers clamp their reactor wait to a short ceiling even
    /// with no timers pending, trading idle CPU for lower coalescing
    /// latency (spec §10, supplemented).
    pub realtime: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self { nthreads: 4, nclients: 4096, realtime: false }
    }
}

struct WorkerHandle {
    sender: TaskSender,
    liveness: Liveness,
    join: Option<JoinHandle<()>>,
}

/// The opaque layer handle. Cheap to clone — every field is either
/// `Arc`-shared or `Copy` — so it can be handed to every thread that needs
/// to submit work.
pub struct Layer {
    workers: Vec<WorkerHandle>,
    accept_cursor: Arc<AtomicUsize>,
    connect_cursor: Arc<AtomicUsize>,
}

impl Layer {
    /// Spawns `config.nthreads` worker threads, each with its own reactor,
    /// session table (sized `nclients / nthreads`, rounded up), and task
    /// queue. Mirrors the teacher's eager "spawn everything at construction
    /// time" shape.
    pub fn create(config: LayerConfig) -> Result<Self> {
        if config.nthreads == 0 {
            return Err(Error::InvalidArgument("nthreads must be at least 1"));
        }
        let per_worker_capacity = config.nclients.div_ceil(config.nthreads as usize).max(1);

        let mut workers = Vec::with_capacity(config.nthreads as usize);
        for id in 0..config.nthreads {
            let placeholder_ctx: Ctx = Arc::new(());
            let mut worker = Worker::new(id, per_worker_capacity, placeholder_ctx, config.realtime)?;
            let sender = worker.sender();
            let liveness = worker.liveness();
            let join = std::thread::Builder::new()
                .name(format!("iolayer-worker-{id}"))
                .spawn(move || worker.run())
                .map_err(Error::Io)?;
            workers.push(WorkerHandle { sender, liveness, join: Some(join) });
        }

        Ok(Self {
            workers,
            accept_cursor: Arc::new(AtomicUsize::new(0)),
            connect_cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Resolves `sid` to its owning worker, rejecting both structurally
    /// invalid worker indices and slots that are no longer live — the
    /// latter via [`Liveness`], so `send`/`shutdown`/`perform`/etc. against
    /// an already-shutdown `sid` return `NotFound` synchronously rather
    /// than silently enqueuing a task the worker would just drop (spec §7,
    /// §8's NotFound-after-shutdown property).
    fn sender_for(&self, sid: Sid) -> Result<&WorkerHandle> {
        let worker = self.workers.get(sid.worker() as usize).ok_or(Error::NotFound)?;
        if !worker.liveness.contains(sid) {
            return Err(Error::NotFound);
        }
        Ok(worker)
    }

    fn send_task(&self, sid: Sid, task: Task) -> Result<()> {
        self.sender_for(sid)?.sender.send(task).map_err(|(e, _)| e)
    }

    fn all_senders(&self) -> Vec<TaskSender> {
        self.workers.iter().map(|w| w.sender.clone()).collect()
    }

    /// `set_iocontext(layer, ctxs[], count)`: installs one opaque context
    /// per worker, read-only from then on (spec §5). `ctxs.len()` must
    /// equal the worker count.
    pub fn set_iocontext(&self, ctxs: Vec<Ctx>) -> Result<()> {
        if ctxs.len() != self.workers.len() {
            return Err(Error::InvalidArgument("ctxs.len() must equal nthreads"));
        }
        for (worker, ctx) in self.workers.iter().zip(ctxs) {
            worker.sender.send(Task::SetIoContext { ctx }).map_err(|(e, _)| e)?;
        }
        Ok(())
    }

    /// `set_transform(layer, fn, ctx)`: installs the layer-wide pre-send
    /// byte transform on every worker.
    pub fn set_transform(&self, f: TransformFn, ctx: Ctx) -> Result<()> {
        for worker in &self.workers {
            worker.sender.send(Task::SetTransform { f: f.clone(), ctx: ctx.clone() }).map_err(|(e, _)| e)?;
        }
        Ok(())
    }

    /// `listen(layer, host, port, cb, ctx)`: binds synchronously on the
    /// calling thread, then hands the bound listener to the first worker
    /// for registration — accepted connections are fanned out round-robin
    /// to every worker regardless of which one owns the listening socket
    /// (spec §4.6).
    pub fn listen(&self, host: &str, port: u16, cb: ListenCallback, ctx: Ctx) -> Result<()> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| Error::InvalidArgument("listen address must be a literal ip:port"))?;
        let acceptor = Acceptor::bind(addr, self.all_senders(), self.accept_cursor.clone(), cb, ctx)?;
        self.workers[0].sender.send(Task::InstallAcceptor { acceptor }).map_err(|(e, _)| e)
    }

    /// `connect(layer, host, port, secs, cb, ctx)`: issues the attempt on a
    /// worker chosen round-robin, which owns it for its full lifetime
    /// (spec §4.7).
    pub fn connect(&self, host: &str, port: u16, timeout_secs: u32, cb: ConnectCallback, ctx: Ctx) -> Result<()> {
        let idx = self.connect_cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let target = ConnectTarget { host: host.to_string(), port, timeout_secs, cb, app_ctx: ctx };
        self.workers[idx].sender.send(Task::StartConnect { target }).map_err(|(e, _)| e)
    }

    /// `associate(layer, fd, cb, ctx)`: adopts an externally obtained,
    /// already-connected descriptor on a worker chosen round-robin.
    ///
    /// # Safety
    /// `fd` must be a valid, open, connected TCP socket descriptor not
    /// owned by any other part of the process — ownership transfers to the
    /// layer, which will close it when the resulting session dies.
    pub unsafe fn associate(&self, fd: RawFd, cb: AssociateCallback, ctx: Ctx) -> Result<()> {
        use std::os::fd::FromRawFd;
        let stream = mio::net::TcpStream::from_raw_fd(fd);
        let idx = self.connect_cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx].sender.send(Task::Associated { stream, cb, app_ctx: ctx }).map_err(|(e, _)| e)
    }

    /// `set_timeout(layer, sid, secs)`. `secs == 0` disables the idle timer.
    pub fn set_timeout(&self, sid: Sid, secs: u32) -> Result<()> {
        self.send_task(sid, Task::SetTimeout { sid, secs })
    }

    /// `set_keepalive(layer, sid, secs)`. `secs == 0` disables keepalive.
    pub fn set_keepalive(&self, sid: Sid, secs: u32) -> Result<()> {
        self.send_task(sid, Task::SetKeepalive { sid, secs })
    }

    /// `set_service(layer, sid, svc, ctx)` — typically called from inside
    /// a listen/connect/associate callback, which runs on the target
    /// session's own worker, so this enqueues rather than executing
    /// inline; the session cannot receive data until the task is drained,
    /// which happens before the worker moves on to the next readiness
    /// event (spec §5 re-entrancy note).
    pub fn set_service(&self, sid: Sid, service: Box<dyn Service>, ctx: Ctx) -> Result<()> {
        self.send_task(sid, Task::SetService { sid, service, ctx })
    }

    /// `send(layer, sid, buf, n, isfree)`. `payload` carries the
    /// ownership choice: [`Payload::owned`] for `isfree=1`,
    /// [`Payload::copied`] for `isfree=0`.
    pub fn send(&self, sid: Sid, payload: Payload) -> Result<()> {
        self.send_task(sid, Task::Send { sid, payload })
    }

    /// `broadcast(layer, sids[], count, buf, n)`: wraps `buf` once in a
    /// ref-counted [`Payload::Shared`] and fans it to each listed session's
    /// worker, grouped to send one task per worker rather than one per
    /// session.
    pub fn broadcast(&self, sids: &[Sid], buf: &[u8]) -> Result<()> {
        let payload = Payload::shared(Arc::from(buf));
        let mut by_worker: Vec<Vec<Sid>> = vec![Vec::new(); self.workers.len()];
        for &sid in sids {
            if let Some(bucket) = by_worker.get_mut(sid.worker() as usize) {
                bucket.push(sid);
            }
        }
        for (idx, bucket) in by_worker.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            self.workers[idx]
                .sender
                .send(Task::Broadcast { sids: bucket, payload: payload.clone() })
                .map_err(|(e, _)| e)?;
        }
        Ok(())
    }

    /// `broadcast2(layer, buf, n)`: every session on every worker.
    pub fn broadcast2(&self, buf: &[u8]) -> Result<()> {
        let payload = Payload::shared(Arc::from(buf));
        for worker in &self.workers {
            worker.sender.send(Task::BroadcastAll { payload: payload.clone() }).map_err(|(e, _)| e)?;
        }
        Ok(())
    }

    /// `shutdown(layer, sid)`: triggers `shutdown(way=Application)` once
    /// the write buffer (if any) drains.
    pub fn shutdown(&self, sid: Sid) -> Result<()> {
        self.send_task(sid, Task::Shutdown { sid })
    }

    /// `shutdowns(layer, sids[], n)`: convenience wrapper over
    /// [`Self::shutdown`]; per-session ordering is preserved, but there is
    /// no ordering guarantee across sessions (spec §5).
    pub fn shutdowns(&self, sids: &[Sid]) -> Result<()> {
        for &sid in sids {
            self.shutdown(sid)?;
        }
        Ok(())
    }

    /// `perform(layer, sid, type, task, recycle)`: delivered to the
    /// session's `Service::perform` on its owning worker.
    pub fn perform(&self, sid: Sid, kind: i32, task: Box<dyn Any + Send>, recycle: Option<RecycleFn>) -> Result<()> {
        self.send_task(sid, Task::UserPerform { sid, kind, payload: task, recycle })
    }

    /// `perform2(layer, task, clone, fn)`: runs once per worker. `clone` is
    /// invoked `nthreads - 1` times to produce independent copies; the
    /// original is handed to the last worker unmodified.
    pub fn perform2(&self, task: Box<dyn Any + Send + Sync>, clone: CloneFn, run: PerformFn) -> Result<()> {
        let n = self.workers.len();
        if n == 0 {
            return Ok(());
        }
        let mut task = Some(task);
        for (idx, worker) in self.workers.iter().enumerate() {
            let payload = if idx + 1 == n {
                task.take().expect("original task reserved for the last worker")
            } else {
                clone(task.as_deref().expect("original retained until the last worker"))
            };
            worker.sender.send(Task::IolayerPerform { payload, run: run.clone() }).map_err(|(e, _)| e)?;
        }
        Ok(())
    }

    /// `stop(layer)`: reversible-in-name-only quiesce (spec §9 records the
    /// open question; this implementation treats it as one-shot, consistent
    /// with the stated "leading to destroy" contract). Idempotent per
    /// worker.
    pub fn stop(&self) {
        for worker in &self.workers {
            if let Err((e, _)) = worker.sender.send(Task::Stop) {
                warn!(error = %e, "stop: worker queue already closed");
            }
        }
    }

    /// `destroy(layer)`: signals every worker to kill its remaining
    /// sessions with `ShutdownWay::Peer` and exit its loop, then joins
    /// every worker thread. Consumes the handle — there is no restart.
    pub fn destroy(mut self) {
        for worker in &self.workers {
            if let Err((e, _)) = worker.sender.send(Task::Destroy) {
                warn!(error = %e, "destroy: worker queue already closed");
            }
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}
