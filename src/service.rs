//! The per-session service vtable and the types exchanged across it.
//!
//! Corresponds to `ioservice_t` in the original header
//! (`examples/original_source/include/network.h`): a capability set of
//! upcalls the layer invokes as a session's life advances. The teacher
//! crate expresses a comparable capability set as the `Connection` trait
//! (`examples/ryanseipp-rask-old/src/connection.rs`); this trait generalizes
//! that shape from "parse HTTP, prepare a response" to "hand the service raw
//! bytes and let it decide".

use std::any::Any;
use std::sync::Arc;

/// Type-erased context shared with service callbacks.
///
/// Stands in for the original API's `void *context`: an opaque pointer the
/// embedder attaches at registration time and gets back on every callback.
/// Concrete code downcasts with [`Any::downcast_ref`].
pub type Ctx = Arc<dyn Any + Send + Sync>;

/// Why a session reached `Dead` and had `Service::shutdown` invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownWay {
    /// The application called `shutdown`/`shutdowns`, or a `perform` task
    /// chose to terminate the session.
    Application,
    /// The layer terminated the session on its own: peer close, I/O error,
    /// timeout, or a non-reconnecting `error` return.
    Peer,
}

/// How a session came to exist, needed because [`Service::error`]'s
/// reconnect contract differs by origin (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Created by the acceptor from an inbound connection.
    Accepted,
    /// Created by the connector from an outbound connect.
    Connected,
    /// Adopted from a pre-existing descriptor via `associate`.
    Associated,
}

/// Per-session capability set, installed via `set_service` (or at
/// registration time for sessions that set it up front).
///
/// Every method runs synchronously on the session's owning worker thread
/// and must not block — see the concurrency model in the spec this crate
/// implements.
pub trait Service: Send {
    /// Called once, after the descriptor is registered with the reactor. A
    /// return `< 0` destroys the session before any data is delivered.
    fn start(&mut self, ctx: &Ctx) -> i32 {
        let _ = ctx;
        0
    }

    /// Called with the next contiguous chunk of unconsumed bytes. Returns
    /// the number of bytes consumed: `0` means "need more data" and the
    /// remainder stays buffered; `< 0` is an unrecoverable parse error,
    /// surfaced identically to an I/O error.
    fn process(&mut self, ctx: &Ctx, buf: &[u8]) -> i32;

    /// Invoked before bytes cross into the write buffer, once per `send`
    /// (or none, if no transform is installed). Must not mutate `buf` in
    /// place if it intends to return a different buffer: the layer treats
    /// this as pure.
    fn transform(&mut self, ctx: &Ctx, buf: &[u8]) -> Vec<u8> {
        let _ = ctx;
        buf.to_vec()
    }

    /// Fired on the configured keepalive cadence, independent of traffic.
    /// A return `< 0` transitions the session to `Dead` with
    /// [`ShutdownWay::Peer`].
    fn keepalive(&mut self, ctx: &Ctx) -> i32 {
        let _ = ctx;
        0
    }

    /// Fired when no bytes have been received within the configured idle
    /// timeout. A return `< 0` transitions to `Dead`; `>= 0` resets the
    /// idle clock.
    fn timeout(&mut self, ctx: &Ctx) -> i32 {
        let _ = ctx;
        -1
    }

    /// Fired on I/O failure. For [`SessionOrigin::Connected`] sessions, a
    /// return of `0` requests the connector retry the same host:port; any
    /// other return (and any return for non-connected origins) destroys
    /// the session with [`ShutdownWay::Peer`].
    fn error(&mut self, ctx: &Ctx, origin: SessionOrigin, rc: i32) -> i32 {
        let _ = (ctx, origin, rc);
        -1
    }

    /// Delivers a cross-thread task submitted via `perform`/`perform2`.
    fn perform(&mut self, ctx: &Ctx, kind: i32, task: Box<dyn Any + Send>) {
        let _ = (ctx, kind, task);
    }

    /// Invoked exactly once, on entry to `Dead`.
    fn shutdown(&mut self, ctx: &Ctx, way: ShutdownWay) {
        let _ = (ctx, way);
    }
}
