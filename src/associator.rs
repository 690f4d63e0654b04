//! Adopting an externally obtained, already-connected descriptor
//! (spec §4.8).
//!
//! Shares its registration shape with the accept path in `worker.rs`
//! (`examples/ryanseipp-rask-old/src/listener.rs`'s `accept` loop, one
//! connection at a time instead of looped): insert into the session table,
//! invoke the callback, then — only once it and `start()` accept the
//! session — register with the reactor.

use std::time::Instant;

use mio::Token;

use crate::error::{Error, Result};
use crate::service::{Ctx, SessionOrigin};
use crate::session::Session;
use crate::table::SessionTable;

/// A no-op placeholder service installed until `set_service` is called —
/// spec §4.8 requires the service to be set explicitly before data flows.
struct UnconfiguredService;

impl crate::service::Service for UnconfiguredService {
    fn process(&mut self, _ctx: &Ctx, buf: &[u8]) -> i32 {
        // No service installed yet: treat all bytes as consumed so they
        // don't pile up forever, but do no work with them.
        buf.len() as i32
    }
}

/// A boxed [`UnconfiguredService`], for sessions awaiting `set_service`
/// from outside this module (e.g. the acceptor's accept path).
pub fn unconfigured() -> Box<dyn crate::service::Service> {
    Box::new(UnconfiguredService)
}

/// Inserts `stream` as a new session without invoking any callback or
/// registering it with the reactor — the caller (the worker, handling
/// `Task::Associated`) is responsible for running the associate callback
/// and, only once it (and `start()`) accept the session, installing the
/// descriptor into the reactor (spec §4.8 step order: callback first, then
/// registration).
pub fn adopt(
    sessions: &mut SessionTable<Session>,
    iocontext: Ctx,
    stream: mio::net::TcpStream,
    now: Instant,
) -> Result<crate::id::Sid> {
    let remote = stream.peer_addr()?;
    let service = Box::new(UnconfiguredService);
    let sid = sessions
        .insert_with(|sid| {
            Session::new(
                sid,
                stream,
                Token(sid.slot() as usize),
                remote,
                service,
                iocontext,
                SessionOrigin::Associated,
                now,
            )
        })
        .ok_or(Error::Overflow)?;
    Ok(sid)
}
