//! Outbound connect handling: nonblocking connect, write-readiness based
//! completion detection, and the per-attempt deadline + reconnect policy
//! of spec §4.7.
//!
//! Grounded in the teacher's `TcpStream` trait
//! (`examples/ryanseipp-rask-old/src/net/tcp_stream.rs`), which already
//! abstracts `connect`/`take_error` the way this module needs; here we use
//! `mio::net::TcpStream::connect` directly since the core never needs to
//! run over a non-mio transport the way the teacher's HTTP layer did.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::{Interest, Token};

use crate::error::{Error, Result};
use crate::service::{Ctx, SessionOrigin};
use crate::session::Session;
use crate::table::SessionTable;
use crate::task::ConnectTarget;
use crate::timer::{TimerKind, TimerQueue};

/// Parses `host:port` into a concrete address.
///
/// DNS resolution is explicitly out of scope (spec §1): callers pass an
/// address the embedding process has already resolved. A bare IP literal
/// is the only accepted form.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse::<SocketAddr>()
        .map_err(|_| Error::InvalidArgument("connect target must be a literal ip:port"))
}

/// Issues a nonblocking connect and registers the session for
/// write-readiness, plus a connect-deadline timer.
pub fn start(
    poll: &mio::Poll,
    sessions: &mut SessionTable<Session>,
    timers: &mut TimerQueue,
    iocontext: Ctx,
    target: ConnectTarget,
    now: Instant,
) -> Result<()> {
    let addr = resolve(&target.host, target.port)?;
    let stream = mio::net::TcpStream::connect(addr)?;

    let service = Box::new(PendingConnectService);
    let sid = sessions
        .insert_with(|sid| {
            Session::new(
                sid,
                stream,
                Token(sid.slot() as usize),
                addr,
                service,
                iocontext,
                SessionOrigin::Connected,
                now,
            )
        })
        .ok_or(Error::Overflow)?;

    let session = sessions.get_mut(sid).expect("just inserted");
    poll.registry()
        .register(&mut session.stream, session.token, Interest::WRITABLE)?;
    session.connect_target = Some(target.clone());

    let interval = Duration::from_secs(target.timeout_secs.max(1) as u64);
    session.connect_deadline = Some(now + interval);
    timers.schedule(sid, TimerKind::Connect, now, interval);
    Ok(())
}

/// Re-issues the same attempt after `Service::error` asked for a retry,
/// reusing the session's `sid` (spec §4.7: "the layer retains the session
/// object").
pub fn reconnect(
    poll: &mio::Poll,
    session: &mut Session,
    timers: &mut TimerQueue,
    now: Instant,
) -> Result<()> {
    let target = session
        .connect_target
        .clone()
        .expect("reconnect only valid for connected-origin sessions");

    let _ = poll.registry().deregister(&mut session.stream);
    let addr = resolve(&target.host, target.port)?;
    let mut stream = mio::net::TcpStream::connect(addr)?;
    poll.registry().register(&mut stream, session.token, Interest::WRITABLE)?;
    session.stream = stream;
    session.begin_reconnect();

    let interval = Duration::from_secs(target.timeout_secs.max(1) as u64);
    session.connect_deadline = Some(now + interval);
    timers.schedule(session.sid(), TimerKind::Connect, now, interval);
    Ok(())
}

/// Checks whether a write-ready connecting socket actually succeeded.
pub fn completion_status(stream: &mio::net::TcpStream) -> io::Result<Option<io::Error>> {
    stream.take_error()
}

/// Placeholder service installed on a session while its connect attempt is
/// in flight; replaced by the application's real service once the connect
/// callback runs (the embedder typically calls `set_service` from inside
/// it).
struct PendingConnectService;

impl crate::service::Service for PendingConnectService {
    fn process(&mut self, _ctx: &Ctx, _buf: &[u8]) -> i32 {
        0
    }
}
