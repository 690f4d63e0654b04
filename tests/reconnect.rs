//! Scenario 5 (spec §8): connecting to a peer that accepts and then
//! immediately closes drives `Service::error` on the connected-origin
//! session; a `0` return reinitiates a connect to the same host:port.

mod common;

use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iolayer::{Ctx, Layer, LayerConfig, Service, SessionOrigin, Sid};

use common::Recorder;

struct ReconnectService {
    error_count: Arc<AtomicUsize>,
    errors: crossbeam_channel::Sender<SessionOrigin>,
}

impl Service for ReconnectService {
    fn process(&mut self, _ctx: &Ctx, buf: &[u8]) -> i32 {
        buf.len() as i32
    }

    fn error(&mut self, _ctx: &Ctx, origin: SessionOrigin, _rc: i32) -> i32 {
        let _ = self.errors.send(origin);
        if self.error_count.fetch_add(1, Ordering::SeqCst) == 0 {
            0 // ask for exactly one reconnect
        } else {
            -1 // then let the session die
        }
    }
}

#[test]
fn error_zero_return_triggers_a_reconnect_to_the_same_target() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    // Accepts every inbound connection and immediately drops it, twice:
    // once for the initial connect, once for the reconnect it provokes.
    std::thread::spawn(move || {
        for _ in 0..2 {
            if let Ok((stream, _)) = listener.accept() {
                drop(stream);
            }
        }
    });

    let layer = Arc::new(Layer::create(LayerConfig { nthreads: 1, nclients: 16, realtime: false }).unwrap());
    let connects: Recorder<Sid> = Recorder::new();
    let errors: Recorder<SessionOrigin> = Recorder::new();
    let error_count = Arc::new(AtomicUsize::new(0));

    {
        let connect_layer = layer.clone();
        let closure_layer = layer.clone();
        let connects_tx = connects.sender();
        let errors_tx = errors.sender();
        let error_count = error_count.clone();
        connect_layer
            .connect(
                "127.0.0.1",
                port,
                2,
                Arc::new(move |_app: &Ctx, _io: &Ctx, rc, _host: &str, _port, sid| {
                    if rc == 0 {
                        let _ = connects_tx.send(sid);
                        let service = ReconnectService { error_count: error_count.clone(), errors: errors_tx.clone() };
                        let _ = closure_layer.set_service(sid, Box::new(service), Arc::new(()));
                    }
                    0
                }),
                Arc::new(()),
            )
            .unwrap();
    }

    // First successful TCP handshake, before the peer drops it.
    let first_sid = connects.recv_timeout(Duration::from_secs(2)).expect("initial connect succeeded");
    let origin = errors.recv_timeout(Duration::from_secs(2)).expect("peer close surfaced to error()");
    assert_eq!(origin, SessionOrigin::Connected);

    // The reconnect reuses the session id and completes a second handshake.
    let second_sid = connects.recv_timeout(Duration::from_secs(2)).expect("reconnect succeeded");
    assert_eq!(first_sid, second_sid, "reconnect retains the same session object/id");

    let origin = errors.recv_timeout(Duration::from_secs(2)).expect("second peer close surfaced to error()");
    assert_eq!(origin, SessionOrigin::Connected);
}
