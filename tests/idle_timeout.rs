//! Scenario 4 (spec §8): with `timeout = 2s`, a single byte at t=0
//! followed by silence makes `timeout(ctx)` fire in `[2s, 2s+eps]`; a
//! `-1` return kills the session with `way = Peer`.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iolayer::{Ctx, Layer, LayerConfig, Service, ShutdownWay, Sid};

use common::Recorder;

struct IdleService {
    layer: Arc<Layer>,
    sid: Sid,
    fires: crossbeam_channel::Sender<Instant>,
    shutdowns: crossbeam_channel::Sender<ShutdownWay>,
}

impl Service for IdleService {
    fn start(&mut self, _ctx: &Ctx) -> i32 {
        let _ = self.layer.set_timeout(self.sid, 2);
        0
    }

    fn process(&mut self, _ctx: &Ctx, buf: &[u8]) -> i32 {
        buf.len() as i32
    }

    fn timeout(&mut self, _ctx: &Ctx) -> i32 {
        let _ = self.fires.send(Instant::now());
        -1
    }

    fn shutdown(&mut self, _ctx: &Ctx, way: ShutdownWay) {
        let _ = self.shutdowns.send(way);
    }
}

#[test]
fn idle_timeout_fires_after_quiet_period() {
    let layer = Arc::new(Layer::create(LayerConfig { nthreads: 1, nclients: 16, realtime: false }).unwrap());
    let fires: Recorder<Instant> = Recorder::new();
    let shutdowns: Recorder<ShutdownWay> = Recorder::new();

    {
        let listen_layer = layer.clone();
        let closure_layer = layer.clone();
        let fires_tx = fires.sender();
        let shutdowns_tx = shutdowns.sender();
        listen_layer
            .listen(
                "127.0.0.1",
                17031,
                Arc::new(move |_app: &Ctx, _io: &Ctx, sid, _host: &str, _port| {
                    let service = IdleService { layer: closure_layer.clone(), sid, fires: fires_tx.clone(), shutdowns: shutdowns_tx.clone() };
                    let _ = closure_layer.set_service(sid, Box::new(service), Arc::new(()));
                    0
                }),
                Arc::new(()),
            )
            .unwrap();
    }

    let mut client = std::net::TcpStream::connect("127.0.0.1:17031").unwrap();
    let sent_at = Instant::now();
    client.write_all(b"x").unwrap();

    let fired_at = fires.recv_timeout(Duration::from_secs(4)).expect("idle timeout fired");
    let elapsed = fired_at.duration_since(sent_at);
    assert!(elapsed >= Duration::from_millis(1950), "idle timeout fired too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(3), "idle timeout fired too late: {elapsed:?}");

    assert_eq!(shutdowns.recv_timeout(Duration::from_secs(2)), Some(ShutdownWay::Peer));
}
