//! Scenario 3 (spec §8): with `keepalive = 1s` and no send activity,
//! `keepalive(ctx)` fires at >= 1s cadence; a `-1` return kills the
//! session with `way = Peer`.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use iolayer::{Ctx, Layer, LayerConfig, Service, ShutdownWay, Sid};

use common::Recorder;

struct KeepaliveService {
    layer: Arc<Layer>,
    sid: Sid,
    fires: crossbeam_channel::Sender<Instant>,
    shutdowns: crossbeam_channel::Sender<ShutdownWay>,
}

impl Service for KeepaliveService {
    fn start(&mut self, _ctx: &Ctx) -> i32 {
        let _ = self.layer.set_keepalive(self.sid, 1);
        0
    }

    fn process(&mut self, _ctx: &Ctx, buf: &[u8]) -> i32 {
        buf.len() as i32
    }

    fn keepalive(&mut self, _ctx: &Ctx) -> i32 {
        let _ = self.fires.send(Instant::now());
        -1
    }

    fn shutdown(&mut self, _ctx: &Ctx, way: ShutdownWay) {
        let _ = self.shutdowns.send(way);
    }
}

#[test]
fn keepalive_fires_on_cadence_and_kills_on_negative_return() {
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
                17021,
                Arc::new(move |_app: &Ctx, _io: &Ctx, sid, _host: &str, _port| {
                    let service =
                        KeepaliveService { layer: closure_layer.clone(), sid, fires: fires_tx.clone(), shutdowns: shutdowns_tx.clone() };
                    let _ = closure_layer.set_service(sid, Box::new(service), Arc::new(()));
                    0
                }),
                Arc::new(()),
            )
            .unwrap();
    }

    let started = Instant::now();
    let _client = std::net::TcpStream::connect("127.0.0.1:17021").unwrap();

    let fired_at = fires.recv_timeout(Duration::from_secs(3)).expect("keepalive fired");
    let elapsed = fired_at.duration_since(started);
    assert!(elapsed >= Duration::from_millis(950), "keepalive fired too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(2), "keepalive fired too late: {elapsed:?}");

    assert_eq!(shutdowns.recv_timeout(Duration::from_secs(2)), Some(ShutdownWay::Peer));
}
