//! Scenario 2 (spec §8): a `perform` task submitted from outside the
//! worker pool while a session is mid-`process` is delivered strictly
//! after that `process` call returns, on the same (owning) thread.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iolayer::{Ctx, Layer, LayerConfig, Service, Sid};

use common::Recorder;

struct ProbeService {
    in_process: Arc<AtomicBool>,
    events: crossbeam_channel::Sender<&'static str>,
}

impl Service for ProbeService {
    fn process(&mut self, _ctx: &Ctx, buf: &[u8]) -> i32 {
        self.in_process.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        self.in_process.store(false, Ordering::SeqCst);
        let _ = self.events.send("process_done");
        buf.len() as i32
    }

    fn perform(&mut self, _ctx: &Ctx, kind: i32, _task: Box<dyn std::any::Any + Send>) {
        assert_eq!(kind, 7);
        let label = if self.in_process.load(Ordering::SeqCst) { "perform_during_process" } else { "perform_after_process" };
        let _ = self.events.send(label);
    }
}

#[test]
fn perform_is_ordered_after_in_flight_process() {
    let layer = Arc::new(Layer::create(LayerConfig { nthreads: 4, nclients: 64, realtime: false }).unwrap());
    let sids: Recorder<Sid> = Recorder::new();
    let events: Recorder<&'static str> = Recorder::new();
    let in_process = Arc::new(AtomicBool::new(false));

    {
        let listen_layer = layer.clone();
        let closure_layer = layer.clone();
        let sids_tx = sids.sender();
        let events_tx = events.sender();
        let in_process = in_process.clone();
        listen_layer
            .listen(
                "127.0.0.1",
                17011,
                Arc::new(move |_app: &Ctx, _io: &Ctx, sid, _host: &str, _port| {
                    let _ = sids_tx.send(sid);
                    let service = ProbeService { in_process: in_process.clone(), events: events_tx.clone() };
                    let _ = closure_layer.set_service(sid, Box::new(service), Arc::new(()));
                    0
                }),
                Arc::new(()),
            )
            .unwrap();
    }

    let mut client = std::net::TcpStream::connect("127.0.0.1:17011").unwrap();
    let sid = sids.recv_timeout(Duration::from_secs(2)).expect("session accepted");

    use std::io::Write;
    client.write_all(b"x").unwrap();
    // Race the perform submission against the 50ms sleep inside `process`;
    // the ordering guarantee holds regardless of whether it wins that race.
    layer.perform(sid, 7, Box::new(()), None).unwrap();

    assert_eq!(events.recv_timeout(Duration::from_secs(2)), Some("process_done"));
    assert_eq!(events.recv_timeout(Duration::from_secs(2)), Some("perform_after_process"));
}
