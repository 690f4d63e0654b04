//! Scenario 6 (spec §8): 1000 sessions spread across 4 workers each
//! receive exactly one copy of a `broadcast2` payload.

mod common;

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iolayer::{Ctx, Layer, LayerConfig};

use common::wait_until;

const SESSION_COUNT: usize = 1000;

#[test]
fn broadcast2_reaches_every_session_exactly_once() {
    let layer = Arc::new(Layer::create(LayerConfig { nthreads: 4, nclients: 1024, realtime: false }).unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));

    {
        let accepted = accepted.clone();
        layer
            .listen(
                "127.0.0.1",
                17041,
                Arc::new(move |_app: &Ctx, _io: &Ctx, _sid, _host: &str, _port| {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    0
                }),
                Arc::new(()),
            )
            .unwrap();
    }

    let mut clients: Vec<TcpStream> = Vec::with_capacity(SESSION_COUNT);
    for _ in 0..SESSION_COUNT {
        let stream = TcpStream::connect("127.0.0.1:17041").unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        clients.push(stream);
    }

    assert!(
        wait_until(|| accepted.load(Ordering::SeqCst) == SESSION_COUNT, Duration::from_secs(10)),
        "server only accepted {} of {SESSION_COUNT} sessions",
        accepted.load(Ordering::SeqCst)
    );

    let payload: Vec<u8> = (0..32u8).collect();
    layer.broadcast2(&payload).unwrap();

    for client in &mut clients {
        let mut buf = [0u8; 32];
        client.read_exact(&mut buf).expect("each session should receive the broadcast");
        assert_eq!(buf.as_slice(), payload.as_slice());
    }
}
