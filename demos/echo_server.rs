use std::sync::Arc;

use iolayer::{Ctx, Layer, LayerConfig, Payload, Service, Sid};

struct Echo {
    sid: Sid,
}

impl Service for Echo {
    fn process(&mut self, ctx: &Ctx, buf: &[u8]) -> i32 {
        let layer = ctx.downcast_ref::<Layer>().expect("app ctx is the layer handle");
        let _ = layer.send(self.sid, Payload::copied(buf));
        buf.len() as i32
    }

    fn shutdown(&mut self, _ctx: &Ctx, way: iolayer::ShutdownWay) {
        eprintln!("session {} closed: {way:?}", self.sid);
    }
}

fn main() -> iolayer::Result<()> {
    tracing_subscriber::fmt::init();

    let layer = Arc::new(Layer::create(LayerConfig { nthreads: 4, nclients: 1024, realtime: false })?);
    let app_ctx: Ctx = layer.clone();
    let layer_for_listen = layer.clone();

    layer.listen(
        "127.0.0.1",
        17001,
        Arc::new(move |app_ctx: &Ctx, _iocontext: &Ctx, sid, _host: &str, _port| {
            let app_ctx = app_ctx.clone();
            let _ = layer_for_listen.set_service(sid, Box::new(Echo { sid }), app_ctx);
            0
        }),
        app_ctx,
    )?;

    println!("echo server listening on 127.0.0.1:17001, Ctrl-C to stop");
    std::thread::park();
    Ok(())
}
