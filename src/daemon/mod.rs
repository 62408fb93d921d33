use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::client_loop::ClientLoop;
use crate::config;

mod signals;

pub fn run(config_file: Option<String>, bind: Option<String>) -> anyhow::Result<()> {
    info!("starting logview-gatewayd");

    let mut config = config::read_config(&config_file)?;
    if let Some(bind) = bind {
        config.bind = Some(bind);
    }
    let config = Arc::new(config);

    signals::Handler::new().spawn()?;

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr).with_context(|| format!("binding to {}", bind_addr))?;
    info!(addr = %bind_addr, "listening");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "error accepting connection");
                continue;
            }
        };

        let peer = stream.peer_addr().ok();
        info!(?peer, "accepted connection");

        let config = Arc::clone(&config);
        thread::spawn(move || {
            let mut client = ClientLoop::new(stream, config);
            client.run();
        });
    }

    Ok(())
}
