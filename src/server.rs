//! TCP listener: one worker thread per accepted client connection. The
//! GET/PUT sub-protocols run synchronously within that worker, so control
//! and data keep their ordering on the single connection.

use anyhow::{Context, Result};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use crate::channel::Channel;
use crate::discovery;
use crate::session::Session;
use crate::sharing::ServerConfig;

pub fn serve(config: Arc<ServerConfig>) -> Result<()> {
    let listener = TcpListener::bind(&config.bind).with_context(|| format!("bind {}", config.bind))?;
    serve_on(listener, config)
}

/// Serve on an already-bound listener; lets callers bind port 0 first.
pub fn serve_on(listener: TcpListener, config: Arc<ServerConfig>) -> Result<()> {
    eprintln!(
        "skiffd listening on {} ({} sharings, auth={})",
        config.bind,
        config.sharings.len(),
        config.auth.required()
    );
    for sharing in &config.sharings {
        eprintln!(
            "  sharing {:?} -> {}{}",
            sharing.name,
            sharing.root.display(),
            if sharing.read_only { " (read-only)" } else { "" }
        );
    }

    if let Some(port) = config.discovery_port {
        let cfg = Arc::clone(&config);
        thread::spawn(move || {
            if let Err(e) = discovery::respond_loop(&cfg, port) {
                eprintln!("discovery responder stopped: {:#}", e);
            }
        });
    }

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let peer = match stream.peer_addr() {
                    Ok(a) => a,
                    Err(e) => {
                        eprintln!("peer_addr failed: {}", e);
                        continue;
                    }
                };
                let cfg = Arc::clone(&config);
                thread::spawn(move || {
                    let mut chan = Channel::new(stream);
                    let mut session = Session::new(&cfg, peer);
                    if let Err(e) = session.run(&mut chan) {
                        eprintln!("[{}] session error: {:#}", session.tag(), e);
                    }
                    chan.close();
                });
            }
            Err(e) => {
                eprintln!("accept error: {}", e);
            }
        }
    }
    Ok(())
}
