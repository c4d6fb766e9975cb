//! Stateless UDP discovery: a client broadcasts the port it listens on,
//! every reachable server unicasts its descriptor back. No session state;
//! a silent server is indistinguishable from an absent one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::proto::{ServerDescriptor, DEFAULT_DISCOVERY_PORT};
use crate::sharing::ServerConfig;

#[derive(Debug, Serialize, Deserialize)]
struct Probe {
    /// UDP port the prospective client listens on for replies.
    port: u16,
}

/// Server side: answer every probe with this server's descriptor.
/// Malformed datagrams are dropped silently.
pub fn respond_loop(config: &ServerConfig, port: u16) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .with_context(|| format!("bind discovery udp port {}", port))?;
    eprintln!("discovery responder on udp/{}", port);
    let descriptor = ServerDescriptor {
        name: config.name.clone(),
        port: config.port(),
        auth: config.auth.required(),
        sharings: config.sharings.iter().map(|s| s.info()).collect(),
        addr: None,
    };
    let payload = serde_json::to_vec(&descriptor)?;
    let mut buf = [0u8; 1024];
    loop {
        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let probe: Probe = match serde_json::from_slice(&buf[..n]) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let reply_to = SocketAddr::new(src.ip(), probe.port);
        let _ = socket.send_to(&payload, reply_to);
    }
}

/// Client side: broadcast a probe and collect descriptors until `timeout`
/// elapses or `stop` returns true for a freshly collected descriptor
/// (used to short-circuit a targeted lookup).
pub fn discover(
    discovery_port: u16,
    timeout: Duration,
    mut stop: impl FnMut(&ServerDescriptor) -> bool,
) -> Result<Vec<ServerDescriptor>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).context("bind discovery reply socket")?;
    socket.set_broadcast(true)?;
    let reply_port = socket.local_addr()?.port();
    let probe = serde_json::to_vec(&Probe { port: reply_port })?;
    let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), discovery_port);
    socket.send_to(&probe, broadcast)?;
    // loopback servers don't hear the broadcast on every platform
    let _ = socket.send_to(&probe, (Ipv4Addr::LOCALHOST, discovery_port));

    let deadline = Instant::now() + timeout;
    let mut found = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        socket.set_read_timeout(Some(deadline - now))?;
        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(_) => break, // timeout
        };
        let mut descriptor: ServerDescriptor = match serde_json::from_slice(&buf[..n]) {
            Ok(d) => d,
            Err(_) => continue,
        };
        descriptor.addr = Some(src.ip());
        let done = stop(&descriptor);
        found.push(descriptor);
        if done {
            break;
        }
    }
    Ok(found)
}

pub fn default_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
