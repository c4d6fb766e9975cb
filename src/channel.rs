//! Framed channel over one TCP connection
//!
//! Control messages are length-prefixed (4-byte big-endian) JSON payloads;
//! `read_raw`/`write_raw` bypass framing for file content whose length was
//! declared by the preceding message. The length header itself is never
//! traced at byte level.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::proto::{Request, Response, MAX_FRAME_SIZE};

/// Marker error: the peer closed the connection before a complete frame
/// arrived. An idle close between frames is ordinary session teardown.
#[derive(Debug)]
pub struct ChannelClosed;

impl std::fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel closed by peer")
    }
}

impl std::error::Error for ChannelClosed {}

/// True when `err` bottoms out in a peer-side close rather than a protocol
/// or I/O fault.
pub fn closed_by_peer(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<ChannelClosed>().is_some() {
        return true;
    }
    matches!(
        err.downcast_ref::<std::io::Error>().map(|e| e.kind()),
        Some(std::io::ErrorKind::UnexpectedEof)
            | Some(std::io::ErrorKind::ConnectionReset)
            | Some(std::io::ErrorKind::BrokenPipe)
    )
}

pub struct Channel {
    stream: TcpStream,
    closed: bool,
}

impl Channel {
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            closed: false,
        }
    }

    pub fn connect(addr: &SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(addr, timeout)
            .with_context(|| format!("connect {}", addr))?;
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            bail!(ChannelClosed);
        }
        Ok(())
    }

    /// Read one framed message. A zero length yields an empty payload,
    /// used as a lightweight continue/terminal signal.
    pub fn read_message(&mut self) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut hdr = [0u8; 4];
        if let Err(e) = self.stream.read_exact(&mut hdr) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                bail!(ChannelClosed);
            }
            return Err(e.into());
        }
        let len = u32::from_be_bytes(hdr) as usize;
        if len > MAX_FRAME_SIZE {
            bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
        }
        let mut payload = vec![0u8; len];
        if let Err(e) = self.stream.read_exact(&mut payload) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                bail!(ChannelClosed);
            }
            return Err(e.into());
        }
        Ok(payload)
    }

    pub fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        self.check_open()?;
        if payload.len() > MAX_FRAME_SIZE {
            bail!("frame too large: {} bytes (max {})", payload.len(), MAX_FRAME_SIZE);
        }
        self.stream.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.stream.write_all(payload)?;
        Ok(())
    }

    pub fn read_request(&mut self) -> Result<Request> {
        let payload = self.read_message()?;
        serde_json::from_slice(&payload).context("malformed request payload")
    }

    pub fn write_request(&mut self, req: &Request) -> Result<()> {
        let payload = serde_json::to_vec(req)?;
        self.write_message(&payload)
    }

    pub fn read_response(&mut self) -> Result<Response> {
        let payload = self.read_message()?;
        serde_json::from_slice(&payload).context("malformed response payload")
    }

    pub fn write_response(&mut self, resp: &Response) -> Result<()> {
        let payload = serde_json::to_vec(resp)?;
        self.write_message(&payload)
    }

    /// Fill `buf` with unframed bytes. Only valid when the peer has
    /// declared exactly this many bytes in a preceding message.
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        if let Err(e) = self.stream.read_exact(buf) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                bail!(ChannelClosed);
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn write_raw(&mut self, buf: &[u8]) -> Result<()> {
        self.check_open()?;
        self.stream.write_all(buf)?;
        Ok(())
    }

    /// Run `f` with a temporary read timeout, restoring the previous
    /// timeout afterwards even when `f` fails.
    pub fn with_read_timeout<T>(
        &mut self,
        timeout: Option<Duration>,
        f: impl FnOnce(&mut Channel) -> Result<T>,
    ) -> Result<T> {
        let prev = self.stream.read_timeout()?;
        self.stream.set_read_timeout(timeout)?;
        let out = f(self);
        let _ = self.stream.set_read_timeout(prev);
        out
    }

    /// Idempotent; later calls on a closed channel fail with
    /// [`ChannelClosed`].
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
