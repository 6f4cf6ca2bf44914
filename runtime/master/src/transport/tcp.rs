//! Non-blocking TCP connection adapter.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use super::Connection;

const READ_CHUNK: usize = 512;

/// [`Connection`] over a [`TcpStream`] in non-blocking mode.
///
/// Establishing the connection is bounded by the configured connect timeout;
/// afterwards the socket is switched to non-blocking and all traffic is
/// buffered through `rx` and `tx`, so the engine's tick never waits on the
/// peer. Outbound bytes the socket cannot take immediately stay in `tx` and
/// drain on later calls, keeping frames contiguous on the wire.
pub struct TcpConnection {
    addr: SocketAddr,
    connect_timeout: Duration,
    nodelay: bool,
    stream: Option<TcpStream>,
    rx: BytesMut,
    tx: BytesMut,
}

impl TcpConnection {
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
            nodelay: true,
            stream: None,
            rx: BytesMut::with_capacity(READ_CHUNK),
            tx: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Moves whatever the socket holds into the local receive buffer.
    fn fill(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    // Orderly shutdown by the peer.
                    debug!(addr = %self.addr, "peer closed connection");
                    self.stream = None;
                    return;
                }
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "read failed, dropping connection");
                    self.stream = None;
                    return;
                }
            }
        }
    }

    /// Pushes buffered outbound bytes to the socket without waiting.
    ///
    /// Stops at the first would-block, like [`TcpConnection::fill`] on the
    /// read side; whatever remains is retried on the next call.
    fn flush_tx(&mut self) -> io::Result<()> {
        while !self.tx.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            };
            match stream.write(&self.tx) {
                Ok(0) => {
                    self.stream = None;
                    return Err(io::Error::from(io::ErrorKind::WriteZero));
                }
                Ok(n) => self.tx.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "write failed, dropping connection");
                    self.stream = None;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl Connection for TcpConnection {
    fn connect(&mut self) -> io::Result<()> {
        let stream = TcpStream::connect_timeout(&self.addr, self.connect_timeout)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(self.nodelay)?;
        debug!(addr = %self.addr, "connected");
        self.rx.clear();
        self.tx.clear();
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn available(&mut self) -> usize {
        let _ = self.flush_tx();
        self.fill();
        self.rx.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill();
        let n = buf.len().min(self.rx.len());
        buf[..n].copy_from_slice(&self.rx[..n]);
        self.rx.advance(n);
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.stream.is_none() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        self.tx.extend_from_slice(buf);
        self.flush_tx()
    }

    fn close(&mut self) {
        self.stream = None;
        self.rx.clear();
        self.tx.clear();
    }
}
