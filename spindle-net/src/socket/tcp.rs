use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::socket::auth::{ACCEPT, REJECT};
use crate::socket::{
    compress, decompress, pack, unpack, Hello, Secret, SocketConfig, CHUNK_SIZE, HEADER_SIZE,
};
use crate::{Error, Result};

/// Upper bound on the size of a handshake frame, checked before the peer is
/// authenticated.
const MAX_HELLO_SIZE: usize = 4096;

/// Writes a single frame, splitting the payload into chunks.
pub(crate) fn write_frame<W: Write>(w: &mut W, payload: &[u8], uncompressed: u32) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(Error::Other(format!(
            "payload of {} bytes doesn't fit in a frame",
            payload.len()
        )));
    }
    let mut header = [0u8; HEADER_SIZE];
    LittleEndian::write_u32(&mut header[0..4], payload.len() as u32);
    LittleEndian::write_u32(&mut header[4..8], uncompressed);
    w.write_all(&header)?;
    for chunk in payload.chunks(CHUNK_SIZE) {
        w.write_all(chunk)?;
    }
    w.flush()?;
    Ok(())
}

/// Reads a single frame, returning the decompressed payload.
pub(crate) fn read_frame<R: Read>(r: &mut R, limit: Option<usize>) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    r.read_exact(&mut header)?;
    let len = LittleEndian::read_u32(&header[0..4]) as usize;
    let uncompressed = LittleEndian::read_u32(&header[4..8]);
    if let Some(limit) = limit {
        if len > limit || uncompressed as usize > limit {
            return Err(Error::Other(format!(
                "frame of {} bytes exceeds limit of {}",
                len.max(uncompressed as usize),
                limit
            )));
        }
    }

    // grow the buffer as data arrives instead of trusting the header
    let mut payload = Vec::with_capacity(len.min(CHUNK_SIZE));
    let mut buf = vec![0u8; len.min(CHUNK_SIZE)];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(CHUNK_SIZE);
        r.read_exact(&mut buf[..n])?;
        payload.extend_from_slice(&buf[..n]);
        remaining -= n;
    }
    trace!("read frame: {} bytes (uncompressed: {})", len, uncompressed);

    if uncompressed == 0 {
        Ok(payload)
    } else {
        decompress(&payload, uncompressed)
    }
}

/// Authenticated duplex connection exchanging framed messages.
///
/// Each `send` and `recv` call transfers exactly one message and blocks
/// until done.
pub struct Channel {
    stream: TcpStream,
    pub config: SocketConfig,
    peer: SocketAddr,
}

impl Channel {
    /// Connects to the given address and performs the client side of the
    /// handshake.
    pub fn connect(
        addr: &str,
        secret: &Secret,
        identity: Option<String>,
        config: SocketConfig,
    ) -> Result<Self> {
        let mut last_err = None;
        let mut connected = None;
        for socket_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&socket_addr, config.connect_timeout) {
                Ok(s) => {
                    connected = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match connected {
            Some(s) => s,
            None => {
                return Err(match last_err {
                    Some(e) => e.into(),
                    None => Error::Other(format!("address resolved to nothing: {}", addr)),
                })
            }
        };
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let mut channel = Self {
            stream,
            config,
            peer,
        };

        channel.send(&Hello {
            digest: secret.digest().to_vec(),
            identity,
        })?;
        channel
            .stream
            .set_read_timeout(Some(config.handshake_timeout))?;
        let mut reply = [0u8; 1];
        channel.stream.read_exact(&mut reply)?;
        if reply[0] != ACCEPT {
            channel.shutdown();
            return Err(Error::HandshakeFailed(format!(
                "connection rejected by {}",
                peer
            )));
        }
        channel.stream.set_read_timeout(None)?;
        trace!("connected to {}", peer);
        Ok(channel)
    }

    /// Performs the server side of the handshake on a freshly accepted
    /// stream, returning the identity announced by the peer.
    ///
    /// On failure the stream is shut down before returning.
    pub fn accept(
        stream: TcpStream,
        secret: &Secret,
        config: SocketConfig,
    ) -> Result<(Self, Option<String>)> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let mut channel = Self {
            stream,
            config,
            peer,
        };
        channel
            .stream
            .set_read_timeout(Some(config.handshake_timeout))?;
        let bytes = match read_frame(&mut channel.stream, Some(MAX_HELLO_SIZE)) {
            Ok(b) => b,
            Err(e) => {
                channel.shutdown();
                return Err(e);
            }
        };
        let hello: Hello = match unpack(&bytes, &channel.config.encoding) {
            Ok(h) => h,
            Err(e) => {
                channel.shutdown();
                return Err(Error::HandshakeFailed(format!(
                    "malformed hello from {}: {}",
                    peer, e
                )));
            }
        };
        if !secret.matches(&hello.digest) {
            let _ = channel.stream.write_all(&[REJECT]);
            channel.shutdown();
            return Err(Error::HandshakeFailed(format!(
                "invalid secret from {}",
                peer
            )));
        }
        channel.stream.write_all(&[ACCEPT])?;
        channel.stream.set_read_timeout(None)?;
        Ok((channel, hello.identity))
    }

    pub fn send<S: Serialize>(&mut self, obj: &S) -> Result<()> {
        let bytes = pack(obj, &self.config.encoding)?;
        self.send_bytes(&bytes)
    }

    pub fn recv<D: DeserializeOwned>(&mut self) -> Result<D> {
        let bytes = self.recv_bytes()?;
        unpack(&bytes, &self.config.encoding)
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if !bytes.is_empty() && self.config.compression.should_compress(bytes.len()) {
            let compressed = compress(bytes)?;
            write_frame(&mut self.stream, &compressed, bytes.len() as u32)
        } else {
            write_frame(&mut self.stream, bytes, 0)
        }
    }

    pub fn recv_bytes(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.stream, None)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Creates another handle to the same connection, used for reading and
    /// writing from different threads.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
            config: self.config,
            peer: self.peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Shuts down both directions, unblocking any thread reading from a
    /// cloned handle.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("failed shutting down stream to {}: {}", self.peer, e);
        }
    }
}

/// Non-blocking listener polled for new connections.
pub struct Listener {
    inner: TcpListener,
    poll_wait: Duration,
}

impl Listener {
    pub fn bind(addr: &str, poll_wait: Duration) -> Result<Self> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        debug!("listening on: {}", inner.local_addr()?);
        Ok(Self { inner, poll_wait })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Waits for the next incoming connection, checking the `running` flag
    /// between polls. Returns `None` once the flag gets flipped to false.
    pub fn accept(&self, running: &AtomicBool) -> Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            if !running.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.inner.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Some((stream, addr)));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => sleep(self.poll_wait),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader handing out at most a few bytes per call.
    struct Trickle<R: Read>(R);

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(3);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn frame_survives_partial_reads() {
        let payload: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|n| n as u8).collect();
        let mut wire = Vec::new();
        write_frame(&mut wire, &payload, 0).unwrap();
        assert_eq!(wire.len(), HEADER_SIZE + payload.len());
        let mut reader = Trickle(Cursor::new(wire));
        assert_eq!(read_frame(&mut reader, None).unwrap(), payload);
    }

    #[test]
    fn truncated_frame_is_disconnect() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &[1, 2, 3, 4], 0).unwrap();
        wire.truncate(wire.len() - 1);
        match read_frame(&mut Cursor::new(wire), None) {
            Err(Error::Disconnected) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &[0u8; 64], 0).unwrap();
        assert!(read_frame(&mut Cursor::new(wire), Some(32)).is_err());
    }

    #[cfg(feature = "lz4")]
    #[test]
    fn compressed_frame() {
        let payload = vec![7u8; 200_000];
        let compressed = compress(&payload).unwrap();
        let mut wire = Vec::new();
        write_frame(&mut wire, &compressed, payload.len() as u32).unwrap();
        assert!(wire.len() < payload.len());
        assert_eq!(read_frame(&mut Cursor::new(wire), None).unwrap(), payload);
    }
}
