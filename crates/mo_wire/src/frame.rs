use std::io::{Read as _, Write as _};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::{WireError, FRAME_COMPLETION_TIMEOUT};

/// Role magics, sent once right after connecting.
pub const MAGIC_CONTROL: [u8; 4] = *b"mxct";
pub const MAGIC_WORKER: [u8; 4] = *b"mxwk";
pub const MAGIC_DELIVERY: [u8; 4] = *b"mxdl";
pub const MAGIC_CLIENT: [u8; 4] = *b"mxcl";

/// Frames whose body claims to be larger than this are refused outright.
pub const MAX_FRAME_LEN: u32 = 1 << 30;

const HEADER_LEN: usize = 5; // u8 kind + u32 length

/// A framed TCP connection: `u8 kind | u32 length | body`.
///
/// Reads are two-phase: the read deadline passed to [`Framed::recv`] applies
/// only until the first header byte arrives. Once a header has been seen the
/// rest of the frame must complete within [`FRAME_COMPLETION_TIMEOUT`]; a
/// stall mid-frame would leave the stream unsynchronizable, so it is reported
/// as a protocol error rather than a retryable timeout.
pub struct Framed {
    stream: TcpStream,
}

impl Framed {
    /// Connects and announces the given role magic.
    pub fn connect(addr: impl ToSocketAddrs, magic: [u8; 4]) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        let mut framed = Self { stream };
        framed.stream.write_all(&magic)?;
        Ok(framed)
    }

    /// Wraps an accepted connection (server side, after `accept`).
    pub fn from_stream(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        Self { stream }
    }

    /// Reads the peer's role magic; used once per accepted connection.
    pub fn read_magic(&mut self, timeout: Duration) -> Result<[u8; 4], WireError> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut magic = [0u8; 4];
        map_read(self.stream.read_exact(&mut magic))?;
        Ok(magic)
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }

    /// Best-effort immediate shutdown, unblocking any reader.
    pub fn shutdown(&self) {
        self.stream.shutdown(std::net::Shutdown::Both).ok();
    }

    pub fn send(&mut self, kind: u8, body: &[u8]) -> Result<(), WireError> {
        debug_assert!(body.len() <= MAX_FRAME_LEN as usize);
        let mut header = [0u8; HEADER_LEN];
        header[0] = kind;
        header[1..].copy_from_slice(&(body.len() as u32).to_be_bytes());
        self.stream.write_all(&header)?;
        self.stream.write_all(body)?;
        Ok(())
    }

    /// Receives one frame, waiting at most `timeout` for it to begin.
    pub fn recv(&mut self, timeout: Duration) -> Result<(u8, Vec<u8>), WireError> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut header = [0u8; HEADER_LEN];
        map_read(self.stream.read_exact(&mut header))?;

        let kind = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        if len > MAX_FRAME_LEN {
            return Err(WireError::protocol(format!(
                "frame of {len} bytes refused (kind {kind})"
            )));
        }

        // Header seen; the rest must arrive promptly.
        self.stream
            .set_read_timeout(Some(FRAME_COMPLETION_TIMEOUT))?;
        let mut body = vec![0u8; len as usize];
        match map_read(self.stream.read_exact(&mut body)) {
            Ok(()) => Ok((kind, body)),
            Err(WireError::Timeout) => Err(WireError::protocol(format!(
                "frame truncated mid-body (kind {kind}, {len} bytes expected)"
            ))),
            Err(other) => Err(other),
        }
    }
}

fn map_read(result: std::io::Result<()>) -> Result<(), WireError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                Err(WireError::Timeout)
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Err(WireError::Disconnected),
            _ => Err(WireError::Io(e)),
        },
    }
}
