//! The socket operations a connection needs from its transport.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

/// A connected, full-duplex byte stream shared by the reader and writer
/// threads. All methods take `&self`; implementations must allow one reader
/// and one writer concurrently.
pub trait RelaySocket: Send + Sync + 'static {
    /// Put the socket in blocking mode with send coalescing disabled.
    fn configure(&self) -> io::Result<()>;

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocking send of the whole buffer. Returns the number of bytes
    /// written, which is short of `buf.len()` only if the peer stopped
    /// accepting data.
    fn send_all(&self, buf: &[u8]) -> io::Result<usize>;

    /// Half-close both directions, unblocking any pending `recv`/`send_all`.
    fn shutdown(&self) -> io::Result<()>;
}

impl RelaySocket for TcpStream {
    fn configure(&self) -> io::Result<()> {
        self.set_nonblocking(false)?;
        self.set_nodelay(true)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.read(buf)
    }

    fn send_all(&self, buf: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        let mut sent = 0;
        while sent < buf.len() {
            match stream.write(&buf[sent..]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl<T: RelaySocket + ?Sized> RelaySocket for Arc<T> {
    fn configure(&self) -> io::Result<()> {
        (**self).configure()
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn send_all(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).send_all(buf)
    }

    fn shutdown(&self) -> io::Result<()> {
        (**self).shutdown()
    }
}
