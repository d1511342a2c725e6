use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// A persistent bidirectional byte stream a channel can own.
///
/// Channels need to hand a second handle of the same socket to their reader
/// loop and to force the socket closed from another thread, so plain
/// `Read + Write` is not enough.
pub trait Connection: Read + Write + Send + Sync + Sized + 'static {
    /// Create a second handle to the same underlying socket.
    fn try_clone_connection(&self) -> io::Result<Self>;

    /// Shut down both directions. Blocked readers on any handle return.
    fn shutdown_connection(&self) -> io::Result<()>;

    /// Set read timeout on the underlying socket.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Set write timeout on the underlying socket.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn try_clone_connection(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_connection(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl Connection for std::os::unix::net::UnixStream {
    fn try_clone_connection(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_connection(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }
}

/// A connected RPC stream — implements Read + Write.
///
/// This is the fundamental I/O type returned by [`crate::connect`] and
/// [`crate::RpcListener::accept`].
pub struct RpcStream {
    inner: RpcStreamInner,
}

enum RpcStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for RpcStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            RpcStreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for RpcStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            RpcStreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            RpcStreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl Connection for RpcStream {
    fn try_clone_connection(&self) -> io::Result<Self> {
        let inner = match &self.inner {
            RpcStreamInner::Tcp(stream) => RpcStreamInner::Tcp(stream.try_clone()?),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => RpcStreamInner::Unix(stream.try_clone()?),
        };
        Ok(Self { inner })
    }

    fn shutdown_connection(&self) -> io::Result<()> {
        match &self.inner {
            RpcStreamInner::Tcp(stream) => stream.shutdown_connection(),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => stream.shutdown_connection(),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            RpcStreamInner::Tcp(stream) => Connection::set_read_timeout(stream, timeout),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => Connection::set_read_timeout(stream, timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            RpcStreamInner::Tcp(stream) => Connection::set_write_timeout(stream, timeout),
            #[cfg(unix)]
            RpcStreamInner::Unix(stream) => Connection::set_write_timeout(stream, timeout),
        }
    }
}

impl From<TcpStream> for RpcStream {
    fn from(stream: TcpStream) -> Self {
        Self {
            inner: RpcStreamInner::Tcp(stream),
        }
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixStream> for RpcStream {
    fn from(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: RpcStreamInner::Unix(stream),
        }
    }
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("RpcStream");
        match &self.inner {
            RpcStreamInner::Tcp(stream) => dbg
                .field("type", &"tcp")
                .field("peer", &stream.peer_addr().ok()),
            #[cfg(unix)]
            RpcStreamInner::Unix(_) => dbg.field("type", &"unix"),
        };
        dbg.finish()
    }
}
