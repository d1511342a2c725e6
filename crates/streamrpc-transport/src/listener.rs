use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::traits::RpcStream;

/// Connect to a listening endpoint (blocking).
pub fn connect(endpoint: &Endpoint) -> Result<RpcStream> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: e,
            })?;
            // Frames are written in one buffer; don't let Nagle hold back the tail.
            stream.set_nodelay(true)?;
            debug!(%endpoint, "connected");
            Ok(RpcStream::from(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: e,
            })?;
            debug!(%endpoint, "connected");
            Ok(RpcStream::from(stream))
        }
    }
}

/// Accepts RPC connections on a TCP address or a Unix domain socket.
///
/// Filesystem sockets are created with mode `0600` and removed again on
/// drop, unless the path was replaced in the meantime.
pub struct RpcListener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
        created_inode: (u64, u64),
    },
}

impl RpcListener {
    /// Default permission mode for created socket paths.
    #[cfg(unix)]
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(all(unix, not(target_os = "linux")))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on the given endpoint.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener =
                    TcpListener::bind(addr.as_str()).map_err(|e| TransportError::Bind {
                        endpoint: endpoint.to_string(),
                        source: e,
                    })?;
                // Port 0 binds an ephemeral port; report the real one.
                let local = listener.local_addr()?;
                let endpoint = Endpoint::Tcp(local.to_string());
                info!(%endpoint, "listening");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    endpoint,
                })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Self::bind_unix(path, Self::DEFAULT_SOCKET_MODE),
        }
    }

    /// Bind a filesystem-path Unix domain socket with explicit mode.
    ///
    /// If the path already exists and is a socket, it is removed first
    /// (stale socket cleanup). Any other file at the path is left alone.
    #[cfg(unix)]
    pub fn bind_unix(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let endpoint = Endpoint::Unix(path.clone());
        let bind_err = |source| TransportError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(%endpoint, "listening");

        Ok(Self {
            inner: ListenerInner::Unix {
                listener,
                path,
                created_inode: (created.dev(), created.ino()),
            },
            endpoint,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<RpcStream> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, addr) = listener.accept().map_err(TransportError::Accept)?;
                stream.set_nodelay(true)?;
                debug!(%addr, "accepted connection");
                Ok(RpcStream::from(stream))
            }
            #[cfg(unix)]
            ListenerInner::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().map_err(TransportError::Accept)?;
                debug!("accepted connection");
                Ok(RpcStream::from(stream))
            }
        }
    }

    /// The endpoint this listener is bound to, with the actual port for TCP.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(unix)]
impl Drop for RpcListener {
    fn drop(&mut self) {
        let ListenerInner::Unix {
            path,
            created_inode: (expected_dev, expected_ino),
            ..
        } = &self.inner
        else {
            return;
        };

        if let Ok(metadata) = std::fs::symlink_metadata(path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == *expected_dev
                && metadata.ino() == *expected_ino
            {
                debug!(?path, "cleaning up socket file");
                let _ = std::fs::remove_file(path);
            } else {
                debug!(?path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}
