//! Upstream Connector
//!
//! Opens the byte-stream link to the tunnel server. The socket is
//! protected before connecting so its packets take the host's physical
//! path; an unprotected socket would be routed into the very interface
//! it feeds and the tunnel would loop on itself. Protection is therefore
//! mandatory: if it fails, no connect is attempted.

use crate::error::{Result, TunnelError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

/// Excludes a socket from the virtual interface's routing
pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &TcpSocket) -> io::Result<()>;
}

/// Marks the socket with a firewall mark the policy rules route around
/// the tunnel (Linux `SO_MARK`, needs `CAP_NET_ADMIN`)
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct FwmarkProtector {
    mark: u32,
}

#[cfg(target_os = "linux")]
impl FwmarkProtector {
    pub fn new(mark: u32) -> Self {
        Self { mark }
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }
}

#[cfg(target_os = "linux")]
impl SocketProtector for FwmarkProtector {
    fn protect(&self, socket: &TcpSocket) -> io::Result<()> {
        socket2::SockRef::from(socket).set_mark(self.mark)
    }
}

/// Delegates protection to the host, which receives the raw descriptor
///
/// Matches mobile VPN APIs where the platform service exposes a
/// `protect(fd) -> bool` call.
#[cfg(unix)]
pub struct CallbackProtector {
    callback: Box<dyn Fn(std::os::unix::io::RawFd) -> bool + Send + Sync>,
}

#[cfg(unix)]
impl CallbackProtector {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(std::os::unix::io::RawFd) -> bool + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[cfg(unix)]
impl SocketProtector for CallbackProtector {
    fn protect(&self, socket: &TcpSocket) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let fd = socket.as_raw_fd();
        if (self.callback)(fd) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("host refused to protect socket fd {}", fd),
            ))
        }
    }
}

/// Opens protected connections to the tunnel server
#[derive(Clone)]
pub struct UpstreamConnector {
    protector: Arc<dyn SocketProtector>,
}

impl UpstreamConnector {
    pub fn new(protector: Arc<dyn SocketProtector>) -> Self {
        Self { protector }
    }

    /// Connect to `address:port` within `timeout`
    ///
    /// Name resolution counts against the same budget. Timeout, refusal
    /// and protection failure all surface as `UpstreamUnreachable`.
    pub async fn connect(&self, address: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
        info!("Connecting to tunnel server {}:{} (timeout {:?})", address, port, timeout);

        match tokio::time::timeout(timeout, self.connect_any(address, port)).await {
            Ok(Ok(stream)) => {
                info!("Connected to tunnel server {}:{}", address, port);
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!("Tunnel server {}:{} unreachable: {}", address, port, e);
                Err(e)
            }
            Err(_) => {
                warn!("Tunnel server {}:{} timed out after {:?}", address, port, timeout);
                Err(TunnelError::UpstreamUnreachable(format!(
                    "{}:{} timed out after {:?}",
                    address, port, timeout
                )))
            }
        }
    }

    async fn connect_any(&self, address: &str, port: u16) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host((address, port))
            .await
            .map_err(|e| {
                TunnelError::UpstreamUnreachable(format!("cannot resolve {}: {}", address, e))
            })?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match self.connect_one(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e @ TunnelError::UpstreamUnreachable(_)) => return Err(e),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => TunnelError::UpstreamUnreachable(format!("{}:{}: {}", address, port, e)),
            None => TunnelError::UpstreamUnreachable(format!("no addresses for {}", address)),
        })
    }

    /// Protect then connect a single address
    ///
    /// A protection failure is returned as `UpstreamUnreachable` so the
    /// caller stops instead of trying the next address unprotected.
    async fn connect_one(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        self.protector.protect(&socket).map_err(|e| {
            TunnelError::UpstreamUnreachable(format!("failed to protect upstream socket: {}", e))
        })?;
        debug!("Upstream socket protected from tunnel routing");

        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
