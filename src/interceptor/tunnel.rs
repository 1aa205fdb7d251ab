//! Byte sink used by interceptors to emit processed data
//!
//! A tunnel stands for one relayed TCP connection. Interceptors never touch
//! sockets; they hand finished bytes to the tunnel, which queues them on the
//! owning reactor's channel and flushes when the socket is writable.

use bytes::Bytes;

use crate::error::Result;

/// Write side of a relayed TCP connection
///
/// Implementations live on a reactor thread and are not shared across
/// threads.
pub trait Tunnel {
    /// Queue bytes for the real remote server
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::TunnelClosed` once the connection has closed.
    fn write_to_remote_server(&self, buffer: Bytes) -> Result<()>;

    /// Queue bytes for the local client
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::TunnelClosed` once the connection has closed.
    fn write_to_local_client(&self, buffer: Bytes) -> Result<()>;
}
