//! Packet dispatcher
//!
//! Reads raw frames off the tunnel device and hands each one to the
//! interceptor registered for its upper-layer protocol.
//!
//! ```text
//! TunDevice::read_packet
//!       |
//!       v
//! +---------------------+
//! | length / version    |---- too short, unknown version -> warn, drop
//! +---------------------+
//!       |
//!       v
//! +---------------------+
//! | IPv6 enabled?       |---- no -> skip silently
//! +---------------------+
//!       |
//!       v
//! +---------------------+
//! | protocol lookup     |---- unknown protocol -> warn, drop
//! +---------------------+
//!       |
//!       v
//! PacketInterceptor::intercept (TCP NAT / UDP NAT)
//! ```
//!
//! One frame buffer is allocated at MTU size and reused for every read. An
//! interceptor receives exclusive access to the frame for the duration of
//! the call; anything it keeps must be copied out.
//!
//! Errors raised by an interceptor are logged and the loop keeps reading. A
//! hard read error stops the whole proxy.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tracing::{error, info, trace, warn};

use crate::error::{PacketError, Result};
use crate::packet::{ip_version, IpHeader, Packet, Protocol, IPV4_MIN_HEADER_LEN, IPV6_HEADER_LEN};
use crate::reactor::Lifecycle;

/// The virtual network interface, seen as a source and sink of raw IP frames
pub trait TunDevice: Send + Sync {
    /// Read one frame into `buf`, returning its length
    ///
    /// Returning `Ok(0)`, `Interrupted`, `WouldBlock` or `TimedOut` makes the
    /// dispatcher check for shutdown and read again.
    ///
    /// # Errors
    ///
    /// Any other error ends the dispatcher.
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write exactly one frame
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn write_packet(&self, frame: &[u8]) -> io::Result<()>;
}

/// A tunnel device backed by a file descriptor (e.g. `/dev/net/tun` or the
/// descriptor handed over by the platform VPN service)
#[derive(Debug)]
pub struct FdTunDevice {
    file: File,
}

impl FdTunDevice {
    #[must_use]
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }
}

impl TunDevice for FdTunDevice {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write_packet(&self, frame: &[u8]) -> io::Result<()> {
        (&self.file).write_all(frame)
    }
}

/// Per-protocol handler for frames read off the tunnel
pub trait PacketInterceptor: Send + Sync {
    /// Handle one frame
    ///
    /// The header view borrows the dispatcher's buffer mutably, so NAT
    /// rewriting happens in place. Processed frames go back out through
    /// `tun`.
    ///
    /// # Errors
    ///
    /// Errors abort this frame only.
    fn intercept(&self, header: IpHeader<&mut [u8]>, tun: &dyn TunDevice) -> Result<()>;
}

/// Reads frames from the tunnel and routes them by protocol
pub struct PacketDispatcher {
    mtu: usize,
    enable_ipv6: bool,
    tun: Arc<dyn TunDevice>,
    tcp: Arc<dyn PacketInterceptor>,
    udp: Arc<dyn PacketInterceptor>,
    lifecycle: Arc<Lifecycle>,
}

impl PacketDispatcher {
    /// Create a dispatcher
    ///
    /// # Arguments
    ///
    /// * `mtu` - Size of the reused frame buffer
    /// * `enable_ipv6` - Deliver IPv6 frames to interceptors
    /// * `tun` - Tunnel device
    /// * `tcp` - Interceptor for protocol 6
    /// * `udp` - Interceptor for protocol 17
    /// * `lifecycle` - Proxy lifecycle checked between reads
    #[must_use]
    pub fn new(
        mtu: usize,
        enable_ipv6: bool,
        tun: Arc<dyn TunDevice>,
        tcp: Arc<dyn PacketInterceptor>,
        udp: Arc<dyn PacketInterceptor>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            mtu,
            enable_ipv6,
            tun,
            tcp,
            udp,
            lifecycle,
        }
    }

    /// Run the read loop until the lifecycle stops or the device fails
    ///
    /// A device failure stops the lifecycle, which releases every reactor.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that ended the loop.
    pub fn run(self) -> Result<()> {
        info!(mtu = self.mtu, ipv6 = self.enable_ipv6, "Packet dispatcher started");
        let mut packet = Packet::with_capacity(self.mtu);

        while self.lifecycle.is_alive() {
            let len = match self.tun.read_packet(packet.storage_mut()) {
                Ok(0) => continue,
                Ok(len) => len,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    if self.lifecycle.is_alive() {
                        error!("Tunnel read failed, stopping proxy: {}", e);
                        self.lifecycle.stop();
                        return Err(e.into());
                    }
                    break;
                }
            };
            packet.set_len(len);

            if let Err(e) = self.dispatch(packet.as_mut_slice()) {
                if e.is_recoverable() {
                    warn!("Dropped frame ({} bytes): {}", len, e);
                } else {
                    error!("Frame handling failed ({} bytes): {}", len, e);
                }
            }
        }

        info!("Packet dispatcher stopped");
        Ok(())
    }

    /// Classify one frame and hand it to its interceptor
    ///
    /// # Errors
    ///
    /// Returns `PacketError` for malformed or unsupported frames, or the
    /// interceptor's error.
    pub fn dispatch(&self, frame: &mut [u8]) -> Result<()> {
        let version = ip_version(frame).ok_or(PacketError::TooShort {
            len: 0,
            min: IPV4_MIN_HEADER_LEN,
        })?;
        let min = match version {
            4 => IPV4_MIN_HEADER_LEN,
            6 => IPV6_HEADER_LEN,
            v => return Err(PacketError::UnknownVersion(v).into()),
        };
        if frame.len() < min {
            return Err(PacketError::TooShort {
                len: frame.len(),
                min,
            }
            .into());
        }
        if version == 6 && !self.enable_ipv6 {
            trace!(len = frame.len(), "IPv6 disabled, frame skipped");
            return Ok(());
        }

        let header = IpHeader::parse(frame)?;
        let interceptor = match header.protocol() {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
            _ => return Err(PacketError::UnsupportedProtocol(header.protocol_code()).into()),
        };
        trace!(
            version,
            protocol = %header.protocol(),
            src = %header.source(),
            dst = %header.destination(),
            len = header.total_len(),
            "Dispatching frame"
        );
        interceptor.intercept(header, self.tun.as_ref())
    }
}

impl std::fmt::Debug for PacketDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDispatcher")
            .field("mtu", &self.mtu)
            .field("enable_ipv6", &self.enable_ipv6)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InterceptorError, ProxyError};
    use crate::packet::ip::tests::{ipv4_frame, ipv6_frame};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u8, usize)>>,
        fail: bool,
    }

    impl PacketInterceptor for Recorder {
        fn intercept(&self, header: IpHeader<&mut [u8]>, _tun: &dyn TunDevice) -> Result<()> {
            self.seen.lock().push((header.version(), header.total_len()));
            if self.fail {
                return Err(ProxyError::interceptor("rejected").into());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedTun {
        frames: Mutex<VecDeque<io::Result<Vec<u8>>>>,
    }

    impl TunDevice for ScriptedTun {
        fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.frames.lock().pop_front() {
                Some(Ok(frame)) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")),
            }
        }

        fn write_packet(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    fn dispatcher(
        enable_ipv6: bool,
        tcp: Arc<Recorder>,
        udp: Arc<Recorder>,
        tun: Arc<ScriptedTun>,
    ) -> PacketDispatcher {
        PacketDispatcher::new(1500, enable_ipv6, tun, tcp, udp, Lifecycle::new())
    }

    #[test]
    fn test_routes_by_protocol() {
        let tcp = Arc::new(Recorder::default());
        let udp = Arc::new(Recorder::default());
        let d = dispatcher(false, Arc::clone(&tcp), Arc::clone(&udp), Arc::default());

        let mut frame = ipv4_frame(6, [10, 0, 0, 2], [1, 1, 1, 1], &[0u8; 20]);
        d.dispatch(&mut frame).expect("Should dispatch TCP");
        let mut frame = ipv4_frame(17, [10, 0, 0, 2], [1, 1, 1, 1], &[0u8; 8]);
        d.dispatch(&mut frame).expect("Should dispatch UDP");

        assert_eq!(tcp.seen.lock().as_slice(), &[(4, 40)]);
        assert_eq!(udp.seen.lock().as_slice(), &[(4, 28)]);
    }

    #[test]
    fn test_malformed_frames_dropped() {
        let tcp = Arc::new(Recorder::default());
        let d = dispatcher(true, Arc::clone(&tcp), Arc::default(), Arc::default());

        let mut short = vec![0x45u8; 12];
        assert!(matches!(
            d.dispatch(&mut short),
            Err(InterceptorError::Packet(PacketError::TooShort { len: 12, min: 20 }))
        ));

        let mut short_v6 = vec![0x60u8; 30];
        assert!(matches!(
            d.dispatch(&mut short_v6),
            Err(InterceptorError::Packet(PacketError::TooShort { len: 30, min: 40 }))
        ));

        let mut v5 = vec![0x50u8; 40];
        assert!(matches!(
            d.dispatch(&mut v5),
            Err(InterceptorError::Packet(PacketError::UnknownVersion(5)))
        ));

        let mut icmp = ipv4_frame(1, [10, 0, 0, 2], [1, 1, 1, 1], &[0u8; 8]);
        let err = d.dispatch(&mut icmp).expect_err("Should reject ICMP");
        assert!(err.is_recoverable());

        assert!(tcp.seen.lock().is_empty());
    }

    #[test]
    fn test_ipv6_gated_by_config() {
        let tcp = Arc::new(Recorder::default());
        let disabled = dispatcher(false, Arc::clone(&tcp), Arc::default(), Arc::default());
        let mut frame = ipv6_frame(6, &[], &[0u8; 20]);
        disabled.dispatch(&mut frame).expect("Should skip silently");
        assert!(tcp.seen.lock().is_empty());

        let enabled = dispatcher(true, Arc::clone(&tcp), Arc::default(), Arc::default());
        enabled.dispatch(&mut frame).expect("Should dispatch");
        assert_eq!(tcp.seen.lock().as_slice(), &[(6, 60)]);
    }

    #[test]
    fn test_ipv6_chain_past_frame_end_dropped() {
        let sessions = Arc::new(crate::session::SessionStore::new(Protocol::Tcp));
        let nat = crate::tcp::TcpPacketInterceptor::new(
            Arc::clone(&sessions),
            vec![8001],
            crate::packet::IpAddress::parse("10.1.10.1").expect("Should parse"),
            crate::packet::IpAddress::parse("fd00::a").expect("Should parse"),
        );
        let d = PacketDispatcher::new(
            1500,
            true,
            Arc::new(ScriptedTun::default()),
            Arc::new(nat),
            Arc::new(Recorder::default()),
            Lifecycle::new(),
        );

        // Hop-by-Hop points at TCP 1602 bytes further on, past the 62 byte frame
        let mut frame = ipv6_frame(0, &[6, 200], &[0u8; 20]);
        let err = d.dispatch(&mut frame).expect_err("Should reject the frame");
        assert!(matches!(
            err,
            InterceptorError::Packet(PacketError::UnsupportedProtocol(59))
        ));
        assert!(err.is_recoverable());
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_loop_survives_interceptor_errors() {
        let tcp = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let tun = Arc::new(ScriptedTun::default());
        {
            let mut frames = tun.frames.lock();
            frames.push_back(Ok(ipv4_frame(6, [10, 0, 0, 2], [1, 1, 1, 1], &[0u8; 20])));
            frames.push_back(Err(io::Error::new(io::ErrorKind::Interrupted, "signal")));
            frames.push_back(Ok(vec![0x45, 0, 0]));
            frames.push_back(Ok(ipv4_frame(6, [10, 0, 0, 3], [1, 1, 1, 1], &[0u8; 20])));
        }
        let lifecycle = Lifecycle::new();
        let d = PacketDispatcher::new(
            1500,
            false,
            tun,
            Arc::clone(&tcp) as Arc<dyn PacketInterceptor>,
            Arc::new(Recorder::default()),
            Arc::clone(&lifecycle),
        );

        // The scripted device ends with a hard error
        assert!(d.run().is_err());
        assert_eq!(tcp.seen.lock().len(), 2);
        assert!(!lifecycle.is_alive());
    }
}
