//! Dispatcher and TCP NAT rewriting over an in-memory tunnel

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tun_interceptor::dispatcher::{PacketDispatcher, PacketInterceptor, TunDevice};
use tun_interceptor::error::{InterceptorError, PacketError, SessionError};
use tun_interceptor::packet::{IpAddress, IpHeader, Protocol, TcpHeader};
use tun_interceptor::reactor::Lifecycle;
use tun_interceptor::session::SessionStore;
use tun_interceptor::tcp::TcpPacketInterceptor;

use super::{checksums_valid, ipv4_tcp, ipv4_udp, MemoryTun};

const SYN: u8 = 0x02;
const TUN_ADDR: [u8; 4] = [10, 1, 10, 1];
const REMOTE: [u8; 4] = [93, 184, 216, 34];

#[derive(Default)]
struct CountingUdp(AtomicUsize);

impl PacketInterceptor for CountingUdp {
    fn intercept(&self, _header: IpHeader<&mut [u8]>, _tun: &dyn TunDevice) -> tun_interceptor::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    dispatcher: PacketDispatcher,
    tun: Arc<MemoryTun>,
    sessions: Arc<SessionStore>,
    udp: Arc<CountingUdp>,
}

fn fixture(enable_ipv6: bool) -> Fixture {
    let tun = MemoryTun::new();
    let sessions = Arc::new(SessionStore::new(Protocol::Tcp));
    let tcp = TcpPacketInterceptor::new(
        Arc::clone(&sessions),
        vec![8001, 8002],
        IpAddress::from(std::net::Ipv4Addr::from(TUN_ADDR)),
        "fd00::a".parse().expect("Should parse tunnel v6"),
    );
    let udp = Arc::new(CountingUdp::default());
    let dispatcher = PacketDispatcher::new(
        1500,
        enable_ipv6,
        Arc::clone(&tun) as Arc<dyn TunDevice>,
        Arc::new(tcp),
        Arc::clone(&udp) as Arc<dyn PacketInterceptor>,
        Lifecycle::new(),
    );
    Fixture {
        dispatcher,
        tun,
        sessions,
        udp,
    }
}

#[test]
fn test_request_and_response_round_trip() {
    let f = fixture(false);

    // Client 10.1.10.1:40000 -> 93.184.216.34:80; 40000 % 2 selects shard 8001
    let mut request = ipv4_tcp(TUN_ADDR, 40000, REMOTE, 80, SYN, b"");
    f.dispatcher.dispatch(&mut request).expect("Should rewrite request");

    let written = f.tun.written();
    assert_eq!(written.len(), 1);
    let header = IpHeader::parse(&written[0][..]).expect("Should parse rewritten request");
    assert_eq!(header.source(), IpAddress::from(std::net::Ipv4Addr::from(REMOTE)));
    assert_eq!(header.destination(), IpAddress::from(std::net::Ipv4Addr::from(TUN_ADDR)));
    let tcp = TcpHeader::new_checked(header.payload()).expect("Should parse TCP");
    assert_eq!(tcp.source_port(), 40000);
    assert_eq!(tcp.destination_port(), 8001);
    assert!(tcp.is_syn());
    assert!(checksums_valid(&written[0]));

    let session = f.sessions.query(40000).expect("Should record session");
    assert_eq!(session.destination_port().get(), 80);

    // Shard reply 10.1.10.1:8001 -> 93.184.216.34:40000
    let mut response = ipv4_tcp(TUN_ADDR, 8001, REMOTE, 40000, SYN | 0x10, b"");
    f.dispatcher.dispatch(&mut response).expect("Should rewrite response");

    let written = f.tun.written();
    assert_eq!(written.len(), 2);
    let header = IpHeader::parse(&written[1][..]).expect("Should parse rewritten response");
    assert_eq!(header.source(), IpAddress::from(std::net::Ipv4Addr::from(REMOTE)));
    assert_eq!(header.destination(), IpAddress::from(std::net::Ipv4Addr::from(TUN_ADDR)));
    let tcp = TcpHeader::new_checked(header.payload()).expect("Should parse TCP");
    assert_eq!(tcp.source_port(), 80);
    assert_eq!(tcp.destination_port(), 40000);
    assert!(checksums_valid(&written[1]));
}

#[test]
fn test_shard_selected_by_source_port() {
    let f = fixture(false);
    let mut request = ipv4_tcp(TUN_ADDR, 40001, REMOTE, 443, SYN, b"");
    f.dispatcher.dispatch(&mut request).expect("Should rewrite request");

    let written = f.tun.written();
    let header = IpHeader::parse(&written[0][..]).expect("Should parse");
    let tcp = TcpHeader::new_checked(header.payload()).expect("Should parse TCP");
    assert_eq!(tcp.destination_port(), 8002);
}

#[test]
fn test_response_without_session_dropped() {
    let f = fixture(false);
    let mut response = ipv4_tcp(TUN_ADDR, 8001, REMOTE, 41000, 0x10, b"late");
    let err = f.dispatcher.dispatch(&mut response).expect_err("Should miss session");

    assert!(matches!(err, InterceptorError::Session(SessionError::NotFound { port: 41000, .. })));
    assert!(err.is_recoverable());
    assert!(f.tun.written().is_empty());
}

#[test]
fn test_payload_survives_rewrite() {
    let f = fixture(false);
    let body = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let mut request = ipv4_tcp(TUN_ADDR, 40002, REMOTE, 80, 0x18, body);
    f.dispatcher.dispatch(&mut request).expect("Should rewrite request");

    let written = f.tun.written();
    let header = IpHeader::parse(&written[0][..]).expect("Should parse");
    let tcp = TcpHeader::new_checked(header.payload()).expect("Should parse TCP");
    assert_eq!(tcp.payload(), body);
    assert!(checksums_valid(&written[0]));
}

#[test]
fn test_udp_routed_to_udp_interceptor() {
    let f = fixture(false);
    let mut datagram = ipv4_udp(TUN_ADDR, 53000, [8, 8, 8, 8], 53, b"query");
    f.dispatcher.dispatch(&mut datagram).expect("Should dispatch UDP");

    assert_eq!(f.udp.0.load(Ordering::SeqCst), 1);
    assert!(f.sessions.is_empty());
}

#[test]
fn test_unsupported_protocol_dropped() {
    let f = fixture(false);
    let mut icmp = ipv4_tcp(TUN_ADDR, 1, REMOTE, 2, 0, b"");
    icmp[9] = 1;
    let err = f.dispatcher.dispatch(&mut icmp).expect_err("Should reject ICMP");

    assert!(matches!(err, InterceptorError::Packet(PacketError::UnsupportedProtocol(1))));
    assert!(f.tun.written().is_empty());
}

#[test]
fn test_ipv6_skipped_when_disabled() {
    let f = fixture(false);
    let mut frame = vec![0u8; 60];
    frame[0] = 0x60;
    frame[4..6].copy_from_slice(&20u16.to_be_bytes());
    frame[6] = 6;
    frame[7] = 64;

    f.dispatcher.dispatch(&mut frame).expect("Should skip silently");
    assert!(f.tun.written().is_empty());
    assert!(f.sessions.is_empty());
}

#[test]
fn test_truncated_frame_dropped() {
    let f = fixture(false);
    let mut frame = vec![0x45, 0, 0, 20];
    let err = f.dispatcher.dispatch(&mut frame).expect_err("Should reject short frame");
    assert!(matches!(err, InterceptorError::Packet(PacketError::TooShort { .. })));
}
