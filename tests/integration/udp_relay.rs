//! UDP relay and reply synthesis against a loopback echo

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tun_interceptor::dispatcher::{PacketInterceptor, TunDevice};
use tun_interceptor::event::{EventBus, EventSynopsis};
use tun_interceptor::packet::{IpAddress, IpHeader, UdpHeader};
use tun_interceptor::protect::{NoOpSocketProtector, OutboundSocket, SocketProtector};
use tun_interceptor::proxy::ProxyContext;
use tun_interceptor::udp::{UdpPacketInterceptor, UdpProxyServer};
use tun_interceptor::ProxyConfig;

use super::{checksums_valid, ipv4_udp, recording_events, MemoryTun};

const CLIENT: [u8; 4] = [10, 1, 10, 1];
const LOOPBACK: [u8; 4] = [127, 0, 0, 1];
const TIMEOUT: Duration = Duration::from_secs(5);

struct Relay {
    context: Arc<ProxyContext>,
    tun: Arc<MemoryTun>,
    nat: UdpPacketInterceptor,
    handle: JoinHandle<tun_interceptor::Result<()>>,
}

impl Relay {
    fn start(config: ProxyConfig, protector: Arc<dyn SocketProtector>, events: Arc<EventBus>) -> Self {
        let context = ProxyContext::new(config, protector, events);
        let tun = MemoryTun::new();
        let (handoff, handle) = UdpProxyServer::spawn(Arc::clone(&context), Arc::clone(&tun) as Arc<dyn TunDevice>)
            .expect("Should start UDP relay");
        let nat = UdpPacketInterceptor::new(Arc::clone(context.udp_sessions()), handoff);
        Self {
            context,
            tun,
            nat,
            handle,
        }
    }

    fn send(&self, mut frame: Vec<u8>) {
        let header = IpHeader::parse(&mut frame[..]).expect("Should parse client datagram");
        self.nat
            .intercept(header, self.tun.as_ref())
            .expect("Should hand datagram to relay");
    }

    fn stop(self) {
        self.context.lifecycle().stop();
        self.handle
            .join()
            .expect("Should join relay thread")
            .expect("Should exit cleanly");
    }
}

/// Echo server that prefixes every reply with `pong:`
fn echo_server() -> u16 {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("Should bind echo");
    socket.set_read_timeout(Some(TIMEOUT)).expect("Should set timeout");
    let port = socket.local_addr().expect("Should have address").port();
    std::thread::spawn(move || {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = socket.recv_from(&mut buf) {
            let mut reply = b"pong:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            if socket.send_to(&reply, peer).is_err() {
                break;
            }
        }
    });
    port
}

#[test]
fn test_reply_synthesized_to_client() {
    let echo_port = echo_server();
    let relay = Relay::start(
        ProxyConfig::default(),
        Arc::new(NoOpSocketProtector),
        Arc::new(EventBus::new()),
    );

    relay.send(ipv4_udp(CLIENT, 50000, LOOPBACK, echo_port, b"ping"));
    let written = relay.tun.wait_written(1, TIMEOUT);
    assert_eq!(written.len(), 1, "Should receive one reply frame");

    let frame = &written[0];
    let header = IpHeader::parse(&frame[..]).expect("Should parse reply");
    assert_eq!(header.source(), IpAddress::from(Ipv4Addr::LOCALHOST));
    assert_eq!(header.destination(), IpAddress::from(Ipv4Addr::from(CLIENT)));
    assert_eq!(header.total_len(), frame.len());

    let udp = UdpHeader::new_checked(header.payload()).expect("Should parse UDP");
    assert_eq!(udp.source_port(), echo_port);
    assert_eq!(udp.destination_port(), 50000);
    assert_eq!(udp.length(), 8 + b"pong:ping".len());
    assert_eq!(udp.payload(), b"pong:ping");
    assert!(checksums_valid(frame));

    let session = relay.context.udp_sessions().query(50000).expect("Should record session");
    assert_eq!(session.destination_port().get(), echo_port);

    relay.stop();
}

#[test]
fn test_tunnel_reused_per_source_port() {
    let echo_port = echo_server();
    let relay = Relay::start(
        ProxyConfig::default(),
        Arc::new(NoOpSocketProtector),
        Arc::new(EventBus::new()),
    );

    relay.send(ipv4_udp(CLIENT, 50001, LOOPBACK, echo_port, b"one"));
    relay.tun.wait_written(1, TIMEOUT);
    relay.send(ipv4_udp(CLIENT, 50001, LOOPBACK, echo_port, b"two"));
    let written = relay.tun.wait_written(2, TIMEOUT);
    assert_eq!(written.len(), 2);

    // Both replies come back from the echo port to the same client port
    for frame in &written {
        let header = IpHeader::parse(&frame[..]).expect("Should parse reply");
        let udp = UdpHeader::new_checked(header.payload()).expect("Should parse UDP");
        assert_eq!(udp.source_port(), echo_port);
        assert_eq!(udp.destination_port(), 50001);
    }
    assert_eq!(relay.context.udp_sessions().len(), 1);

    relay.stop();
}

#[test]
fn test_protect_failure_reports_unreachable() {
    let (events, seen) = recording_events();
    let protector: Arc<dyn SocketProtector> = Arc::new(|_: &OutboundSocket| -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "protect refused"))
    });
    let relay = Relay::start(ProxyConfig::default(), protector, events);

    relay.send(ipv4_udp(CLIENT, 50002, LOOPBACK, 9, b"dropped"));

    let deadline = Instant::now() + TIMEOUT;
    while seen.lock().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let events = seen.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].synopsis, EventSynopsis::Ipv4Unreachable);
    assert!(relay.tun.written().is_empty());
    assert!(relay.context.udp_sessions().is_empty());

    relay.stop();
}

#[test]
fn test_refused_remote_drops_session() {
    // Nothing listens on this port once the socket is gone
    let closed_port = {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("Should bind");
        socket.local_addr().expect("Should have address").port()
    };
    let relay = Relay::start(
        ProxyConfig::default(),
        Arc::new(NoOpSocketProtector),
        Arc::new(EventBus::new()),
    );

    relay.send(ipv4_udp(CLIENT, 50004, LOOPBACK, closed_port, b"anyone?"));

    // The ICMP port unreachable surfaces as a socket error on the tunnel
    let deadline = Instant::now() + TIMEOUT;
    while !relay.context.udp_sessions().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(relay.context.udp_sessions().is_empty());
    assert!(relay.tun.written().is_empty());

    // A later datagram from the same port opens a fresh session
    let echo_port = echo_server();
    relay.send(ipv4_udp(CLIENT, 50004, LOOPBACK, echo_port, b"ping"));
    assert_eq!(relay.tun.wait_written(1, TIMEOUT).len(), 1);

    relay.stop();
}

#[test]
fn test_idle_tunnel_evicted() {
    let echo_port = echo_server();
    let mut config = ProxyConfig::default();
    config.udp.idle_timeout_secs = Some(1);
    let relay = Relay::start(config, Arc::new(NoOpSocketProtector), Arc::new(EventBus::new()));

    relay.send(ipv4_udp(CLIENT, 50003, LOOPBACK, echo_port, b"ping"));
    relay.tun.wait_written(1, TIMEOUT);
    assert_eq!(relay.context.udp_sessions().len(), 1);

    let deadline = Instant::now() + TIMEOUT;
    while !relay.context.udp_sessions().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(relay.context.udp_sessions().is_empty());

    relay.stop();
}
