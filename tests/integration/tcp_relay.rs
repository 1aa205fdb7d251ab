//! Proxy shards relaying to loopback servers
//!
//! The client socket is bound before connecting so its source port can be
//! registered as a NAT session, exactly as the dispatcher would have done.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tun_interceptor::event::{EventBus, EventSynopsis};
use tun_interceptor::interceptor::http::HttpInterceptChain;
use tun_interceptor::interceptor::{
    HttpInterceptor, HttpSession, HttpTcpInterceptor, HttpVirtualGateway, TcpForwardInterceptor, TcpInterceptor,
    TcpVirtualGateway, Tunnel,
};
use tun_interceptor::protect::{NoOpSocketProtector, OutboundSocket, SocketProtector};
use tun_interceptor::proxy::ProxyContext;
use tun_interceptor::tcp::TcpProxyServer;
use tun_interceptor::{IpAddress, ProxyConfig};

use super::recording_events;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Captures every HTTP session whose request reaches it
#[derive(Default)]
struct SessionRecorder {
    sessions: Mutex<Vec<Arc<HttpSession>>>,
}

impl HttpInterceptor for SessionRecorder {
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
    ) -> tun_interceptor::Result<()> {
        self.sessions.lock().push(Arc::clone(session));
        chain.process_request_next(buffer, session, tunnel)
    }
}

struct Shard {
    context: Arc<ProxyContext>,
    port: u16,
    handle: JoinHandle<tun_interceptor::Result<()>>,
}

impl Shard {
    fn start(
        interceptors: Vec<Arc<dyn TcpInterceptor>>,
        protector: Arc<dyn SocketProtector>,
        events: Arc<EventBus>,
    ) -> Self {
        let context = ProxyContext::new(ProxyConfig::default(), protector, events);
        let gateway = Arc::new(TcpVirtualGateway::new(interceptors));
        let server = TcpProxyServer::bind(0, gateway, Arc::clone(&context)).expect("Should bind shard");
        let port = server.port();
        let handle = server.spawn().expect("Should spawn shard");
        Self { context, port, handle }
    }

    /// Connect as a client whose NAT session points at `remote`
    fn connect(&self, remote: SocketAddr) -> TcpStream {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProtocol::TCP)).expect("Should create socket");
        socket
            .bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, 0)).into())
            .expect("Should bind client");
        let client_port = socket
            .local_addr()
            .expect("Should have local address")
            .as_socket()
            .expect("Should be an inet address")
            .port();
        self.context
            .tcp_sessions()
            .insert(client_port, IpAddress::from(remote.ip()), remote.port());

        socket
            .connect(&SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)).into())
            .expect("Should connect to shard");
        let stream: TcpStream = socket.into();
        stream.set_read_timeout(Some(IO_TIMEOUT)).expect("Should set timeout");
        stream
    }

    fn stop(self) {
        self.context.lifecycle().stop();
        self.handle
            .join()
            .expect("Should join shard thread")
            .expect("Should exit cleanly");
    }
}

/// Serve one connection with `handler` on a loopback listener
fn serve_once(handler: impl FnOnce(TcpStream) + Send + 'static) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("Should bind server");
    let addr = listener.local_addr().expect("Should have address");
    std::thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            stream.set_read_timeout(Some(IO_TIMEOUT)).expect("Should set timeout");
            handler(stream);
        }
    });
    addr
}

/// Read until `expected` bytes arrived or the peer closed
fn read_exact_len(stream: &mut TcpStream, expected: usize) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received.len() < expected {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) => panic!("Read failed after {} bytes: {e}", received.len()),
        }
    }
    received
}

fn http_server(response: &'static [u8]) -> SocketAddr {
    serve_once(move |mut stream| {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        let _ = stream.write_all(response);
        let _ = stream.shutdown(std::net::Shutdown::Write);
    })
}

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";

fn assert_parsed_get(session: &HttpSession) {
    let request = session.request_snapshot();
    assert_eq!(request.method.as_deref(), Some("GET"));
    assert_eq!(request.host.as_deref(), Some("example.com"));
    assert_eq!(request.path.as_deref(), Some("/"));
    assert_eq!(request.is_https, Some(false));
    assert_eq!(request.url().as_deref(), Some("http://example.com/"));
}

#[test]
fn test_echo_through_forward_interceptor() {
    let echo = serve_once(|mut stream| {
        let mut buf = [0u8; 1024];
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 || stream.write_all(&buf[..n]).is_err() {
                break;
            }
        }
    });
    let shard = Shard::start(
        vec![Arc::new(TcpForwardInterceptor) as Arc<dyn TcpInterceptor>],
        Arc::new(NoOpSocketProtector),
        Arc::new(EventBus::new()),
    );

    let mut client = shard.connect(echo);
    client.write_all(b"hello relay").expect("Should send");
    assert_eq!(read_exact_len(&mut client, 11), b"hello relay");

    drop(client);
    shard.stop();
}

#[test]
fn test_http_request_parsed_in_chain() {
    let server = http_server(RESPONSE);
    let recorder = Arc::new(SessionRecorder::default());
    let http = HttpVirtualGateway::new(vec![Arc::clone(&recorder) as Arc<dyn HttpInterceptor>], None, None);
    let shard = Shard::start(
        vec![Arc::new(HttpTcpInterceptor::new(http)) as Arc<dyn TcpInterceptor>],
        Arc::new(NoOpSocketProtector),
        Arc::new(EventBus::new()),
    );

    let mut client = shard.connect(server);
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .expect("Should send request");
    assert_eq!(read_exact_len(&mut client, RESPONSE.len()), RESPONSE);

    let sessions = recorder.sessions.lock().clone();
    assert_eq!(sessions.len(), 1);
    assert_parsed_get(&sessions[0]);

    let response = sessions[0].response_snapshot();
    assert_eq!(response.status.as_deref(), Some("200"));
    assert_eq!(response.content_type.as_deref(), Some("text/plain"));
    assert_eq!(response.url.as_deref(), Some("http://example.com/"));

    drop(client);
    shard.stop();
}

#[test]
fn test_protect_failure_reports_unreachable() {
    let server = serve_once(|_stream| {});
    let (events, seen) = recording_events();
    let protector: Arc<dyn SocketProtector> = Arc::new(|_: &OutboundSocket| -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "protect refused"))
    });
    let shard = Shard::start(vec![Arc::new(TcpForwardInterceptor) as Arc<dyn TcpInterceptor>], protector, events);

    let mut client = shard.connect(server);
    let mut buf = [0u8; 16];
    let closed = matches!(client.read(&mut buf), Ok(0) | Err(_));
    assert!(closed, "Client connection should be closed");

    let deadline = Instant::now() + IO_TIMEOUT;
    while (seen.lock().is_empty() || !shard.context.tcp_sessions().is_empty()) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let events = seen.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].synopsis, EventSynopsis::Ipv4Unreachable);
    assert!(shard.context.tcp_sessions().is_empty());

    shard.stop();
}

#[test]
fn test_unknown_client_port_closed() {
    let shard = Shard::start(
        vec![Arc::new(TcpForwardInterceptor) as Arc<dyn TcpInterceptor>],
        Arc::new(NoOpSocketProtector),
        Arc::new(EventBus::new()),
    );

    let mut client =
        TcpStream::connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), shard.port)).expect("Should connect");
    client.set_read_timeout(Some(IO_TIMEOUT)).expect("Should set timeout");
    let mut buf = [0u8; 16];
    assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));

    shard.stop();
}

#[test]
#[ignore = "requires network access to example.com"]
fn test_http_request_to_example_com() {
    let remote = "example.com:80"
        .to_socket_addrs()
        .expect("Should resolve example.com")
        .find(SocketAddr::is_ipv4)
        .expect("Should have an IPv4 address");
    let recorder = Arc::new(SessionRecorder::default());
    let http = HttpVirtualGateway::new(vec![Arc::clone(&recorder) as Arc<dyn HttpInterceptor>], None, None);
    let shard = Shard::start(
        vec![Arc::new(HttpTcpInterceptor::new(http)) as Arc<dyn TcpInterceptor>],
        Arc::new(NoOpSocketProtector),
        Arc::new(EventBus::new()),
    );

    let mut client = shard.connect(remote);
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
        .expect("Should send request");
    let received = read_exact_len(&mut client, 16);
    assert!(received.starts_with(b"HTTP/1."));

    let sessions = recorder.sessions.lock().clone();
    assert_parsed_get(&sessions[0]);

    drop(client);
    shard.stop();
}
