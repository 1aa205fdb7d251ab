//! Integration tests for tun-interceptor
//!
//! # Test Organization
//!
//! - `nat`: dispatcher and TCP NAT rewriting over an in-memory tunnel
//! - `tcp_relay`: proxy shards relaying to loopback servers
//! - `udp_relay`: UDP relay and reply synthesis against a loopback echo
//! - `config`: configuration loading from files
//!
//! # Test Requirements
//!
//! - Everything runs on loopback with an in-memory `TunDevice`
//! - Tests marked with `#[ignore]` reach the real network

pub mod config;
pub mod nat;
pub mod tcp_relay;
pub mod udp_relay;

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tun_interceptor::dispatcher::TunDevice;
use tun_interceptor::event::{EventBus, ImportantEvent};
use tun_interceptor::packet::{IpHeader, TcpHeader, UdpHeader};

/// Tunnel device backed by memory
///
/// Reads return queued frames, or `WouldBlock` after a short pause when
/// none are queued. Writes are collected.
#[derive(Default)]
pub struct MemoryTun {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTun {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, frame: Vec<u8>) {
        self.inbound.lock().push_back(frame);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    /// Wait until at least `count` frames were written
    pub fn wait_written(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let written = self.written();
            if written.len() >= count {
                return written;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.written()
    }
}

impl TunDevice for MemoryTun {
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(frame) = self.inbound.lock().pop_front() {
            let len = frame.len().min(buf.len());
            buf[..len].copy_from_slice(&frame[..len]);
            return Ok(len);
        }
        std::thread::sleep(Duration::from_millis(5));
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn write_packet(&self, frame: &[u8]) -> io::Result<()> {
        self.written.lock().push(frame.to_vec());
        Ok(())
    }
}

/// Event bus that records every posted event
pub fn recording_events() -> (Arc<EventBus>, Arc<Mutex<Vec<ImportantEvent>>>) {
    let events = Arc::new(EventBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    events.add_listener(Arc::new(move |event: &ImportantEvent| {
        sink.lock().push(event.clone());
    }));
    (events, seen)
}

fn ipv4_frame(protocol: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = u16::try_from(20 + payload.len()).expect("Should fit in a frame");
    let mut frame = vec![0u8; 20];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&total.to_be_bytes());
    frame[8] = 64;
    frame[9] = protocol;
    frame[12..16].copy_from_slice(&src);
    frame[16..20].copy_from_slice(&dst);
    frame.extend_from_slice(payload);
    frame
}

/// IPv4 TCP segment with valid checksums
pub fn ipv4_tcp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut segment = vec![0u8; 20];
    segment[0..2].copy_from_slice(&sport.to_be_bytes());
    segment[2..4].copy_from_slice(&dport.to_be_bytes());
    segment[4..8].copy_from_slice(&1u32.to_be_bytes());
    segment[12] = 5 << 4;
    segment[13] = flags;
    segment[14..16].copy_from_slice(&65535u16.to_be_bytes());
    segment.extend_from_slice(payload);

    let mut frame = ipv4_frame(6, src, dst, &segment);
    let mut header = IpHeader::parse(&mut frame[..]).expect("Should parse built frame");
    header.fill_checksum();
    let pseudo = header.pseudo_header_sum();
    TcpHeader::new_unchecked(header.payload_mut()).fill_checksum(pseudo);
    frame
}

/// IPv4 UDP datagram with valid checksums
pub fn ipv4_udp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
    let length = u16::try_from(8 + payload.len()).expect("Should fit in a datagram");
    let mut datagram = vec![0u8; 8];
    datagram[0..2].copy_from_slice(&sport.to_be_bytes());
    datagram[2..4].copy_from_slice(&dport.to_be_bytes());
    datagram[4..6].copy_from_slice(&length.to_be_bytes());
    datagram.extend_from_slice(payload);

    let mut frame = ipv4_frame(17, src, dst, &datagram);
    let mut header = IpHeader::parse(&mut frame[..]).expect("Should parse built frame");
    header.fill_checksum();
    let pseudo = header.pseudo_header_sum();
    UdpHeader::new_unchecked(header.payload_mut()).fill_checksum(pseudo);
    frame
}

/// Whether the IP and transport checksums of `frame` are both valid
pub fn checksums_valid(frame: &[u8]) -> bool {
    let header = IpHeader::parse(frame).expect("Should parse frame");
    let ip_ok = match &header {
        IpHeader::V4(h) => h.verify_checksum(),
        IpHeader::V6(_) => true,
    };
    let pseudo = header.pseudo_header_sum();
    let transport_ok = match header.protocol_code() {
        6 => TcpHeader::new_checked(header.payload()).is_some_and(|t| t.verify_checksum(pseudo)),
        17 => UdpHeader::new_checked(header.payload()).is_some_and(|u| u.verify_checksum(pseudo)),
        _ => false,
    };
    ip_ok && transport_ok
}
