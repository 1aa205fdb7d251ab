//! TCP bandwidth shaping
//!
//! Shaping sits between the NAT rewrite and the tunnel device. Rewritten
//! frames are queued per direction and released by one writer thread as the
//! token bucket for that direction allows.
//!
//! ```text
//! TcpPacketInterceptor ──rewrite──► ShapedWriter::submit(direction, frame)
//!                                         │
//!                          request queue  │  response queue
//!                                         ▼
//!                       writer thread (Condvar wait / bucket delay)
//!                                         │
//!                                         ▼
//!                                TunDevice::write_packet
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::BandwidthConfig;
use crate::dispatcher::TunDevice;
use crate::error::{ProxyError, Result};
use crate::reactor::Lifecycle;

/// Token bucket measured in KB/s
///
/// The bucket fills at the configured rate up to one second of burst. A
/// packet is released whenever the bucket is not in debt, which may push it
/// into debt; the next packet then waits until the debt is repaid.
#[derive(Debug)]
pub struct BandwidthLimiter {
    bytes_per_sec: f64,
    burst: f64,
    stored: f64,
    last_update: Instant,
}

impl BandwidthLimiter {
    #[must_use]
    pub fn new(limit_kbps: u64) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let bytes_per_sec = (limit_kbps.max(1) * 1024) as f64;
        Self {
            bytes_per_sec,
            burst: bytes_per_sec,
            stored: 0.0,
            last_update: Instant::now(),
        }
    }

    /// Ask to transmit `len` bytes now
    ///
    /// Returns `None` and charges the bucket if the packet may go, or the
    /// delay after which the caller should ask again.
    pub fn next_can_transmit(&mut self, len: usize) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.stored = (self.stored + elapsed * self.bytes_per_sec).min(self.burst);

        if self.stored >= 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let cost = len as f64;
            self.stored -= cost;
            return None;
        }
        Some(Duration::from_secs_f64(-self.stored / self.bytes_per_sec))
    }
}

/// Direction of a shaped frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client towards the proxy shard
    Request,
    /// Proxy shard back towards the client
    Response,
}

struct Pending {
    frame: Vec<u8>,
    queued_at: Instant,
}

struct Lane {
    queue: VecDeque<Pending>,
    limiter: Option<BandwidthLimiter>,
    ready_at: Option<Instant>,
}

impl Lane {
    fn new(limit_kbps: Option<u64>) -> Self {
        Self {
            queue: VecDeque::new(),
            limiter: limit_kbps.map(BandwidthLimiter::new),
            ready_at: None,
        }
    }

    /// Pop every frame that may go now, dropping stale ones
    fn drain_ready(&mut self, stale_after: Option<Duration>, now: Instant, out: &mut Vec<Vec<u8>>) {
        if self.ready_at.is_some_and(|at| at > now) {
            return;
        }
        self.ready_at = None;
        while let Some(head) = self.queue.front() {
            if stale_after.is_some_and(|limit| now.duration_since(head.queued_at) > limit) {
                trace!(len = head.frame.len(), "Dropping stale shaped frame");
                self.queue.pop_front();
                continue;
            }
            let wait = match &mut self.limiter {
                Some(limiter) => limiter.next_can_transmit(head.frame.len()),
                None => None,
            };
            if let Some(wait) = wait {
                trace!(wait_ms = wait.as_millis(), "Bandwidth exhausted");
                self.ready_at = Some(now + wait);
                break;
            }
            if let Some(pending) = self.queue.pop_front() {
                out.push(pending.frame);
            }
        }
    }
}

struct Lanes {
    request: Lane,
    response: Lane,
}

struct Shared {
    lanes: Mutex<Lanes>,
    signal: Condvar,
    stale_after: Option<Duration>,
    lifecycle: Arc<Lifecycle>,
}

/// Queues rewritten TCP frames and writes them out at the shaped rate
pub struct ShapedWriter {
    shared: Arc<Shared>,
}

impl ShapedWriter {
    /// Start the writer thread
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Reactor` if the thread cannot be spawned.
    pub fn spawn(
        config: &BandwidthConfig,
        tun: Arc<dyn TunDevice>,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let shared = Arc::new(Shared {
            lanes: Mutex::new(Lanes {
                request: Lane::new(config.request_limit_kbps),
                response: Lane::new(config.response_limit_kbps),
            }),
            signal: Condvar::new(),
            stale_after: config.stale_timeout(),
            lifecycle,
        });

        let waker = Arc::clone(&shared);
        shared.lifecycle.on_stop(move || {
            let _guard = waker.lanes.lock();
            waker.signal.notify_all();
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("tcp-shaper".into())
            .spawn(move || run_writer(&worker, tun.as_ref()))
            .map_err(|e| ProxyError::Reactor(format!("bandwidth shaper thread: {e}")))?;

        Ok((Self { shared }, handle))
    }

    /// Queue a rewritten frame
    pub fn submit(&self, direction: Direction, frame: Vec<u8>) {
        let mut lanes = self.shared.lanes.lock();
        let lane = match direction {
            Direction::Request => &mut lanes.request,
            Direction::Response => &mut lanes.response,
        };
        lane.queue.push_back(Pending {
            frame,
            queued_at: Instant::now(),
        });
        self.shared.signal.notify_one();
    }

    /// Frames waiting in both directions
    #[must_use]
    pub fn queued(&self) -> usize {
        let lanes = self.shared.lanes.lock();
        lanes.request.queue.len() + lanes.response.queue.len()
    }
}

impl std::fmt::Debug for ShapedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapedWriter").field("queued", &self.queued()).finish()
    }
}

fn run_writer(shared: &Shared, tun: &dyn TunDevice) {
    debug!("Bandwidth shaper started");
    let mut ready = Vec::new();
    while shared.lifecycle.is_alive() {
        {
            let mut lanes = shared.lanes.lock();
            let now = Instant::now();
            lanes.request.drain_ready(shared.stale_after, now, &mut ready);
            lanes.response.drain_ready(shared.stale_after, now, &mut ready);

            if ready.is_empty() {
                if !shared.lifecycle.is_alive() {
                    break;
                }
                let wake = [&lanes.request, &lanes.response]
                    .into_iter()
                    .filter(|lane| !lane.queue.is_empty())
                    .filter_map(|lane| lane.ready_at)
                    .min();
                match wake {
                    Some(at) => {
                        shared.signal.wait_until(&mut lanes, at);
                    }
                    None => shared.signal.wait(&mut lanes),
                }
                continue;
            }
        }

        for frame in ready.drain(..) {
            if let Err(e) = tun.write_packet(&frame) {
                warn!("Shaped frame write failed: {}", e);
            }
        }
    }
    debug!("Bandwidth shaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectTun(Mutex<Vec<Vec<u8>>>);

    impl TunDevice for CollectTun {
        fn read_packet(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn write_packet(&self, frame: &[u8]) -> std::io::Result<()> {
            self.0.lock().push(frame.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_limiter_allows_then_delays() {
        let mut limiter = BandwidthLimiter::new(1);
        assert!(limiter.next_can_transmit(4096).is_none());
        let wait = limiter.next_can_transmit(10).expect("Should be in debt");
        // 4096 bytes of debt at 1024 B/s
        assert!(wait > Duration::from_secs(3) && wait <= Duration::from_secs(4));
    }

    #[test]
    fn test_limiter_refills_over_time() {
        let mut limiter = BandwidthLimiter::new(1000);
        assert!(limiter.next_can_transmit(1024).is_none());
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.next_can_transmit(1024).is_none());
    }

    #[test]
    fn test_writer_releases_frames_in_order() {
        let lifecycle = Lifecycle::new();
        let tun = Arc::new(CollectTun::default());
        let config = BandwidthConfig {
            request_limit_kbps: Some(10_000),
            response_limit_kbps: None,
            stale_timeout_ms: None,
        };
        let (writer, handle) =
            ShapedWriter::spawn(&config, Arc::clone(&tun) as Arc<dyn TunDevice>, Arc::clone(&lifecycle))
                .expect("Should spawn");

        writer.submit(Direction::Request, vec![1]);
        writer.submit(Direction::Request, vec![2]);
        writer.submit(Direction::Response, vec![3]);

        let deadline = Instant::now() + Duration::from_secs(5);
        while tun.0.lock().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        lifecycle.stop();
        handle.join().expect("Should join writer");

        let written = tun.0.lock().clone();
        assert_eq!(written.len(), 3);
        let requests: Vec<_> = written.iter().filter(|f| f[0] != 3).cloned().collect();
        assert_eq!(requests, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_stale_frames_dropped() {
        let mut lane = Lane::new(Some(1));
        let old = Instant::now();
        lane.queue.push_back(Pending {
            frame: vec![0; 10],
            queued_at: old,
        });
        let mut out = Vec::new();
        lane.drain_ready(Some(Duration::from_millis(1)), old + Duration::from_millis(50), &mut out);
        assert!(out.is_empty());
        assert!(lane.queue.is_empty());
    }
}
