//! TCP client ingress.
//!
//! Connects to the SERVAL server, reads into large application buffers,
//! and pushes word-aligned byte buffers into the back-pressure queue. An
//! unaligned tail (at most 7 bytes) is carried into the next read; on
//! disconnect those bytes are counted as dropped-incomplete. Reconnects
//! with a short backoff unless configured to exit on disconnect.

use crate::error::{IngressError, Result};
use crate::queue::BufferQueue;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Reconnect backoff after a failed connect or a disconnect.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Read timeout so the loop observes the stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Keepalive settings: 5 s idle, 5 s interval, 3 probes.
const KEEPALIVE_TIME: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_RETRIES: u32 = 3;

/// Default application read buffer.
pub const DEFAULT_READ_BUFFER: usize = 1024 * 1024;

/// Requested kernel receive buffer; the kernel may clamp it.
pub const DEFAULT_RECV_BUFFER: usize = 64 * 1024 * 1024;

/// TCP ingress configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Return after the first disconnect instead of reconnecting.
    pub exit_on_disconnect: bool,
    /// Application read buffer size.
    pub read_buffer_bytes: usize,
    /// Requested `SO_RCVBUF`.
    pub recv_buffer_bytes: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8085,
            exit_on_disconnect: false,
            read_buffer_bytes: DEFAULT_READ_BUFFER,
            recv_buffer_bytes: DEFAULT_RECV_BUFFER,
        }
    }
}

/// Connection counters, updated by the receive loop and read by printers.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    connections: AtomicU64,
    disconnects: AtomicU64,
    bytes_received: AtomicU64,
    bytes_dropped_incomplete: AtomicU64,
}

/// Point-in-time copy of the connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Successful connects.
    pub connections: u64,
    /// Disconnects observed.
    pub disconnects: u64,
    /// Bytes received over all connections.
    pub bytes_received: u64,
    /// Tail bytes lost to disconnects mid-word.
    pub bytes_dropped_incomplete: u64,
}

impl ConnectionCounters {
    /// Copies the counters out.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            connections: self.connections.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_dropped_incomplete: self.bytes_dropped_incomplete.load(Ordering::Relaxed),
        }
    }
}

/// TCP client feeding the buffer queue.
pub struct TcpIngress {
    config: TcpConfig,
    stop: Arc<AtomicBool>,
    counters: Arc<ConnectionCounters>,
}

impl TcpIngress {
    /// Creates an ingress observing `stop` for shutdown.
    #[must_use]
    pub fn new(config: TcpConfig, stop: Arc<AtomicBool>) -> Self {
        Self {
            config,
            stop,
            counters: Arc::new(ConnectionCounters::default()),
        }
    }

    /// Shared connection counters.
    #[must_use]
    pub fn counters(&self) -> Arc<ConnectionCounters> {
        Arc::clone(&self.counters)
    }

    /// Runs the connect/read loop until stop is set, or until the first
    /// disconnect in exit-on-disconnect mode. The queue is closed before
    /// returning so the parser drains and finishes.
    pub fn run(&self, queue: &BufferQueue) -> Result<()> {
        let result = self.run_inner(queue);
        queue.close();
        result
    }

    fn run_inner(&self, queue: &BufferQueue) -> Result<()> {
        let addr = self.resolve()?;
        while !self.stop.load(Ordering::Acquire) {
            let stream = match self.connect(addr) {
                Ok(stream) => {
                    info!("[TCP] connected to {addr}");
                    self.counters.connections.fetch_add(1, Ordering::Relaxed);
                    stream
                }
                Err(err) => {
                    if self.config.exit_on_disconnect {
                        return Err(err);
                    }
                    std::thread::sleep(RECONNECT_BACKOFF);
                    continue;
                }
            };

            self.read_loop(stream, queue);

            if self.stop.load(Ordering::Acquire) {
                break;
            }
            self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
            if self.config.exit_on_disconnect {
                info!("[TCP] disconnected, exiting");
                break;
            }
            info!("[TCP] disconnected, reconnecting");
            std::thread::sleep(RECONNECT_BACKOFF);
        }
        Ok(())
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.config.host, self.config.port);
        target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| IngressError::AddressResolution(target))
    }

    fn connect(&self, addr: SocketAddr) -> Result<TcpStream> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        socket.set_tcp_keepalive(&keepalive)?;
        socket.set_nodelay(true)?;
        if let Err(err) = socket.set_recv_buffer_size(self.config.recv_buffer_bytes) {
            // The kernel may clamp or refuse; throughput degrades but the
            // stream stays correct.
            warn!("[TCP] SO_RCVBUF request failed: {err}");
        }

        socket.connect(&addr.into())?;
        let stream: TcpStream = socket.into();
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(stream)
    }

    /// Reads until disconnect or stop, pushing word-aligned buffers.
    fn read_loop(&self, mut stream: TcpStream, queue: &BufferQueue) {
        let mut buf = vec![0u8; self.config.read_buffer_bytes.max(4096)];
        let mut tail_len = 0usize;

        while !self.stop.load(Ordering::Acquire) {
            match stream.read(&mut buf[tail_len..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.counters
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    let total = tail_len + n;
                    let aligned = total - total % 8;
                    if aligned > 0 {
                        queue.push(buf[..aligned].to_vec());
                    }
                    buf.copy_within(aligned..total, 0);
                    tail_len = total - aligned;
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut
                        || err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("[TCP] read error: {err}");
                    break;
                }
            }
        }

        if tail_len > 0 {
            self.counters
                .bytes_dropped_incomplete
                .fetch_add(tail_len as u64, Ordering::Relaxed);
            warn!("[TCP] connection ended mid-word: {tail_len} byte(s) dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Instant;

    fn config_for(port: u16, exit_on_disconnect: bool) -> TcpConfig {
        TcpConfig {
            host: "127.0.0.1".to_string(),
            port,
            exit_on_disconnect,
            read_buffer_bytes: 4096,
            recv_buffer_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn test_receive_aligned_words() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            // Two whole words split across writes plus a 3-byte tail.
            conn.write_all(&0xB000_0000_0000_0000u64.to_le_bytes()[..5])
                .unwrap();
            conn.flush().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            conn.write_all(&0xB000_0000_0000_0000u64.to_le_bytes()[5..])
                .unwrap();
            conn.write_all(&0x6F00_0000_0000_00C0u64.to_le_bytes())
                .unwrap();
            conn.write_all(&[0x01, 0x02, 0x03]).unwrap();
            conn.flush().unwrap();
        });

        let stop = Arc::new(AtomicBool::new(false));
        let ingress = TcpIngress::new(config_for(port, true), stop);
        let queue = BufferQueue::new(16);
        ingress.run(&queue).unwrap();
        server.join().unwrap();

        let mut received = Vec::new();
        while let Some(buf) = queue.pop_timeout(Duration::from_millis(1)) {
            received.extend_from_slice(&buf);
        }
        assert_eq!(received.len(), 16);
        assert_eq!(received.len() % 8, 0);

        let stats = ingress.counters().snapshot();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.bytes_received, 19);
        assert_eq!(stats.bytes_dropped_incomplete, 3);
        assert!(queue.is_finished());
    }

    #[test]
    fn test_stop_flag_breaks_read_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            // Accept and hold the connection open without sending.
            let (conn, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(500));
            drop(conn);
        });

        let stop = Arc::new(AtomicBool::new(false));
        let ingress = TcpIngress::new(config_for(port, false), Arc::clone(&stop));
        let queue = Arc::new(BufferQueue::new(4));

        let runner = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || ingress.run(&queue))
        };

        std::thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::Release);
        let start = Instant::now();
        runner.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(queue.is_finished());
        server.join().unwrap();
    }

    #[test]
    fn test_connect_failure_with_exit_on_disconnect() {
        // A port with no listener: exit-on-disconnect surfaces the error.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let stop = Arc::new(AtomicBool::new(false));
        let ingress = TcpIngress::new(config_for(port, true), stop);
        let queue = BufferQueue::new(4);
        assert!(ingress.run(&queue).is_err());
        assert!(queue.is_finished());
    }
}
