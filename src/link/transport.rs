//! Datagram transport abstraction
//!
//! The link manager talks to the vehicle through this trait so the rest of
//! the pipeline can be exercised against a scripted transport in tests.

use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::UdpSocket;
use std::time::Duration;

/// Largest datagram the reader will accept
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Transport trait for vehicle datagram communication
///
/// `recv` blocks up to the transport's poll interval and returns `Ok(0)`
/// when nothing arrived, so callers can interleave liveness checks and
/// shutdown-flag polling.
pub trait DatagramTransport: Send + Sync {
    /// Receive one datagram into `buf`, returning its length (0 = nothing)
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send one datagram
    fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Peer description for logs
    fn peer(&self) -> String;
}

/// UDP transport bound to an ephemeral local port and connected to the
/// vehicle endpoint
pub struct UdpTransport {
    socket: UdpSocket,
    endpoint: String,
}

impl UdpTransport {
    /// Open a socket towards the vehicle endpoint
    ///
    /// `poll_interval` bounds how long a single `recv` call blocks.
    pub fn open(endpoint: &str, poll_interval: Duration) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(endpoint)?;
        socket.set_read_timeout(Some(poll_interval))?;
        Ok(Self {
            socket,
            endpoint: endpoint.to_string(),
        })
    }
}

impl DatagramTransport for UdpTransport {
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.socket.send(buf)?)
    }

    fn peer(&self) -> String {
        self.endpoint.clone()
    }
}

/// Scripted in-memory transport for tests
///
/// Inbound datagrams are queued with [`MockTransport::push_datagram`];
/// everything sent is captured for inspection.
#[derive(Default)]
pub struct MockTransport {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound: Mutex<Vec<Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a datagram for the next `recv` call
    pub fn push_datagram(&self, data: Vec<u8>) {
        self.inbound.lock().push_back(data);
    }

    /// Everything sent through this transport so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().clone()
    }

    /// Number of datagrams sent through this transport
    pub fn sent_count(&self) -> usize {
        self.outbound.lock().len()
    }
}

impl DatagramTransport for MockTransport {
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if let Some(data) = self.inbound.lock().pop_front() {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            return Ok(n);
        }
        // Mimic a poll-interval wait so callers don't spin
        std::thread::sleep(Duration::from_millis(2));
        Ok(0)
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        self.outbound.lock().push(buf.to_vec());
        Ok(buf.len())
    }

    fn peer(&self) -> String {
        "mock".to_string()
    }
}
