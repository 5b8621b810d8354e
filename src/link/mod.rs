//! Vehicle link management
//!
//! Owns the single datagram connection to the vehicle: establishes it,
//! watches heartbeat liveness, reconnects with exponential backoff, and
//! feeds every inbound datagram through the decoder into the aggregator.
//!
//! The reader thread is the only writer of the snapshot; decode and
//! aggregation happen inline on it so the snapshot never has competing
//! writers.

pub mod transport;

use crate::command::CommandDispatcher;
use crate::config::{LinkConfig, VehicleConfig};
use crate::error::{Error, Result};
use crate::hub::SubscriptionHub;
use crate::protocol::{decode, TxFrame};
use crate::state::Aggregator;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use transport::{DatagramTransport, MAX_DATAGRAM_SIZE};

/// Factory recreating the transport for each connection attempt
pub type TransportFactory = Box<dyn Fn() -> Result<Arc<dyn DatagramTransport>> + Send + Sync>;

/// Connection state of the vehicle link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No link established
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Heartbeats arriving normally
    Connected,
    /// Liveness window elapsed, reconnect cycle running
    Degraded,
}

/// Connection handle state, recreated (not mutated in place) on reconnect
#[derive(Debug, Clone)]
pub struct VehicleLink {
    pub address: String,
    pub port: u16,
    pub state: LinkState,
    pub last_heartbeat: Option<Instant>,
    /// Attempts in the current reconnect cycle
    pub retry_count: u32,
}

impl VehicleLink {
    fn disconnected(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            state: LinkState::Disconnected,
            last_heartbeat: None,
            retry_count: 0,
        }
    }

    fn connected(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            state: LinkState::Connected,
            last_heartbeat: Some(Instant::now()),
            retry_count: 0,
        }
    }
}

/// Serializable link summary for the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub address: String,
    pub port: u16,
    pub retry_count: u32,
    pub reconnect_count: u32,
    pub last_heartbeat_age_ms: Option<u64>,
    pub rx_datagrams: u64,
    pub tx_frames: u64,
    pub decode_dropped: u64,
}

#[derive(Default)]
struct LinkCounters {
    reconnects: AtomicU32,
    rx_datagrams: AtomicU64,
    tx_frames: AtomicU64,
    decode_dropped: AtomicU64,
}

/// Owner of the vehicle-facing datagram link
pub struct LinkManager {
    vehicle: VehicleConfig,
    config: LinkConfig,
    factory: TransportFactory,
    aggregator: Arc<Aggregator>,
    link: Mutex<VehicleLink>,
    transport: Mutex<Option<Arc<dyn DatagramTransport>>>,
    counters: LinkCounters,
    tx_seq: AtomicU32,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LinkManager {
    pub fn new(
        vehicle: VehicleConfig,
        config: LinkConfig,
        factory: TransportFactory,
        aggregator: Arc<Aggregator>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let link = VehicleLink::disconnected(&vehicle.address, vehicle.port);
        Self {
            vehicle,
            config,
            factory,
            aggregator,
            link: Mutex::new(link),
            transport: Mutex::new(None),
            counters: LinkCounters::default(),
            tx_seq: AtomicU32::new(0),
            running,
            reader: Mutex::new(None),
        }
    }

    /// Establish the link: open a transport, announce ourselves, wait for
    /// the first vehicle heartbeat
    ///
    /// UDP has no session, so the first heartbeat doubles as the
    /// reachability probe. Fails with [`Error::LinkUnreachable`] when no
    /// heartbeat arrives within the connect timeout.
    pub fn connect(&self) -> Result<()> {
        self.set_state(LinkState::Connecting);

        let transport = (self.factory)()?;
        log::info!("link: connecting to {}", transport.peer());

        let mut tx = TxFrame::new();
        tx.set_heartbeat(self.next_seq());
        let _ = transport.send(tx.as_bytes());

        let deadline = Instant::now() + self.config.connect_timeout();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            if !self.running.load(Ordering::Relaxed) || Instant::now() >= deadline {
                self.set_state(LinkState::Disconnected);
                return Err(Error::LinkUnreachable(format!(
                    "no heartbeat from {} within {:?}",
                    transport.peer(),
                    self.config.connect_timeout()
                )));
            }

            match transport.recv(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if decode(&buf[..n]).heartbeat {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP port-unreachable and friends surface here
                    self.set_state(LinkState::Disconnected);
                    return Err(Error::LinkUnreachable(e.to_string()));
                }
            }
        }

        // Fresh link handle per connection
        *self.transport.lock() = Some(transport);
        *self.link.lock() = VehicleLink::connected(&self.vehicle.address, self.vehicle.port);
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        self.aggregator.set_link_down(false);
        log::info!("link: connected to {}", self.vehicle.endpoint());
        Ok(())
    }

    /// Spawn the reader thread feeding the aggregator, dispatcher and hub
    pub fn start(
        self: &Arc<Self>,
        dispatcher: Arc<CommandDispatcher>,
        hub: Arc<SubscriptionHub>,
    ) -> Result<()> {
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("link-reader".to_string())
            .spawn(move || manager.read_loop(dispatcher, hub))?;
        *self.reader.lock() = Some(handle);
        Ok(())
    }

    /// Transmit a pre-serialized frame to the vehicle
    ///
    /// Non-blocking from the caller's perspective. Fails immediately with
    /// [`Error::LinkUnavailable`] when no link is connected; nothing is
    /// queued for later, so commands are never replayed after a reconnect.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.state() != LinkState::Connected {
            return Err(Error::LinkUnavailable);
        }
        let transport = self
            .transport
            .lock()
            .clone()
            .ok_or(Error::LinkUnavailable)?;
        transport.send(bytes)?;
        self.counters.tx_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Next wrapping TX sequence number
    pub fn next_seq(&self) -> u8 {
        (self.tx_seq.fetch_add(1, Ordering::Relaxed) & 0xFF) as u8
    }

    pub fn state(&self) -> LinkState {
        self.link.lock().state
    }

    /// Link summary for the status query
    pub fn status(&self) -> LinkStatus {
        let link = self.link.lock().clone();
        LinkStatus {
            state: link.state,
            address: link.address,
            port: link.port,
            retry_count: link.retry_count,
            reconnect_count: self.counters.reconnects.load(Ordering::Relaxed),
            last_heartbeat_age_ms: link
                .last_heartbeat
                .map(|t| t.elapsed().as_millis() as u64),
            rx_datagrams: self.counters.rx_datagrams.load(Ordering::Relaxed),
            tx_frames: self.counters.tx_frames.load(Ordering::Relaxed),
            decode_dropped: self.counters.decode_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the reader and mark all state stale
    pub fn stop(&self) {
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
        self.set_state(LinkState::Disconnected);
        self.aggregator.set_link_down(true);
        log::info!("link: stopped");
    }

    fn set_state(&self, state: LinkState) {
        self.link.lock().state = state;
    }

    fn current_transport(&self) -> Option<Arc<dyn DatagramTransport>> {
        self.transport.lock().clone()
    }

    fn read_loop(&self, dispatcher: Arc<CommandDispatcher>, hub: Arc<SubscriptionHub>) {
        log::info!("link: reader thread started");
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut last_heartbeat_tx = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            if self.state() != LinkState::Connected {
                self.reconnect_cycle();
                continue;
            }

            let Some(transport) = self.current_transport() else {
                self.set_state(LinkState::Disconnected);
                continue;
            };

            match transport.recv(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    self.counters.rx_datagrams.fetch_add(1, Ordering::Relaxed);
                    let out = decode(&buf[..n]);

                    if out.dropped > 0 {
                        self.counters
                            .decode_dropped
                            .fetch_add(out.dropped as u64, Ordering::Relaxed);
                        log::debug!("link: dropped {} undecodable frame(s)", out.dropped);
                    }
                    if out.heartbeat {
                        self.link.lock().last_heartbeat = Some(Instant::now());
                    }
                    for ack in &out.acks {
                        dispatcher.handle_ack(ack.seq, ack.result);
                    }
                    if !out.fields.is_empty() {
                        self.aggregator.apply(out.fields);
                        hub.publish();
                    }
                }
                Err(e) => {
                    log::warn!("link: read error: {}", e);
                    thread::sleep(Duration::from_millis(10));
                }
            }

            // Periodic surface heartbeat so the vehicle sees us alive
            if last_heartbeat_tx.elapsed() >= self.config.heartbeat_interval() {
                let mut tx = TxFrame::new();
                tx.set_heartbeat(self.next_seq());
                if let Err(e) = self.send(tx.as_bytes()) {
                    log::debug!("link: heartbeat send failed: {}", e);
                }
                last_heartbeat_tx = Instant::now();
            }

            // Liveness: no vehicle heartbeat inside the window means degraded
            let expired = {
                let link = self.link.lock();
                match link.last_heartbeat {
                    Some(t) => t.elapsed() > self.config.liveness_window(),
                    None => true,
                }
            };
            if expired {
                log::warn!(
                    "link: no heartbeat from {} for {:?}, degraded",
                    self.vehicle.endpoint(),
                    self.config.liveness_window()
                );
                self.set_state(LinkState::Degraded);
                self.aggregator.set_link_down(true);
            }
        }

        log::info!("link: reader thread stopped");
    }

    /// Reconnect with exponential backoff, unbounded attempts
    fn reconnect_cycle(&self) {
        let mut backoff = self.config.backoff_base();
        let mut attempt: u32 = 0;

        while self.running.load(Ordering::Relaxed) {
            attempt += 1;
            {
                let mut link = self.link.lock();
                link.state = LinkState::Connecting;
                link.retry_count = attempt;
            }
            log::info!(
                "link: reconnect attempt {} to {} (backoff {:?})",
                attempt,
                self.vehicle.endpoint(),
                backoff
            );

            match self.connect() {
                Ok(()) => {
                    log::info!("link: reconnected after {} attempt(s)", attempt);
                    return;
                }
                Err(e) => {
                    log::warn!("link: reconnect attempt {} failed: {}", attempt, e);
                    let mut link = self.link.lock();
                    link.state = LinkState::Degraded;
                    link.retry_count = attempt;
                }
            }

            // Interruptible backoff sleep
            let deadline = Instant::now() + backoff;
            while self.running.load(Ordering::Relaxed) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            backoff = (backoff * 2).min(self.config.backoff_max());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::transport::MockTransport;
    use super::*;
    use crate::protocol::frame::encode_frame;
    use crate::protocol::MSG_HEARTBEAT;

    fn test_link_config() -> LinkConfig {
        LinkConfig {
            connect_timeout_ms: 200,
            liveness_window_ms: 150,
            heartbeat_interval_ms: 50,
            reconnect_backoff_base_ms: 20,
            reconnect_backoff_max_ms: 100,
        }
    }

    fn test_vehicle() -> VehicleConfig {
        VehicleConfig {
            name: "test".to_string(),
            address: "127.0.0.1".to_string(),
            port: 14550,
        }
    }

    fn manager_with_mock() -> (Arc<LinkManager>, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::new());
        let factory_mock = Arc::clone(&mock);
        let factory: TransportFactory = Box::new(move || {
            Ok(Arc::clone(&factory_mock) as Arc<dyn DatagramTransport>)
        });
        let manager = Arc::new(LinkManager::new(
            test_vehicle(),
            test_link_config(),
            factory,
            Arc::new(Aggregator::new()),
            Arc::new(AtomicBool::new(true)),
        ));
        (manager, mock)
    }

    fn heartbeat_datagram() -> Vec<u8> {
        encode_frame(1, MSG_HEARTBEAT, &[0, 19])
    }

    #[test]
    fn test_connect_waits_for_heartbeat() {
        let (manager, mock) = manager_with_mock();
        mock.push_datagram(heartbeat_datagram());

        manager.connect().unwrap();
        assert_eq!(manager.state(), LinkState::Connected);
        // The surface announced itself before the vehicle answered
        assert_eq!(mock.sent_count(), 1);
        assert!(!manager.aggregator.is_link_down());
    }

    #[test]
    fn test_connect_timeout_is_unreachable() {
        let (manager, _mock) = manager_with_mock();

        let err = manager.connect().unwrap_err();
        assert!(matches!(err, Error::LinkUnreachable(_)));
        assert_eq!(manager.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_send_without_link_fails_immediately() {
        let (manager, mock) = manager_with_mock();

        let err = manager.send(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::LinkUnavailable));
        // Nothing queued for later replay
        assert_eq!(mock.sent_count(), 0);
    }

    #[test]
    fn test_send_when_connected() {
        let (manager, mock) = manager_with_mock();
        mock.push_datagram(heartbeat_datagram());
        manager.connect().unwrap();

        manager.send(&[0xAB]).unwrap();
        assert_eq!(mock.sent_count(), 2);
        assert_eq!(manager.status().tx_frames, 1);
    }

    #[test]
    fn test_status_reports_counters() {
        let (manager, mock) = manager_with_mock();
        mock.push_datagram(heartbeat_datagram());
        manager.connect().unwrap();

        let status = manager.status();
        assert_eq!(status.state, LinkState::Connected);
        assert_eq!(status.reconnect_count, 1);
        assert!(status.last_heartbeat_age_ms.is_some());
    }
}
