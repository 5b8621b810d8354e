//! Snapshot fan-out to observers
//!
//! Every subscriber gets its own bounded queue and writer thread, so one
//! stalled consumer can never block the link reader or any other consumer.
//! Snapshots are full state, not deltas: when a subscriber falls behind,
//! older pending snapshots are superseded by the newest one instead of
//! accumulating as a backlog.

use crate::api::wire::{self, Serializer};
use crate::config::ApiConfig;
use crate::error::Result;
use crate::state::{Aggregator, VehicleSnapshot};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Delivery pressure state of one subscriber
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureState {
    /// Keeping up
    Normal,
    /// Pending snapshots were superseded at least once
    Throttled,
    /// Transport failed, being torn down
    Disconnecting,
}

/// Where serialized snapshot frames go for one subscriber
pub trait SnapshotSink: Send {
    /// Write one length-prefixed snapshot frame
    fn send_snapshot(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

/// Writer-loop wake poll interval when no publishes arrive
const IDLE_WAKE: Duration = Duration::from_millis(250);

struct SubscriberShared {
    id: u64,
    peer: String,
    queue: ArrayQueue<Arc<VehicleSnapshot>>,
    wake_tx: Sender<()>,
    state: Mutex<BackpressureState>,
    last_version: AtomicU64,
    alive: AtomicBool,
}

/// Fan-out hub: owns all subscribers and the broadcast tick
pub struct SubscriptionHub {
    config: ApiConfig,
    staleness: Duration,
    aggregator: Arc<Aggregator>,
    serializer: Serializer,
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    /// Serializes snapshot-capture + enqueue so no subscriber can observe
    /// a lower version after a higher one
    publish_gate: Mutex<()>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHub {
    pub fn new(
        config: ApiConfig,
        staleness: Duration,
        aggregator: Arc<Aggregator>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            staleness,
            aggregator,
            serializer: Serializer::default(),
            subscribers: Mutex::new(Vec::new()),
            publish_gate: Mutex::new(()),
            next_id: AtomicU64::new(0),
            running,
            ticker: Mutex::new(None),
        }
    }

    /// Register a subscriber and spawn its writer thread
    pub fn subscribe(&self, peer: String, sink: Box<dyn SnapshotSink>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (wake_tx, wake_rx) = bounded::<()>(1);

        let shared = Arc::new(SubscriberShared {
            id,
            peer: peer.clone(),
            queue: ArrayQueue::new(self.config.queue_depth.max(1)),
            wake_tx,
            state: Mutex::new(BackpressureState::Normal),
            last_version: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        });

        let writer_shared = Arc::clone(&shared);
        let serializer = self.serializer.clone();
        let running = Arc::clone(&self.running);
        thread::Builder::new()
            .name(format!("subscriber-{}", id))
            .spawn(move || writer_loop(writer_shared, sink, serializer, wake_rx, running))?;

        self.subscribers.lock().push(shared);
        log::info!("subscriber {} connected: {}", id, peer);
        Ok(id)
    }

    /// Tear a subscriber down; safe to call more than once
    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| {
            if sub.id == id {
                sub.alive.store(false, Ordering::Relaxed);
                let _ = sub.wake_tx.try_send(());
                log::info!("subscriber {} removed: {}", id, sub.peer);
                false
            } else {
                true
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Capture the current snapshot and enqueue it for every subscriber
    ///
    /// Called after every aggregator version bump and on each broadcast
    /// tick; the tick is where staleness gets refreshed even when no new
    /// telemetry has arrived.
    pub fn publish(&self) {
        let _gate = self.publish_gate.lock();
        let snapshot = Arc::new(self.aggregator.snapshot_with_staleness(self.staleness));

        let mut subs = self.subscribers.lock();
        subs.retain(|sub| {
            if !sub.alive.load(Ordering::Relaxed) {
                log::info!(
                    "subscriber {} disconnected ({:?}): {}",
                    sub.id,
                    *sub.state.lock(),
                    sub.peer
                );
                return false;
            }
            true
        });

        for sub in subs.iter() {
            if sub.queue.force_push(Arc::clone(&snapshot)).is_some() {
                // Oldest pending snapshot superseded, never delivered
                *sub.state.lock() = BackpressureState::Throttled;
            }
            let _ = sub.wake_tx.try_send(());
        }
    }

    /// Spawn the broadcast tick thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let hub = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("broadcast-tick".to_string())
            .spawn(move || {
                log::debug!("broadcast tick started ({:?})", hub.config.tick_interval());
                while hub.running.load(Ordering::Relaxed) {
                    thread::sleep(hub.config.tick_interval());
                    hub.publish();
                }
                log::debug!("broadcast tick stopped");
            })?;
        *self.ticker.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
        }
        // Release writer threads
        let subs = std::mem::take(&mut *self.subscribers.lock());
        for sub in subs {
            sub.alive.store(false, Ordering::Relaxed);
            let _ = sub.wake_tx.try_send(());
        }
    }
}

/// Per-subscriber delivery loop
///
/// Drains the queue down to the newest snapshot each wake, so a consumer
/// that fell behind receives the latest state once, not a backlog.
fn writer_loop(
    shared: Arc<SubscriberShared>,
    mut sink: Box<dyn SnapshotSink>,
    serializer: Serializer,
    wake_rx: Receiver<()>,
    running: Arc<AtomicBool>,
) {
    log::debug!("subscriber {} writer started", shared.id);

    while running.load(Ordering::Relaxed) && shared.alive.load(Ordering::Relaxed) {
        match wake_rx.recv_timeout(IDLE_WAKE) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let mut latest = None;
        while let Some(snapshot) = shared.queue.pop() {
            latest = Some(snapshot);
        }
        let Some(snapshot) = latest else { continue };

        // Versions delivered to one subscriber never go backwards
        if snapshot.version < shared.last_version.load(Ordering::Relaxed) {
            continue;
        }

        let payload = match serializer.serialize(&*snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("subscriber {}: serialize failed: {}", shared.id, e);
                continue;
            }
        };
        let frame = wire::frame(&payload);

        match sink.send_snapshot(&frame) {
            Ok(()) => {
                shared.last_version.store(snapshot.version, Ordering::Relaxed);
                *shared.state.lock() = BackpressureState::Normal;
            }
            Err(e) => {
                log::warn!("subscriber {}: write failed: {}", shared.id, e);
                *shared.state.lock() = BackpressureState::Disconnecting;
                shared.alive.store(false, Ordering::Relaxed);
                break;
            }
        }
    }

    shared.alive.store(false, Ordering::Relaxed);
    log::debug!("subscriber {} writer stopped", shared.id);
}
