//! Command dispatch and acknowledgment tracking
//!
//! Accepts typed command requests, validates them before any network
//! interaction, serializes them for the link, and tracks each request
//! through its lifecycle: Pending → Sent → Acked / TimedOut / Failed.
//! Terminal states are immutable; whichever transition lands first wins.

use crate::config::CommandConfig;
use crate::error::{Error, Result};
use crate::hub::SubscriptionHub;
use crate::link::LinkManager;
use crate::protocol::TxFrame;
use crate::state::Aggregator;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// ArduSub-style flight modes accepted by set-mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightMode {
    Stabilize,
    Acro,
    AltHold,
    Auto,
    Guided,
    Circle,
    Surface,
    Poshold,
    Manual,
}

impl FlightMode {
    /// Protocol mode code
    pub fn code(&self) -> u8 {
        match self {
            FlightMode::Stabilize => 0,
            FlightMode::Acro => 1,
            FlightMode::AltHold => 2,
            FlightMode::Auto => 3,
            FlightMode::Guided => 4,
            FlightMode::Circle => 7,
            FlightMode::Surface => 9,
            FlightMode::Poshold => 16,
            FlightMode::Manual => 19,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FlightMode::Stabilize),
            1 => Some(FlightMode::Acro),
            2 => Some(FlightMode::AltHold),
            3 => Some(FlightMode::Auto),
            4 => Some(FlightMode::Guided),
            7 => Some(FlightMode::Circle),
            9 => Some(FlightMode::Surface),
            16 => Some(FlightMode::Poshold),
            19 => Some(FlightMode::Manual),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlightMode::Stabilize => "stabilize",
            FlightMode::Acro => "acro",
            FlightMode::AltHold => "alt_hold",
            FlightMode::Auto => "auto",
            FlightMode::Guided => "guided",
            FlightMode::Circle => "circle",
            FlightMode::Surface => "surface",
            FlightMode::Poshold => "poshold",
            FlightMode::Manual => "manual",
        }
    }
}

/// Command kinds with their typed payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Set lights intensity, 0-100 %
    SetLightsLevel { level: u8 },
    /// Arm the vehicle
    Arm,
    /// Disarm the vehicle
    Disarm,
    /// Change flight mode
    SetMode { mode: FlightMode },
}

impl CommandKind {
    fn describe(&self) -> String {
        match self {
            CommandKind::SetLightsLevel { level } => format!("set-lights-level {}", level),
            CommandKind::Arm => "arm".to_string(),
            CommandKind::Disarm => "disarm".to_string(),
            CommandKind::SetMode { mode } => format!("set-mode {}", mode.name()),
        }
    }
}

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acked,
    TimedOut,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Acked | CommandStatus::TimedOut | CommandStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Acked => "acked",
            CommandStatus::TimedOut => "timed_out",
            CommandStatus::Failed => "failed",
        }
    }
}

/// Serializable request view for the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandView {
    pub id: u64,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub result_code: Option<u8>,
}

struct CommandRequest {
    id: u64,
    kind: CommandKind,
    seq: u8,
    status: CommandStatus,
    result_code: Option<u8>,
    sent_at: Option<Instant>,
    resolved_at: Option<Instant>,
}

impl CommandRequest {
    fn view(&self) -> CommandView {
        CommandView {
            id: self.id,
            kind: self.kind.clone(),
            status: self.status,
            result_code: self.result_code,
        }
    }
}

#[derive(Default)]
struct DispatchTable {
    requests: HashMap<u64, CommandRequest>,
    /// Outstanding protocol sequence numbers back to request ids
    by_seq: HashMap<u8, u64>,
    next_id: u64,
}

/// Sweep cadence for the passive timeout check
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Owner of the command request table
pub struct CommandDispatcher {
    config: CommandConfig,
    link: Arc<LinkManager>,
    aggregator: Arc<Aggregator>,
    hub: Arc<SubscriptionHub>,
    table: Mutex<DispatchTable>,
    running: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CommandDispatcher {
    pub fn new(
        config: CommandConfig,
        link: Arc<LinkManager>,
        aggregator: Arc<Aggregator>,
        hub: Arc<SubscriptionHub>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            link,
            aggregator,
            hub,
            table: Mutex::new(DispatchTable::default()),
            running,
            sweeper: Mutex::new(None),
        }
    }

    /// Validate, record and transmit a command
    ///
    /// Returns the request id immediately; the terminal outcome is
    /// observable by polling or through the snapshot stream. Rejects with
    /// [`Error::InvalidCommand`] before any network interaction. A send
    /// rejected by the link marks the request Failed on the spot — commands
    /// are never retried or queued, a lights toggle replayed twice is worse
    /// than one reported failure.
    pub fn submit(&self, kind: CommandKind) -> Result<u64> {
        validate(&kind)?;

        let seq = self.link.next_seq();
        let id = {
            let mut table = self.table.lock();
            table.next_id += 1;
            let id = table.next_id;
            table.by_seq.insert(seq, id);
            table.requests.insert(
                id,
                CommandRequest {
                    id,
                    kind: kind.clone(),
                    seq,
                    status: CommandStatus::Pending,
                    result_code: None,
                    sent_at: None,
                    resolved_at: None,
                },
            );
            id
        };

        log::info!("command {}: {} (seq {})", id, kind.describe(), seq);

        let mut tx = TxFrame::new();
        tx.set_command(seq, &kind);

        match self.link.send(tx.as_bytes()) {
            Ok(()) => {
                let mut table = self.table.lock();
                if let Some(req) = table.requests.get_mut(&id) {
                    req.status = CommandStatus::Sent;
                    req.sent_at = Some(Instant::now());
                }
            }
            Err(e) => {
                log::warn!("command {}: send rejected: {}", id, e);
                self.resolve(id, CommandStatus::Failed, None);
            }
        }

        Ok(id)
    }

    /// Look up a request by id
    pub fn get(&self, id: u64) -> Option<CommandView> {
        self.table.lock().requests.get(&id).map(|r| r.view())
    }

    /// Correlate an inbound acknowledgment with its outstanding request
    ///
    /// Correlation is by the echoed sequence number, not arrival order, so
    /// out-of-order acks resolve the right request. Acks for unknown or
    /// already-terminal requests are ignored.
    pub fn handle_ack(&self, seq: u8, result: u8) {
        let id = {
            let table = self.table.lock();
            match table.by_seq.get(&seq) {
                Some(&id) => id,
                None => {
                    log::debug!("ack for unknown seq {} ignored", seq);
                    return;
                }
            }
        };
        self.resolve(id, CommandStatus::Acked, Some(result));
    }

    /// Spawn the passive timeout/retention sweeper
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let dispatcher = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("command-sweeper".to_string())
            .spawn(move || {
                log::debug!("command sweeper started");
                while dispatcher.running.load(Ordering::Relaxed) {
                    thread::sleep(SWEEP_INTERVAL);
                    dispatcher.sweep();
                }
                log::debug!("command sweeper stopped");
            })?;
        *self.sweeper.lock() = Some(handle);
        Ok(())
    }

    /// One timeout + retention pass over the request table
    pub fn sweep(&self) {
        let timeout = self.config.timeout();
        let retention = self.config.retention();

        let timed_out: Vec<u64> = {
            let table = self.table.lock();
            table
                .requests
                .values()
                .filter(|r| {
                    r.status == CommandStatus::Sent
                        && r.sent_at.is_some_and(|t| t.elapsed() >= timeout)
                })
                .map(|r| r.id)
                .collect()
        };
        for id in timed_out {
            log::warn!("command {}: no acknowledgment within {:?}", id, timeout);
            self.resolve(id, CommandStatus::TimedOut, None);
        }

        // Drop terminal requests past the retention window
        let mut table = self.table.lock();
        table.requests.retain(|_, r| {
            !(r.status.is_terminal() && r.resolved_at.is_some_and(|t| t.elapsed() >= retention))
        });
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }

    /// Move a request into a terminal state; no-op when it already is one
    fn resolve(&self, id: u64, status: CommandStatus, result_code: Option<u8>) {
        debug_assert!(status.is_terminal());

        let outcome = {
            let mut table = self.table.lock();
            let Some(req) = table.requests.get_mut(&id) else {
                return;
            };
            if req.status.is_terminal() {
                log::debug!(
                    "command {}: already {}, {} ignored",
                    id,
                    req.status.as_str(),
                    status.as_str()
                );
                return;
            }
            req.status = status;
            req.result_code = result_code;
            req.resolved_at = Some(Instant::now());
            let seq = req.seq;
            table.by_seq.remove(&seq);
            status
        };

        let text = match result_code {
            Some(code) => format!("{}:{}:{}", id, outcome.as_str(), code),
            None => format!("{}:{}", id, outcome.as_str()),
        };
        log::info!("command {}: {}", id, outcome.as_str());
        self.aggregator.record_command_status(text);
        self.hub.publish();
    }
}

/// Schema validation, before any network interaction
fn validate(kind: &CommandKind) -> Result<()> {
    match kind {
        CommandKind::SetLightsLevel { level } if *level > 100 => Err(Error::InvalidCommand(
            format!("lights level must be 0-100, got {}", level),
        )),
        _ => Ok(()),
    }
}
