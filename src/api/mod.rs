//! Observer-facing API server
//!
//! One TCP listener serves queries, command submission and snapshot
//! streaming, all as length-prefixed frames (see [`wire`]).
//!
//! # Connection lifecycle
//!
//! ```text
//! 1. Client connects and sends Request frames
//! 2. Each request gets exactly one Response frame
//! 3. A Subscribe request answers with Subscribed, then the connection
//!    becomes push-only: every further frame from the server is a full
//!    VehicleSnapshot, at the broadcast tick rate or immediately after a
//!    version bump, whichever comes sooner
//! 4. Closing the connection at any time unsubscribes
//! ```
//!
//! A subscribed connection has a single writer (the hub); inbound frames on
//! it are drained and ignored so client close is still detected.

pub mod wire;

use crate::command::{CommandDispatcher, CommandKind, CommandView};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::hub::{SnapshotSink, SubscriptionHub};
use crate::link::{LinkManager, LinkStatus};
use crate::state::{Aggregator, VehicleSnapshot};
use crate::video::{StreamEntry, StreamProtocol, VideoStreamRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wire::Serializer;

/// Requests accepted from observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Link state and summary counters
    Status,
    /// Current snapshot with per-field staleness
    Telemetry,
    /// Submit a command; answers with the request id
    Command { command: CommandKind },
    /// Poll a previously submitted command
    CommandStatus { id: u64 },
    /// Live video feed endpoints
    Streams,
    /// Insert or refresh a video feed endpoint
    RegisterStream {
        name: String,
        url: String,
        protocol: Option<StreamProtocol>,
    },
    /// Switch this connection to snapshot streaming
    Subscribe,
}

/// Responses sent to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Status {
        link: LinkStatus,
        subscribers: usize,
    },
    Telemetry {
        snapshot: VehicleSnapshot,
    },
    CommandAccepted {
        id: u64,
    },
    CommandStatus {
        request: Option<CommandView>,
    },
    Streams {
        streams: Vec<StreamEntry>,
    },
    StreamRegistered,
    Subscribed,
    Error {
        message: String,
    },
}

/// Read timeout so handler loops can poll shutdown flags
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot sink writing length-prefixed frames to a TCP peer
pub struct TcpSink {
    stream: TcpStream,
}

impl TcpSink {
    /// Wrap a stream, arming the write timeout that bounds a stalled peer
    pub fn new(stream: TcpStream, write_timeout: Duration) -> std::io::Result<Self> {
        stream.set_write_timeout(Some(write_timeout))?;
        Ok(Self { stream })
    }
}

impl SnapshotSink for TcpSink {
    fn send_snapshot(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(frame)
    }
}

/// TCP API server: accept loop plus one handler thread per client
pub struct ApiServer {
    listener: TcpListener,
    serializer: Serializer,
    staleness: Duration,
    write_timeout: Duration,
    link: Arc<LinkManager>,
    aggregator: Arc<Aggregator>,
    dispatcher: Arc<CommandDispatcher>,
    hub: Arc<SubscriptionHub>,
    video: Arc<VideoStreamRegistry>,
    running: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    client_counter: AtomicU64,
}

impl ApiServer {
    /// Bind the listener
    ///
    /// This is the service boundary: failure to bind is the one startup
    /// error the daemon does not recover from.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ApiConfig,
        staleness: Duration,
        link: Arc<LinkManager>,
        aggregator: Arc<Aggregator>,
        dispatcher: Arc<CommandDispatcher>,
        hub: Arc<SubscriptionHub>,
        video: Arc<VideoStreamRegistry>,
        running: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_address)
            .map_err(|e| Error::Other(format!("failed to bind {}: {}", config.bind_address, e)))?;
        listener.set_nonblocking(true)?;
        log::info!("api: listening on {}", config.bind_address);

        Ok(Self {
            listener,
            serializer: Serializer::default(),
            staleness,
            write_timeout: config.write_timeout(),
            link,
            aggregator,
            dispatcher,
            hub,
            video,
            running,
            acceptor: Mutex::new(None),
            client_counter: AtomicU64::new(0),
        })
    }

    /// Actual bound address (useful when configured with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawn the accept loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let server = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("api-server".to_string())
            .spawn(move || server.accept_loop())?;
        *self.acceptor.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
    }

    fn accept_loop(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let n = self.client_counter.fetch_add(1, Ordering::Relaxed) + 1;
                    let server = Arc::clone(&self);
                    let spawned = thread::Builder::new()
                        .name(format!("api-client-{}", n))
                        .spawn(move || {
                            if let Err(e) = server.handle_client(stream, addr) {
                                log::debug!("api: client {} ended: {}", addr, e);
                            }
                        });
                    if let Err(e) = spawned {
                        log::error!("api: failed to spawn client handler: {}", e);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!("api: accept error: {}", e);
                }
            }
        }
        log::info!("api: server stopped");
    }

    fn handle_client(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        log::info!("api: client connected: {}", addr);
        stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;

        let mut buf = Vec::with_capacity(256);
        let mut subscription: Option<u64> = None;

        loop {
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            match wire::read_frame(&mut stream, &mut buf) {
                Ok(false) => continue,
                Ok(true) => {
                    // A subscribed connection is push-only; the hub owns the
                    // write side, so inbound frames are just drained
                    if subscription.is_some() {
                        continue;
                    }
                    let response = match self.serializer.deserialize::<Request>(&buf) {
                        Ok(Request::Subscribe) => {
                            self.respond(&mut stream, &Response::Subscribed)?;
                            let sink = TcpSink::new(stream.try_clone()?, self.write_timeout)?;
                            let id = self.hub.subscribe(addr.to_string(), Box::new(sink))?;
                            subscription = Some(id);
                            continue;
                        }
                        Ok(request) => self.dispatch(request),
                        Err(e) => Response::Error {
                            message: e.to_string(),
                        },
                    };
                    self.respond(&mut stream, &response)?;
                }
                Err(e) => {
                    if let Error::Io(ref io_err) = e
                        && (io_err.kind() == std::io::ErrorKind::UnexpectedEof
                            || io_err.kind() == std::io::ErrorKind::ConnectionReset)
                    {
                        log::info!("api: client disconnected: {}", addr);
                        break;
                    }
                    log::warn!("api: read failed for {}: {}", addr, e);
                    break;
                }
            }
        }

        if let Some(id) = subscription {
            self.hub.unsubscribe(id);
        }
        Ok(())
    }

    fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Status => Response::Status {
                link: self.link.status(),
                subscribers: self.hub.subscriber_count(),
            },
            Request::Telemetry => Response::Telemetry {
                snapshot: self.aggregator.snapshot_with_staleness(self.staleness),
            },
            Request::Command { command } => match self.dispatcher.submit(command) {
                Ok(id) => Response::CommandAccepted { id },
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            },
            Request::CommandStatus { id } => Response::CommandStatus {
                request: self.dispatcher.get(id),
            },
            Request::Streams => Response::Streams {
                streams: self.video.list(),
            },
            Request::RegisterStream {
                name,
                url,
                protocol,
            } => {
                self.video
                    .register(&name, &url, protocol.unwrap_or(StreamProtocol::Udp));
                Response::StreamRegistered
            }
            // Handled inline because it needs the socket itself
            Request::Subscribe => Response::Error {
                message: "already subscribed".to_string(),
            },
        }
    }

    fn respond(&self, stream: &mut TcpStream, response: &Response) -> Result<()> {
        let payload = self.serializer.serialize(response)?;
        stream.write_all(&wire::frame(&payload))?;
        Ok(())
    }
}
