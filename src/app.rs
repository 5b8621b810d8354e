//! Application orchestration for the VarunaIO daemon
//!
//! Wires the link, aggregator, dispatcher, hub, video registry and API
//! server together, runs the main loop, and tears everything down on
//! shutdown.

use crate::api::ApiServer;
use crate::command::CommandDispatcher;
use crate::config::AppConfig;
use crate::error::Result;
use crate::hub::SubscriptionHub;
use crate::link::transport::{DatagramTransport, UdpTransport};
use crate::link::{LinkManager, TransportFactory};
use crate::state::Aggregator;
use crate::video::VideoStreamRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a single transport recv blocks before the reader re-checks
/// liveness and shutdown flags
const LINK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Main application structure that owns all components
pub struct VarunaApp {
    config: AppConfig,
    link: Arc<LinkManager>,
    aggregator: Arc<Aggregator>,
    dispatcher: Arc<CommandDispatcher>,
    hub: Arc<SubscriptionHub>,
    api: Arc<ApiServer>,
    running: Arc<AtomicBool>,
}

impl VarunaApp {
    /// Construct all components and bind the API listener
    pub fn new(config: AppConfig) -> Result<Self> {
        log::info!(
            "initializing bridge for {} ({})",
            config.vehicle.name,
            config.vehicle.endpoint()
        );

        let running = Arc::new(AtomicBool::new(true));
        let aggregator = Arc::new(Aggregator::new());

        let endpoint = config.vehicle.endpoint();
        let factory: TransportFactory = Box::new(move || {
            Ok(Arc::new(UdpTransport::open(&endpoint, LINK_POLL_INTERVAL)?)
                as Arc<dyn DatagramTransport>)
        });

        let link = Arc::new(LinkManager::new(
            config.vehicle.clone(),
            config.link.clone(),
            factory,
            Arc::clone(&aggregator),
            Arc::clone(&running),
        ));

        let hub = Arc::new(SubscriptionHub::new(
            config.api.clone(),
            config.telemetry.staleness_threshold(),
            Arc::clone(&aggregator),
            Arc::clone(&running),
        ));

        let dispatcher = Arc::new(CommandDispatcher::new(
            config.commands.clone(),
            Arc::clone(&link),
            Arc::clone(&aggregator),
            Arc::clone(&hub),
            Arc::clone(&running),
        ));

        let video = Arc::new(VideoStreamRegistry::new(
            config.video.clone(),
            &config.vehicle.address,
        ));

        let api = Arc::new(ApiServer::new(
            &config.api,
            config.telemetry.staleness_threshold(),
            Arc::clone(&link),
            Arc::clone(&aggregator),
            Arc::clone(&dispatcher),
            Arc::clone(&hub),
            video,
            Arc::clone(&running),
        )?);

        Ok(Self {
            config,
            link,
            aggregator,
            dispatcher,
            hub,
            api,
            running,
        })
    }

    /// Shutdown flag, for signal handlers
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Start all background threads and run until shutdown
    pub fn run(&mut self) -> Result<()> {
        // First connection attempt; a dead vehicle is not fatal, the reader
        // thread keeps retrying with backoff
        if let Err(e) = self.link.connect() {
            log::warn!("starting degraded: {}", e);
        }

        self.link
            .start(Arc::clone(&self.dispatcher), Arc::clone(&self.hub))?;
        self.hub.start()?;
        self.dispatcher.start()?;
        self.api.start()?;

        log::info!("✓ all threads started");
        log::info!("api on {}", self.config.api.bind_address);
        log::info!("Press Ctrl+C to stop");

        let mut last_stats = Instant::now();
        while self.running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));

            if last_stats.elapsed().as_secs() >= 10 {
                self.log_statistics();
                last_stats = Instant::now();
            }
        }

        log::info!("shutdown signal received, stopping threads...");
        self.stop_all();
        Ok(())
    }

    fn log_statistics(&self) {
        let status = self.link.status();
        log::info!(
            "link {:?} | rx {} datagrams, {} dropped | {} subscriber(s) | snapshot v{}",
            status.state,
            status.rx_datagrams,
            status.decode_dropped,
            self.hub.subscriber_count(),
            self.aggregator.version()
        );
    }

    fn stop_all(&self) {
        self.running.store(false, Ordering::Relaxed);

        self.api.stop();
        self.dispatcher.stop();
        self.hub.stop();
        self.link.stop();

        log::info!("✓ all threads stopped");
    }
}
