//! VarunaIO daemon entry point

use std::env;
use std::path::Path;
use varuna_io::app::VarunaApp;
use varuna_io::config::AppConfig;
use varuna_io::error::{Error, Result};

/// Parse config path from command line arguments.
///
/// Supports:
/// - `varuna-io <path>` (positional)
/// - `varuna-io --config <path>` (flag-based)
/// - `varuna-io -c <path>` (short flag)
///
/// Defaults to `/etc/varunaio.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    // Look for --config or -c flag
    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    // Fall back to first positional argument (if it doesn't start with -)
    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    // Default path
    "/etc/varunaio.toml".to_string()
}

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("VarunaIO v0.3.0 starting...");

    let config_path = parse_config_path();
    let config = if Path::new(&config_path).exists() {
        log::info!("Using config: {}", config_path);
        AppConfig::from_file(&config_path)?
    } else {
        log::warn!("Config {} not found, using defaults", config_path);
        AppConfig::bluerov_defaults()
    };

    let mut app = VarunaApp::new(config)?;

    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, std::sync::atomic::Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    app.run()?;

    log::info!("VarunaIO stopped");
    Ok(())
}
