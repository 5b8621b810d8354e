//! Configuration for the VarunaIO daemon
//!
//! Loads configuration from a TOML file. Every tunable the runtime needs
//! (vehicle endpoint, liveness windows, backoff bounds, broadcast cadence)
//! comes from here as plain values.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub vehicle: VehicleConfig,
    pub link: LinkConfig,
    pub telemetry: TelemetryConfig,
    pub commands: CommandConfig,
    pub api: ApiConfig,
    pub video: VideoConfig,
    pub logging: LoggingConfig,
}

/// Vehicle endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VehicleConfig {
    /// Human-readable vehicle name used in logs
    pub name: String,
    /// Vehicle IP address
    pub address: String,
    /// Telemetry/command UDP port
    pub port: u16,
}

impl VehicleConfig {
    /// Socket address string for the vehicle endpoint
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Datagram link tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    /// How long `connect()` waits for the first vehicle heartbeat
    pub connect_timeout_ms: u64,
    /// No heartbeat for this long means the link is degraded
    pub liveness_window_ms: u64,
    /// Interval between surface-station heartbeats sent to the vehicle
    pub heartbeat_interval_ms: u64,
    /// Reconnect backoff starting interval
    pub reconnect_backoff_base_ms: u64,
    /// Reconnect backoff cap
    pub reconnect_backoff_max_ms: u64,
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}

/// Telemetry snapshot tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// A field older than this is reported as stale
    pub staleness_threshold_ms: u64,
}

impl TelemetryConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }
}

/// Command dispatch tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandConfig {
    /// A sent command with no acknowledgment within this window times out
    pub timeout_ms: u64,
    /// Terminal requests are kept this long for status polling
    pub retention_ms: u64,
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Observer-facing API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// TCP bind address for queries, commands and snapshot streaming
    ///
    /// Examples:
    /// - `0.0.0.0:5555` - Bind to all interfaces on port 5555
    /// - `127.0.0.1:5555` - Localhost only
    pub bind_address: String,
    /// Per-subscriber pending snapshot queue capacity
    pub queue_depth: usize,
    /// Broadcast tick interval (staleness refresh cadence)
    pub tick_interval_ms: u64,
    /// Subscriber socket write timeout before eviction
    pub write_timeout_ms: u64,
}

impl ApiConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Video stream registry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VideoConfig {
    /// Entries not refreshed within this window are dropped on read
    pub expiry_ms: u64,
    /// Port used when synthesizing the default `main` stream URL
    pub default_stream_port: u16,
}

impl VideoConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output (stdout, stderr, or file path)
    pub output: String,
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(config)
    }

    /// Default configuration for a BlueROV-class vehicle
    ///
    /// Suitable for testing and development. Production deployments
    /// should use a proper TOML configuration file.
    pub fn bluerov_defaults() -> Self {
        Self {
            vehicle: VehicleConfig {
                name: "bluerov2".to_string(),
                address: "192.168.2.2".to_string(),
                port: 14550,
            },
            link: LinkConfig {
                connect_timeout_ms: 10_000,
                liveness_window_ms: 5_000,
                heartbeat_interval_ms: 1_000,
                reconnect_backoff_base_ms: 500,
                reconnect_backoff_max_ms: 10_000,
            },
            telemetry: TelemetryConfig {
                staleness_threshold_ms: 3_000,
            },
            commands: CommandConfig {
                timeout_ms: 3_000,
                retention_ms: 60_000,
            },
            api: ApiConfig {
                bind_address: "0.0.0.0:5555".to_string(),
                queue_depth: 8,
                tick_interval_ms: 200,
                write_timeout_ms: 2_000,
            },
            video: VideoConfig {
                expiry_ms: 30_000,
                default_stream_port: 5600,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                output: "stdout".to_string(),
            },
        }
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::bluerov_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::bluerov_defaults();
        assert_eq!(config.vehicle.address, "192.168.2.2");
        assert_eq!(config.vehicle.port, 14550);
        assert_eq!(config.vehicle.endpoint(), "192.168.2.2:14550");
        assert_eq!(config.link.liveness_window_ms, 5_000);
        assert_eq!(config.api.queue_depth, 8);
        assert_eq!(config.api.bind_address, "0.0.0.0:5555");
    }

    #[test]
    fn test_toml_serialization() {
        let config = AppConfig::bluerov_defaults();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        // Should contain all sections
        assert!(toml_string.contains("[vehicle]"));
        assert!(toml_string.contains("[link]"));
        assert!(toml_string.contains("[telemetry]"));
        assert!(toml_string.contains("[commands]"));
        assert!(toml_string.contains("[api]"));
        assert!(toml_string.contains("[video]"));
        assert!(toml_string.contains("[logging]"));

        // Should contain key values
        assert!(toml_string.contains("address = \"192.168.2.2\""));
        assert!(toml_string.contains("staleness_threshold_ms = 3000"));
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[vehicle]
name = "test-rov"
address = "127.0.0.1"
port = 14551

[link]
connect_timeout_ms = 2000
liveness_window_ms = 1000
heartbeat_interval_ms = 500
reconnect_backoff_base_ms = 100
reconnect_backoff_max_ms = 2000

[telemetry]
staleness_threshold_ms = 750

[commands]
timeout_ms = 1500
retention_ms = 30000

[api]
bind_address = "127.0.0.1:5555"
queue_depth = 4
tick_interval_ms = 100
write_timeout_ms = 500

[video]
expiry_ms = 10000
default_stream_port = 5600

[logging]
level = "debug"
output = "stdout"
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.vehicle.name, "test-rov");
        assert_eq!(config.link.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.telemetry.staleness_threshold_ms, 750);
        assert_eq!(config.commands.timeout_ms, 1500);
        assert_eq!(config.logging.level, "debug");
    }
}
