//! Video stream registry
//!
//! Pure metadata bookkeeping for named video feeds: no probing, no media
//! handling. Liveness is attested externally - the stream source re-registers
//! periodically, and entries that stop being refreshed expire lazily on read.

use crate::config::VideoConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Transport protocol of a registered feed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    Rtsp,
    Udp,
    Webrtc,
    Mjpeg,
}

/// Serializable registry entry for the streams query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    pub name: String,
    pub url: String,
    pub protocol: StreamProtocol,
    pub live: bool,
    /// Milliseconds since the entry was last refreshed
    pub last_seen_ms: u64,
}

struct StreamRecord {
    url: String,
    protocol: StreamProtocol,
    last_seen: Instant,
}

/// Registry of named video feed endpoints
pub struct VideoStreamRegistry {
    config: VideoConfig,
    /// Synthesized when nothing has been registered yet
    default_url: String,
    streams: Mutex<HashMap<String, StreamRecord>>,
}

impl VideoStreamRegistry {
    pub fn new(config: VideoConfig, vehicle_address: &str) -> Self {
        let default_url = format!(
            "udp://{}:{}",
            vehicle_address, config.default_stream_port
        );
        Self {
            config,
            default_url,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or refresh an entry with a fresh timestamp
    pub fn register(&self, name: &str, url: &str, protocol: StreamProtocol) {
        let mut streams = self.streams.lock();
        let fresh = !streams.contains_key(name);
        streams.insert(
            name.to_string(),
            StreamRecord {
                url: url.to_string(),
                protocol,
                last_seen: Instant::now(),
            },
        );
        if fresh {
            log::info!("video: registered stream '{}' -> {}", name, url);
        } else {
            log::trace!("video: refreshed stream '{}'", name);
        }
    }

    /// Current live entries, dropping expired ones on the way
    ///
    /// Falls back to the vehicle's default camera feed when the registry is
    /// empty, so a dashboard always has something to point a player at.
    pub fn list(&self) -> Vec<StreamEntry> {
        let expiry = self.config.expiry();
        let mut streams = self.streams.lock();
        streams.retain(|name, record| {
            let keep = record.last_seen.elapsed() <= expiry;
            if !keep {
                log::info!("video: stream '{}' expired", name);
            }
            keep
        });

        if streams.is_empty() {
            return vec![StreamEntry {
                name: "main".to_string(),
                url: self.default_url.clone(),
                protocol: StreamProtocol::Udp,
                live: false,
                last_seen_ms: 0,
            }];
        }

        let mut entries: Vec<StreamEntry> = streams
            .iter()
            .map(|(name, record)| StreamEntry {
                name: name.clone(),
                url: record.url.clone(),
                protocol: record.protocol,
                live: true,
                last_seen_ms: record.last_seen.elapsed().as_millis() as u64,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn registry(expiry_ms: u64) -> VideoStreamRegistry {
        VideoStreamRegistry::new(
            VideoConfig {
                expiry_ms,
                default_stream_port: 5600,
            },
            "192.168.2.2",
        )
    }

    #[test]
    fn test_register_and_list() {
        let reg = registry(10_000);
        reg.register("main", "rtsp://192.168.2.2:8554/main", StreamProtocol::Rtsp);
        reg.register("down", "udp://192.168.2.2:5601", StreamProtocol::Udp);

        let entries = reg.list();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "down");
        assert_eq!(entries[1].name, "main");
        assert!(entries.iter().all(|e| e.live));
    }

    #[test]
    fn test_refresh_replaces_url() {
        let reg = registry(10_000);
        reg.register("main", "udp://old:5600", StreamProtocol::Udp);
        reg.register("main", "udp://new:5600", StreamProtocol::Udp);

        let entries = reg.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "udp://new:5600");
    }

    #[test]
    fn test_entries_expire_lazily() {
        let reg = registry(20);
        reg.register("main", "udp://host:5600", StreamProtocol::Udp);
        thread::sleep(Duration::from_millis(40));

        // Expired entry is dropped on read; default feed takes its place
        let entries = reg.list();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].live);
        assert_eq!(entries[0].url, "udp://192.168.2.2:5600");
    }

    #[test]
    fn test_default_feed_when_empty() {
        let reg = registry(1_000);
        let entries = reg.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "main");
        assert_eq!(entries[0].protocol, StreamProtocol::Udp);
    }
}
