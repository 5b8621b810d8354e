//! Vehicle state aggregation
//!
//! Merges decoded telemetry fields into one coherent snapshot. The snapshot
//! has a single writer (the link reader thread); everyone else works on
//! immutable copies. Staleness is a derived property computed when a copy is
//! taken, never by a background timer mutating stored state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Typed telemetry value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Flag(bool),
    F64(f64),
    I64(i64),
    Text(String),
}

/// Unit tag attached to a field at decode time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Meters,
    Volts,
    Amperes,
    Percent,
    Radians,
    Degrees,
    Celsius,
    None,
}

/// A single named measurement produced by the decoder
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryField {
    pub name: &'static str,
    pub value: FieldValue,
    pub unit: Unit,
    /// Source-protocol sequence number of the frame that carried it
    pub seq: u8,
}

/// One field as stored in (and copied out of) the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotField {
    pub value: FieldValue,
    pub unit: Unit,
    /// Microseconds since epoch of the last accepted update
    pub timestamp_us: u64,
    pub seq: u8,
    /// Derived on read: last update older than the staleness threshold
    pub stale: bool,
}

/// Immutable copy of the current vehicle state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    /// Strictly increasing on every accepted update
    pub version: u64,
    /// Microseconds since epoch when this copy was taken
    pub captured_us: u64,
    pub fields: HashMap<String, SnapshotField>,
}

/// Pseudo-field carrying the outcome of the most recent command
pub const LAST_COMMAND_FIELD: &str = "last_command_status";

struct AggregatorInner {
    version: u64,
    fields: HashMap<String, SnapshotField>,
}

/// Single source of truth for "current vehicle state"
pub struct Aggregator {
    inner: Mutex<AggregatorInner>,
    /// Forces every field stale while the link is degraded
    link_down: AtomicBool,
}

/// Microseconds since the Unix epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AggregatorInner {
                version: 0,
                fields: HashMap::new(),
            }),
            link_down: AtomicBool::new(true),
        }
    }

    /// Merge a batch of decoded fields into the snapshot
    ///
    /// The version is bumped exactly once per call that carries at least one
    /// field, never per field. Returns the new version, or `None` when the
    /// batch was empty.
    pub fn apply(&self, fields: Vec<TelemetryField>) -> Option<u64> {
        self.apply_at(fields, now_us())
    }

    /// Merge with an explicit clock, for deterministic tests
    pub fn apply_at(&self, fields: Vec<TelemetryField>, now_us: u64) -> Option<u64> {
        if fields.is_empty() {
            return None;
        }

        let mut inner = self.inner.lock();
        for field in fields {
            let entry = inner
                .fields
                .entry(field.name.to_string())
                .or_insert_with(|| SnapshotField {
                    value: field.value.clone(),
                    unit: field.unit,
                    timestamp_us: 0,
                    seq: field.seq,
                    stale: false,
                });
            entry.value = field.value;
            entry.unit = field.unit;
            entry.seq = field.seq;
            // A field's timestamp never regresses
            entry.timestamp_us = entry.timestamp_us.max(now_us);
        }
        inner.version += 1;
        Some(inner.version)
    }

    /// Fold a command outcome in as a pseudo-field so subscribers see it
    /// without a separate channel
    pub fn record_command_status(&self, text: String) -> u64 {
        let now = now_us();
        let mut inner = self.inner.lock();
        let entry = inner
            .fields
            .entry(LAST_COMMAND_FIELD.to_string())
            .or_insert_with(|| SnapshotField {
                value: FieldValue::Text(String::new()),
                unit: Unit::None,
                timestamp_us: 0,
                seq: 0,
                stale: false,
            });
        entry.value = FieldValue::Text(text);
        entry.timestamp_us = entry.timestamp_us.max(now);
        inner.version += 1;
        inner.version
    }

    /// Current snapshot version without copying the field map
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Mark the link as down (every field reads as stale) or recovered
    pub fn set_link_down(&self, down: bool) {
        self.link_down.store(down, Ordering::Relaxed);
    }

    pub fn is_link_down(&self) -> bool {
        self.link_down.load(Ordering::Relaxed)
    }

    /// Take an immutable copy with staleness derived against `threshold`
    ///
    /// Readers never observe a partially-applied batch: the copy is taken
    /// under the same lock `apply` holds.
    pub fn snapshot_with_staleness(&self, threshold: Duration) -> VehicleSnapshot {
        self.snapshot_at(threshold, now_us())
    }

    /// Staleness copy with an explicit clock, for deterministic tests
    pub fn snapshot_at(&self, threshold: Duration, now_us: u64) -> VehicleSnapshot {
        let threshold_us = threshold.as_micros() as u64;
        let down = self.is_link_down();
        let inner = self.inner.lock();

        let mut fields = inner.fields.clone();
        for field in fields.values_mut() {
            field.stale = down || now_us.saturating_sub(field.timestamp_us) > threshold_us;
        }

        VehicleSnapshot {
            version: inner.version,
            captured_us: now_us,
            fields,
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &'static str, value: f64, seq: u8) -> TelemetryField {
        TelemetryField {
            name,
            value: FieldValue::F64(value),
            unit: Unit::Meters,
            seq,
        }
    }

    #[test]
    fn test_version_bumps_once_per_nonempty_apply() {
        let agg = Aggregator::new();
        assert_eq!(agg.version(), 0);

        // Three fields in one batch still bump the version once
        assert_eq!(
            agg.apply_at(vec![f("depth", 1.0, 1), f("a", 2.0, 1), f("b", 3.0, 1)], 10),
            Some(1)
        );
        assert_eq!(agg.apply_at(vec![f("depth", 1.5, 2)], 20), Some(2));
        assert_eq!(agg.apply_at(vec![], 30), None);
        assert_eq!(agg.version(), 2);
    }

    #[test]
    fn test_field_timestamp_never_regresses() {
        let agg = Aggregator::new();
        agg.apply_at(vec![f("depth", 1.0, 1)], 1_000);
        // A wall-clock step backwards must not rewind the stored timestamp
        agg.apply_at(vec![f("depth", 2.0, 2)], 500);

        let snap = agg.snapshot_at(Duration::from_secs(1), 1_000);
        let field = &snap.fields["depth"];
        assert_eq!(field.timestamp_us, 1_000);
        assert_eq!(field.value, FieldValue::F64(2.0));
        assert_eq!(field.seq, 2);
    }

    #[test]
    fn test_staleness_is_derived_on_read() {
        let agg = Aggregator::new();
        agg.set_link_down(false);
        agg.apply_at(vec![f("depth", 5.0, 1)], 1_000_000);

        let fresh = agg.snapshot_at(Duration::from_millis(100), 1_050_000);
        assert!(!fresh.fields["depth"].stale);

        let old = agg.snapshot_at(Duration::from_millis(100), 1_200_000);
        assert!(old.fields["depth"].stale);
        // Reading staleness never changes the version
        assert_eq!(old.version, fresh.version);
    }

    #[test]
    fn test_link_down_forces_staleness_without_version_change() {
        let agg = Aggregator::new();
        agg.set_link_down(false);
        agg.apply_at(vec![f("depth", 5.0, 1), f("heading", 90.0, 1)], 1_000);
        let before = agg.version();

        agg.set_link_down(true);
        let snap = agg.snapshot_at(Duration::from_secs(60), 1_100);
        assert!(snap.fields.values().all(|field| field.stale));
        assert_eq!(snap.version, before);

        // Recovery: fresh applies read non-stale again
        agg.set_link_down(false);
        agg.apply_at(vec![f("depth", 6.0, 2)], 2_000);
        let snap = agg.snapshot_at(Duration::from_secs(60), 2_100);
        assert!(!snap.fields["depth"].stale);
    }

    #[test]
    fn test_command_status_pseudo_field() {
        let agg = Aggregator::new();
        let v = agg.record_command_status("3:acked:0".to_string());
        assert_eq!(v, 1);

        let snap = agg.snapshot_at(Duration::from_secs(1), now_us());
        assert_eq!(
            snap.fields[LAST_COMMAND_FIELD].value,
            FieldValue::Text("3:acked:0".to_string())
        );
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let agg = Aggregator::new();
        agg.apply_at(vec![f("depth", 1.0, 1)], 10);
        let snap = agg.snapshot_at(Duration::from_secs(1), 20);
        agg.apply_at(vec![f("depth", 2.0, 2)], 30);
        // The copy is unaffected by later applies
        assert_eq!(snap.fields["depth"].value, FieldValue::F64(1.0));
        assert_eq!(snap.version, 1);
    }
}
