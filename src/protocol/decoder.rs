//! Telemetry decoder
//!
//! Turns raw datagrams into typed, named telemetry fields. Decoding is a
//! pure function of the buffer: unit conversion happens here (device units
//! to SI), malformed or unknown messages are counted and dropped, and one
//! corrupt frame never prevents the rest of the datagram from decoding.

use crate::command::FlightMode;
use crate::state::{FieldValue, TelemetryField, Unit};

use super::frame::FrameIter;
use super::{
    MSG_ATTITUDE, MSG_BATTERY_STATUS, MSG_COMMAND_ACK, MSG_HEARTBEAT, MSG_SCALED_PRESSURE,
    MSG_VFR_HUD,
};

/// Surface air pressure in pascal, used as the zero-depth reference
const SURFACE_PRESSURE_PA: f64 = 101_325.0;

/// Pressure-to-depth divisor for fresh water (ρ·g, Pa per meter)
const PA_PER_METER: f64 = 9_806.65;

/// Battery voltage sentinel meaning "not measured"
const VOLTAGE_INVALID: u16 = 0xFFFF;

/// Acknowledgment extracted from a COMMAND_ACK frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandAck {
    /// Echoed outbound command sequence number
    pub seq: u8,
    /// Vehicle result code (0 = accepted)
    pub result: u8,
}

/// Everything one datagram decoded into
#[derive(Debug, Default)]
pub struct DecodeOutput {
    /// Telemetry fields, normalized to SI units
    pub fields: Vec<TelemetryField>,
    /// Command acknowledgments, routed to the dispatcher
    pub acks: Vec<CommandAck>,
    /// True when the datagram carried at least one vehicle heartbeat
    pub heartbeat: bool,
    /// Corrupt, truncated, short or unknown frames
    pub dropped: u32,
}

/// Decode a datagram into telemetry fields, acks and a heartbeat marker
pub fn decode(buffer: &[u8]) -> DecodeOutput {
    let mut out = DecodeOutput::default();
    let mut frames = FrameIter::new(buffer);

    while let Some(frame) = frames.next() {
        let seq = frame.seq;
        let p = frame.payload;

        match frame.msg_id {
            MSG_HEARTBEAT if p.len() == 2 => {
                out.heartbeat = true;
                out.fields.push(TelemetryField {
                    name: "armed",
                    value: FieldValue::Flag(p[0] != 0),
                    unit: Unit::None,
                    seq,
                });
                if let Some(mode) = FlightMode::from_code(p[1]) {
                    out.fields.push(TelemetryField {
                        name: "mode",
                        value: FieldValue::Text(mode.name().to_string()),
                        unit: Unit::None,
                        seq,
                    });
                }
            }
            MSG_ATTITUDE if p.len() == 12 => {
                let roll = f32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                let pitch = f32::from_le_bytes([p[4], p[5], p[6], p[7]]);
                let yaw = f32::from_le_bytes([p[8], p[9], p[10], p[11]]);
                for (name, value) in [("roll", roll), ("pitch", pitch), ("yaw", yaw)] {
                    out.fields.push(TelemetryField {
                        name,
                        value: FieldValue::F64(value as f64),
                        unit: Unit::Radians,
                        seq,
                    });
                }
            }
            MSG_SCALED_PRESSURE if p.len() == 6 => {
                let press_mbar = f32::from_le_bytes([p[0], p[1], p[2], p[3]]) as f64;
                let temp_centi = i16::from_le_bytes([p[4], p[5]]);
                // Fresh-water depth from absolute pressure
                let depth = (press_mbar * 100.0 - SURFACE_PRESSURE_PA) / PA_PER_METER;
                out.fields.push(TelemetryField {
                    name: "depth",
                    value: FieldValue::F64(depth),
                    unit: Unit::Meters,
                    seq,
                });
                out.fields.push(TelemetryField {
                    name: "water_temperature",
                    value: FieldValue::F64(temp_centi as f64 / 100.0),
                    unit: Unit::Celsius,
                    seq,
                });
            }
            MSG_BATTERY_STATUS if p.len() == 5 => {
                let voltage_mv = u16::from_le_bytes([p[0], p[1]]);
                let current_ca = i16::from_le_bytes([p[2], p[3]]);
                let remaining = p[4] as i8;
                if voltage_mv != VOLTAGE_INVALID {
                    out.fields.push(TelemetryField {
                        name: "battery_voltage",
                        value: FieldValue::F64(voltage_mv as f64 / 1000.0),
                        unit: Unit::Volts,
                        seq,
                    });
                }
                out.fields.push(TelemetryField {
                    name: "battery_current",
                    value: FieldValue::F64(current_ca as f64 / 100.0),
                    unit: Unit::Amperes,
                    seq,
                });
                if remaining >= 0 {
                    out.fields.push(TelemetryField {
                        name: "battery_remaining",
                        value: FieldValue::I64(remaining as i64),
                        unit: Unit::Percent,
                        seq,
                    });
                }
            }
            MSG_VFR_HUD if p.len() == 2 => {
                let heading = u16::from_le_bytes([p[0], p[1]]);
                out.fields.push(TelemetryField {
                    name: "heading",
                    value: FieldValue::F64(heading as f64),
                    unit: Unit::Degrees,
                    seq,
                });
            }
            MSG_COMMAND_ACK if p.len() == 2 => {
                out.acks.push(CommandAck {
                    seq: p[0],
                    result: p[1],
                });
            }
            _ => {
                // Unknown message id or wrong payload size for a known one
                out.dropped += 1;
            }
        }
    }

    out.dropped += frames.dropped;
    out
}
