//! Wire format for the observer-facing API
//!
//! All API traffic is length-prefixed:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ Payload (variable)       │
//! │ Big-endian u32   │ JSON or Postcard binary  │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! JSON is the default (human-readable, easy cross-language clients);
//! Postcard is available for bandwidth-sensitive consumers. Oversized
//! frames close the connection; a payload that fails to deserialize is
//! reported to the client and the connection stays open.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;

/// Maximum accepted frame payload (DoS protection)
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Supported wire formats
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum WireFormat {
    /// Binary format using postcard - fast and compact
    Postcard,
    /// JSON format - human-readable for debugging
    #[default]
    Json,
}

/// Serializer that can handle both formats
#[derive(Clone, Default)]
pub struct Serializer {
    format: WireFormat,
}

impl Serializer {
    /// Create a new serializer for the given format
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// Serialize a message to bytes
    pub fn serialize<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>> {
        match self.format {
            WireFormat::Postcard => {
                postcard::to_allocvec(msg).map_err(|e| Error::Serialization(e.to_string()))
            }
            WireFormat::Json => {
                serde_json::to_vec(msg).map_err(|e| Error::Serialization(e.to_string()))
            }
        }
    }

    /// Deserialize bytes to a message
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self.format {
            WireFormat::Postcard => {
                postcard::from_bytes(bytes).map_err(|e| Error::Serialization(e.to_string()))
            }
            WireFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
            }
        }
    }
}

/// Prepend the length prefix to a serialized payload
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Read one length-prefixed frame into the reusable buffer
///
/// Returns `Ok(false)` when the read timed out before a frame started, so
/// callers can poll shutdown flags. EOF and oversized frames are errors.
pub fn read_frame<R: Read>(reader: &mut R, buf: &mut Vec<u8>) -> Result<bool> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            return Ok(false);
        }
        Err(e) => return Err(Error::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Other(format!("frame too large: {} bytes", len)));
    }

    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(buf)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VehicleSnapshot;

    #[test]
    fn test_json_roundtrip() {
        let serializer = Serializer::new(WireFormat::Json);
        let snapshot = VehicleSnapshot::default();
        let bytes = serializer.serialize(&snapshot).unwrap();
        let back: VehicleSnapshot = serializer.deserialize(&bytes).unwrap();
        assert_eq!(back.version, snapshot.version);
    }

    #[test]
    fn test_postcard_roundtrip() {
        let serializer = Serializer::new(WireFormat::Postcard);
        let snapshot = VehicleSnapshot {
            version: 7,
            captured_us: 123,
            fields: Default::default(),
        };
        let bytes = serializer.serialize(&snapshot).unwrap();
        let back: VehicleSnapshot = serializer.deserialize(&bytes).unwrap();
        assert_eq!(back.version, 7);
    }

    #[test]
    fn test_frame_roundtrip() {
        let framed = frame(b"hello");
        assert_eq!(&framed[..4], &5u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(framed);
        let mut buf = Vec::new();
        assert!(read_frame(&mut cursor, &mut buf).unwrap());
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&(MAX_FRAME_BYTES as u32 + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(header);
        let mut buf = Vec::new();
        assert!(read_frame(&mut cursor, &mut buf).is_err());
    }
}
