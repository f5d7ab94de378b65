//! Record framing shared by every durable log.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"3PCL";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + type (1) + length (4).
pub(crate) const HEADER_SIZE: usize = 11;

/// CRC size.
pub(crate) const CRC_SIZE: usize = 4;

/// A record that can be appended to a [`super::DurableLog`].
///
/// The payload is CBOR; the type byte lives in the frame header so a reader
/// can reject unknown record kinds before decoding anything.
pub trait LogRecord: Serialize + DeserializeOwned + Sized {
    /// Returns the type byte written in the frame header.
    fn record_type(&self) -> u8;

    /// Returns true if `type_byte` names a record kind this log understands.
    fn is_known_type(type_byte: u8) -> bool;

    /// Serializes the record payload (without frame).
    ///
    /// # Errors
    ///
    /// Returns an error if CBOR encoding fails.
    fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::encode(e.to_string()))?;
        Ok(buf)
    }

    /// Deserializes a record from its type byte and payload.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the payload does not decode or decodes
    /// to a record of a different type than the header claims.
    fn decode_payload(type_byte: u8, payload: &[u8]) -> CoreResult<Self> {
        let record: Self = ciborium::from_reader(payload)
            .map_err(|e| CoreError::log_corruption(format!("undecodable payload: {e}")))?;

        if record.record_type() != type_byte {
            return Err(CoreError::log_corruption(format!(
                "header type {type_byte} does not match payload type {}",
                record.record_type()
            )));
        }

        Ok(record)
    }
}

/// Frames a record for appending.
pub(crate) fn encode_frame<R: LogRecord>(record: &R) -> CoreResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("log record payload too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&LOG_MAGIC);
    data.extend_from_slice(&LOG_VERSION.to_le_bytes());
    data.push(record.record_type());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);

    // CRC covers header and payload
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());

    Ok(data)
}

/// Computes the IEEE CRC32 checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        (crc >> 8) ^ CRC32_TABLE[index]
    }) ^ 0xFFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Probe {
        Ping(u32),
        Pong,
    }

    impl LogRecord for Probe {
        fn record_type(&self) -> u8 {
            match self {
                Probe::Ping(_) => 1,
                Probe::Pong => 2,
            }
        }

        fn is_known_type(type_byte: u8) -> bool {
            matches!(type_byte, 1 | 2)
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn frame_layout() {
        let frame = encode_frame(&Probe::Ping(7)).unwrap();
        let payload_len = u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]) as usize;

        assert_eq!(&frame[0..4], &LOG_MAGIC);
        assert_eq!(u16::from_le_bytes([frame[4], frame[5]]), LOG_VERSION);
        assert_eq!(frame[6], 1);
        assert_eq!(frame.len(), HEADER_SIZE + payload_len + CRC_SIZE);

        let crc_at = HEADER_SIZE + payload_len;
        let stored = u32::from_le_bytes([
            frame[crc_at],
            frame[crc_at + 1],
            frame[crc_at + 2],
            frame[crc_at + 3],
        ]);
        assert_eq!(stored, compute_crc32(&frame[..crc_at]));
    }

    #[test]
    fn decode_rejects_mismatched_type() {
        let payload = Probe::Pong.encode_payload().unwrap();
        assert!(matches!(
            Probe::decode_payload(1, &payload),
            Err(CoreError::LogCorruption { .. })
        ));
        assert_eq!(Probe::decode_payload(2, &payload).unwrap(), Probe::Pong);
    }
}
