//! MBAP Header
//!
//! Every Modbus TCP message on the wire starts with a fixed 6-byte header:
//!
//! ```text
//! ┌────────────────┬────────────────┬────────────────┬──────────────────────┐
//! │ Transaction id │  Protocol id   │     Length     │ Payload (N bytes)    │
//! │   u16 (BE)     │   u16 (BE)     │   u16 (BE)     │ unit id + PDU        │
//! │   bytes 0-1    │   bytes 2-3    │   bytes 4-5    │ bytes 6..6+N         │
//! └────────────────┴────────────────┴────────────────┴──────────────────────┘
//! ```
//!
//! The length field counts the bytes that follow the header. The header is
//! the only framing information on the stream, so it has to be read before
//! anything else can be.

use bytes::BufMut;

/// Size of the MBAP header in bytes.
pub const MBAP_HEADER_LEN: usize = 6;

/// Largest payload a well-formed frame can carry: one unit id byte plus a
/// 253-byte PDU.
pub const MAX_PAYLOAD_LEN: usize = 254;

/// Largest PDU (function code + data) a Modbus frame may carry.
pub const MAX_PDU_LEN: usize = 253;

/// The protocol identifier used by Modbus. Other values are ignored.
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// A decoded MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Correlation id chosen by the client, echoed in the response
    pub transaction_id: u16,
    /// Reserved, expected to be zero
    pub protocol_id: u16,
    /// Number of payload bytes following the header
    pub length: u16,
}

impl MbapHeader {
    /// Creates a Modbus header for a payload of `length` bytes.
    pub fn new(transaction_id: u16, length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length,
        }
    }

    /// Interprets 6 raw bytes as a header. All fields are big-endian.
    pub fn from_bytes(buf: &[u8; MBAP_HEADER_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
        }
    }

    /// Payload length as a buffer size.
    #[inline]
    pub fn payload_len(&self) -> usize {
        usize::from(self.length)
    }

    /// Appends the wire representation of this header to `buf`.
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
    }
}
