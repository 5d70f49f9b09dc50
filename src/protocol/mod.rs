//! Modbus TCP Protocol Implementation
//!
//! This module provides the wire-level pieces of Modbus TCP.
//!
//! ## Overview
//!
//! Every message is a 6-byte MBAP header followed by a payload whose length
//! the header announces. The payload starts with a unit id and a function
//! code; what follows depends on the function code.
//!
//! ## Modules
//!
//! - `header`: The MBAP header and frame size limits
//! - `types`: Decoded `Request` / `Response` messages
//! - `codec`: The `FrameCodec` trait and the standard `ModbusCodec`
//!
//! ## Example
//!
//! ```ignore
//! use mbslave::protocol::{FrameCodec, ModbusCodec, ResponsePdu};
//!
//! let codec = ModbusCodec::new();
//!
//! // Decoding a payload (the bytes after the header)
//! let request = codec.decode(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02])?;
//!
//! // Encoding a response into a full frame
//! let response = request.reply(ResponsePdu::ReadHoldingRegisters(vec![1, 2]));
//! let frame = codec.encode(&response)?;
//! ```

pub mod codec;
pub mod header;
pub mod types;

// Re-export commonly used types for convenience
pub use codec::{CodecError, FrameCodec, ModbusCodec};
pub use header::{MbapHeader, MAX_PAYLOAD_LEN, MAX_PDU_LEN, MBAP_HEADER_LEN};
pub use types::{ExceptionCode, Request, RequestPdu, Response, ResponsePdu};
