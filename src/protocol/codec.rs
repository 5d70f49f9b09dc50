//! Modbus Codec
//!
//! This module turns payload bytes into [`Request`]s and [`Response`]s into
//! complete wire frames.
//!
//! The connection handler owns the MBAP header: it reads it, uses it to find
//! the payload, and hands only the payload to [`FrameCodec::decode`]. The
//! decoder never sees the transaction id, so the handler injects it after
//! decoding. Encoding goes the other way and produces the whole frame,
//! header included.
//!
//! ## Payload Layout
//!
//! ```text
//! ┌─────────┬───────────────┬─────────────────────────────┐
//! │ unit id │ function code │ data (function specific)    │
//! │  1 byte │    1 byte     │ 0..252 bytes                │
//! └─────────┴───────────────┴─────────────────────────────┘
//! ```

use crate::protocol::header::{MbapHeader, MAX_PDU_LEN, MBAP_HEADER_LEN};
use crate::protocol::types::{
    function, Request, RequestPdu, Response, ResponsePdu, COIL_OFF, COIL_ON,
};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors produced while decoding a request or encoding a response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload has no unit id or no function code
    #[error("payload too short: {0} bytes")]
    EmptyPayload(usize),

    /// The data following the function code has the wrong size
    #[error("malformed request for function {function:#04x}: expected {expected} data bytes, got {actual}")]
    InvalidLength {
        function: u8,
        expected: usize,
        actual: usize,
    },

    /// The byte count field disagrees with the quantity field
    #[error("byte count {byte_count} does not match quantity {quantity} for function {function:#04x}")]
    ByteCountMismatch {
        function: u8,
        quantity: u16,
        byte_count: u8,
    },

    /// Write Single Coil with a value other than 0xFF00 or 0x0000
    #[error("invalid coil value: {0:#06x}")]
    InvalidCoilValue(u16),

    /// The encoded PDU would not fit in a frame
    #[error("response PDU too large: {size} bytes (max: {max})")]
    ResponseTooLarge { size: usize, max: usize },
}

/// Converts between payload bytes and decoded messages.
///
/// Implementations are shared by every connection and must be safe to call
/// concurrently.
pub trait FrameCodec: Send + Sync {
    /// Decodes the payload of a frame (the bytes after the MBAP header).
    ///
    /// The transaction id of the returned request is meaningless; the caller
    /// replaces it with the one from the header.
    fn decode(&self, payload: &[u8]) -> Result<Request, CodecError>;

    /// Encodes a response into a complete frame, MBAP header included.
    fn encode(&self, response: &Response) -> Result<Bytes, CodecError>;
}

/// The standard Modbus TCP codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusCodec;

impl ModbusCodec {
    pub fn new() -> Self {
        Self
    }
}

impl FrameCodec for ModbusCodec {
    fn decode(&self, payload: &[u8]) -> Result<Request, CodecError> {
        if payload.len() < 2 {
            return Err(CodecError::EmptyPayload(payload.len()));
        }

        let unit_id = payload[0];
        let pdu = decode_pdu(payload[1], &payload[2..])?;
        Ok(Request::new(0, unit_id, pdu))
    }

    fn encode(&self, response: &Response) -> Result<Bytes, CodecError> {
        let mut pdu = BytesMut::with_capacity(16);
        encode_pdu(&response.pdu, &mut pdu);

        if pdu.len() > MAX_PDU_LEN {
            return Err(CodecError::ResponseTooLarge {
                size: pdu.len(),
                max: MAX_PDU_LEN,
            });
        }

        // Length covers the unit id and the PDU; the check above keeps it in u16 range
        let header = MbapHeader::new(response.transaction_id, (pdu.len() + 1) as u16);

        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
        header.write_to(&mut frame);
        frame.put_u8(response.unit_id);
        frame.extend_from_slice(&pdu);
        Ok(frame.freeze())
    }
}

/// Decodes the function-specific data of a request.
fn decode_pdu(code: u8, data: &[u8]) -> Result<RequestPdu, CodecError> {
    match code {
        function::READ_COILS
        | function::READ_DISCRETE_INPUTS
        | function::READ_HOLDING_REGISTERS
        | function::READ_INPUT_REGISTERS => {
            expect_len(code, data, 4)?;
            let address = read_u16(data, 0);
            let quantity = read_u16(data, 2);
            Ok(match code {
                function::READ_COILS => RequestPdu::ReadCoils { address, quantity },
                function::READ_DISCRETE_INPUTS => RequestPdu::ReadDiscreteInputs { address, quantity },
                function::READ_HOLDING_REGISTERS => {
                    RequestPdu::ReadHoldingRegisters { address, quantity }
                }
                _ => RequestPdu::ReadInputRegisters { address, quantity },
            })
        }
        function::WRITE_SINGLE_COIL => {
            expect_len(code, data, 4)?;
            let value = match read_u16(data, 2) {
                COIL_ON => true,
                COIL_OFF => false,
                other => return Err(CodecError::InvalidCoilValue(other)),
            };
            Ok(RequestPdu::WriteSingleCoil {
                address: read_u16(data, 0),
                value,
            })
        }
        function::WRITE_SINGLE_REGISTER => {
            expect_len(code, data, 4)?;
            Ok(RequestPdu::WriteSingleRegister {
                address: read_u16(data, 0),
                value: read_u16(data, 2),
            })
        }
        function::WRITE_MULTIPLE_COILS => {
            let (address, quantity, bytes) = split_write_block(code, data, 0)?;
            if bytes.len() != usize::from(quantity).div_ceil(8) {
                return Err(CodecError::ByteCountMismatch {
                    function: code,
                    quantity,
                    byte_count: bytes.len() as u8,
                });
            }
            Ok(RequestPdu::WriteMultipleCoils {
                address,
                values: unpack_bits(bytes, quantity),
            })
        }
        function::WRITE_MULTIPLE_REGISTERS => {
            let (address, quantity, bytes) = split_write_block(code, data, 0)?;
            Ok(RequestPdu::WriteMultipleRegisters {
                address,
                values: unpack_registers(code, quantity, bytes)?,
            })
        }
        function::READ_WRITE_MULTIPLE_REGISTERS => {
            if data.len() < 4 {
                return Err(CodecError::InvalidLength {
                    function: code,
                    expected: 9,
                    actual: data.len(),
                });
            }
            let read_address = read_u16(data, 0);
            let read_quantity = read_u16(data, 2);
            let (write_address, quantity, bytes) = split_write_block(code, data, 4)?;
            Ok(RequestPdu::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values: unpack_registers(code, quantity, bytes)?,
            })
        }
        other => Ok(RequestPdu::Unsupported { function: other }),
    }
}

/// Splits `address, quantity, byte count, bytes` starting at `offset`.
///
/// The byte count must match the number of bytes that actually follow.
fn split_write_block(code: u8, data: &[u8], offset: usize) -> Result<(u16, u16, &[u8]), CodecError> {
    let block = &data[offset..];
    if block.len() < 5 {
        return Err(CodecError::InvalidLength {
            function: code,
            expected: offset + 5,
            actual: data.len(),
        });
    }

    let address = read_u16(block, 0);
    let quantity = read_u16(block, 2);
    let byte_count = block[4];
    let bytes = &block[5..];

    if bytes.len() != usize::from(byte_count) {
        return Err(CodecError::InvalidLength {
            function: code,
            expected: offset + 5 + usize::from(byte_count),
            actual: data.len(),
        });
    }

    Ok((address, quantity, bytes))
}

fn unpack_registers(code: u8, quantity: u16, bytes: &[u8]) -> Result<Vec<u16>, CodecError> {
    if bytes.len() != usize::from(quantity) * 2 {
        return Err(CodecError::ByteCountMismatch {
            function: code,
            quantity,
            byte_count: bytes.len() as u8,
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Bits are packed LSB first: bit 0 of the first byte is the first value.
fn unpack_bits(bytes: &[u8], quantity: u16) -> Vec<bool> {
    (0..usize::from(quantity))
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

fn pack_bits(values: &[bool], buf: &mut BytesMut) {
    for chunk in values.chunks(8) {
        let byte = chunk
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, &on)| if on { acc | (1 << i) } else { acc });
        buf.put_u8(byte);
    }
}

fn expect_len(code: u8, data: &[u8], expected: usize) -> Result<(), CodecError> {
    if data.len() != expected {
        return Err(CodecError::InvalidLength {
            function: code,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

#[inline]
fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Writes the function code and data of a response.
fn encode_pdu(pdu: &ResponsePdu, buf: &mut BytesMut) {
    buf.put_u8(pdu.function_code());
    match pdu {
        ResponsePdu::ReadCoils(values) | ResponsePdu::ReadDiscreteInputs(values) => {
            buf.put_u8(values.len().div_ceil(8) as u8);
            pack_bits(values, buf);
        }
        ResponsePdu::ReadHoldingRegisters(values)
        | ResponsePdu::ReadInputRegisters(values)
        | ResponsePdu::ReadWriteMultipleRegisters(values) => {
            buf.put_u8((values.len() * 2) as u8);
            for value in values {
                buf.put_u16(*value);
            }
        }
        ResponsePdu::WriteSingleCoil { address, value } => {
            buf.put_u16(*address);
            buf.put_u16(if *value { COIL_ON } else { COIL_OFF });
        }
        ResponsePdu::WriteSingleRegister { address, value } => {
            buf.put_u16(*address);
            buf.put_u16(*value);
        }
        ResponsePdu::WriteMultipleCoils { address, quantity }
        | ResponsePdu::WriteMultipleRegisters { address, quantity } => {
            buf.put_u16(*address);
            buf.put_u16(*quantity);
        }
        ResponsePdu::Exception { code, .. } => {
            buf.put_u8(code.as_u8());
        }
    }
}
