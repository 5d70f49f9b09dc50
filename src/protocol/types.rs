//! Modbus Message Types
//!
//! This module defines the decoded form of requests and responses.
//! A message is a transaction id (taken from the MBAP header), a unit id
//! (the first payload byte) and a PDU: a function code followed by
//! function-specific data.
//!
//! ## Function Codes
//!
//! - `0x01` Read Coils
//! - `0x02` Read Discrete Inputs
//! - `0x03` Read Holding Registers
//! - `0x04` Read Input Registers
//! - `0x05` Write Single Coil
//! - `0x06` Write Single Register
//! - `0x0F` Write Multiple Coils
//! - `0x10` Write Multiple Registers
//! - `0x17` Read/Write Multiple Registers
//!
//! An exception response sets the high bit of the function code
//! (`function | 0x80`) and carries a one-byte exception code.

use std::fmt;

/// Bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Value of a coil that is ON in a Write Single Coil request.
pub const COIL_ON: u16 = 0xFF00;

/// Value of a coil that is OFF in a Write Single Coil request.
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes understood by this crate.
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
    pub const READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;
}

/// Exception codes a slave can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// The function code is not supported
    IllegalFunction = 0x01,
    /// The address range is outside the data table
    IllegalDataAddress = 0x02,
    /// A value in the request (usually a quantity) is not allowed
    IllegalDataValue = 0x03,
    /// The addressed unit is not served by this slave
    GatewayTargetFailedToRespond = 0x0B,
}

impl ExceptionCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::GatewayTargetFailedToRespond => "gateway target failed to respond",
        };
        write!(f, "{} ({:#04x})", name, self.as_u8())
    }
}

/// The function-specific part of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPdu {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    ReadWriteMultipleRegisters {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: Vec<u16>,
    },
    /// A function code this crate does not implement. The processor answers
    /// it with an Illegal Function exception.
    Unsupported { function: u8 },
}

impl RequestPdu {
    /// Returns the function code of this request.
    pub fn function_code(&self) -> u8 {
        match self {
            RequestPdu::ReadCoils { .. } => function::READ_COILS,
            RequestPdu::ReadDiscreteInputs { .. } => function::READ_DISCRETE_INPUTS,
            RequestPdu::ReadHoldingRegisters { .. } => function::READ_HOLDING_REGISTERS,
            RequestPdu::ReadInputRegisters { .. } => function::READ_INPUT_REGISTERS,
            RequestPdu::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            RequestPdu::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
            RequestPdu::WriteMultipleCoils { .. } => function::WRITE_MULTIPLE_COILS,
            RequestPdu::WriteMultipleRegisters { .. } => function::WRITE_MULTIPLE_REGISTERS,
            RequestPdu::ReadWriteMultipleRegisters { .. } => {
                function::READ_WRITE_MULTIPLE_REGISTERS
            }
            RequestPdu::Unsupported { function } => *function,
        }
    }
}

/// The function-specific part of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePdu {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, quantity: u16 },
    WriteMultipleRegisters { address: u16, quantity: u16 },
    ReadWriteMultipleRegisters(Vec<u16>),
    Exception { function: u8, code: ExceptionCode },
}

impl ResponsePdu {
    /// Returns the function code as it appears on the wire, including the
    /// exception flag for exception responses.
    pub fn function_code(&self) -> u8 {
        match self {
            ResponsePdu::ReadCoils(_) => function::READ_COILS,
            ResponsePdu::ReadDiscreteInputs(_) => function::READ_DISCRETE_INPUTS,
            ResponsePdu::ReadHoldingRegisters(_) => function::READ_HOLDING_REGISTERS,
            ResponsePdu::ReadInputRegisters(_) => function::READ_INPUT_REGISTERS,
            ResponsePdu::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            ResponsePdu::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
            ResponsePdu::WriteMultipleCoils { .. } => function::WRITE_MULTIPLE_COILS,
            ResponsePdu::WriteMultipleRegisters { .. } => function::WRITE_MULTIPLE_REGISTERS,
            ResponsePdu::ReadWriteMultipleRegisters(_) => {
                function::READ_WRITE_MULTIPLE_REGISTERS
            }
            ResponsePdu::Exception { function, .. } => function | EXCEPTION_FLAG,
        }
    }

    /// Returns true if this is an exception response.
    pub fn is_exception(&self) -> bool {
        matches!(self, ResponsePdu::Exception { .. })
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation id, always the value from the MBAP header
    pub transaction_id: u16,
    /// Addressed unit (first payload byte)
    pub unit_id: u8,
    pub pdu: RequestPdu,
}

impl Request {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: RequestPdu) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }

    /// Builds a response that answers this request.
    ///
    /// The transaction id and unit id are copied so the client can match
    /// the response to its request.
    pub fn reply(&self, pdu: ResponsePdu) -> Response {
        Response {
            transaction_id: self.transaction_id,
            unit_id: self.unit_id,
            pdu,
        }
    }

    /// Builds an exception response for this request.
    pub fn exception(&self, code: ExceptionCode) -> Response {
        self.reply(ResponsePdu::Exception {
            function: self.pdu.function_code(),
            code,
        })
    }
}

/// A response ready to be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: ResponsePdu,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tid={} unit={} fc={:#04x}",
            self.transaction_id,
            self.unit_id,
            self.pdu.function_code()
        )
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pdu {
            ResponsePdu::Exception { function, code } => write!(
                f,
                "tid={} unit={} fc={:#04x} exception: {}",
                self.transaction_id, self.unit_id, function, code
            ),
            pdu => write!(
                f,
                "tid={} unit={} fc={:#04x}",
                self.transaction_id,
                self.unit_id,
                pdu.function_code()
            ),
        }
    }
}
