//! Request Processor
//!
//! This module applies decoded Modbus requests to the data store and builds
//! the responses.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SlaveProcessor                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  validate   │───>│  dispatch   │───>│   reply     │     │
//! │  │ (quantity)  │    │ (per FC)    │    │ / exception │     │
//! │  └─────────────┘    └──────┬──────┘    └─────────────┘     │
//! │                            │                                │
//! │                            ▼                                │
//! │                        DataStore                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests the slave cannot honour (bad quantity, range past the end of a
//! table, unknown function) are answered with a Modbus exception response.
//! Only failures of the slave itself are returned as errors.

use crate::protocol::{ExceptionCode, Request, RequestPdu, Response, ResponsePdu};
use crate::storage::{DataStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Largest quantity for Read Coils / Read Discrete Inputs
pub const MAX_READ_BITS: u16 = 2000;

/// Largest quantity for Read Holding / Input Registers
pub const MAX_READ_REGISTERS: u16 = 125;

/// Largest quantity for Write Multiple Coils
pub const MAX_WRITE_BITS: u16 = 1968;

/// Largest quantity for Write Multiple Registers
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Largest write quantity for Read/Write Multiple Registers
pub const MAX_READ_WRITE_REGISTERS: u16 = 121;

/// Errors that prevent the processor from producing any response.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("data store failure: {0}")]
    Store(#[from] StoreError),
}

/// Turns a request into a response.
///
/// One processor is shared by every connection, so implementations must be
/// safe to call concurrently.
pub trait RequestProcessor: Send + Sync {
    /// Applies the request and produces the response to send back.
    fn apply(&self, request: &Request) -> Result<Response, ProcessorError>;
}

/// Why a request did not produce a normal response.
enum Rejection {
    Exception(ExceptionCode),
    Failed(ProcessorError),
}

impl From<StoreError> for Rejection {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfRange { .. } => {
                Rejection::Exception(ExceptionCode::IllegalDataAddress)
            }
            StoreError::Poisoned(_) => Rejection::Failed(ProcessorError::Store(err)),
        }
    }
}

type Outcome = Result<ResponsePdu, Rejection>;

/// A Modbus slave backed by a [`DataStore`].
#[derive(Debug, Clone)]
pub struct SlaveProcessor {
    store: Arc<DataStore>,
    /// When set, requests for other units get a gateway exception
    unit_id: Option<u8>,
}

impl SlaveProcessor {
    /// Creates a processor that answers every unit id.
    pub fn new(store: Arc<DataStore>) -> Self {
        Self {
            store,
            unit_id: None,
        }
    }

    /// Restricts the processor to a single unit id.
    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    /// Returns the underlying data store.
    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    fn dispatch(&self, pdu: &RequestPdu) -> Outcome {
        match pdu {
            RequestPdu::ReadCoils { address, quantity } => {
                check_quantity(*quantity, MAX_READ_BITS)?;
                Ok(ResponsePdu::ReadCoils(
                    self.store.read_coils(*address, *quantity)?,
                ))
            }
            RequestPdu::ReadDiscreteInputs { address, quantity } => {
                check_quantity(*quantity, MAX_READ_BITS)?;
                Ok(ResponsePdu::ReadDiscreteInputs(
                    self.store.read_discrete_inputs(*address, *quantity)?,
                ))
            }
            RequestPdu::ReadHoldingRegisters { address, quantity } => {
                check_quantity(*quantity, MAX_READ_REGISTERS)?;
                Ok(ResponsePdu::ReadHoldingRegisters(
                    self.store.read_holding_registers(*address, *quantity)?,
                ))
            }
            RequestPdu::ReadInputRegisters { address, quantity } => {
                check_quantity(*quantity, MAX_READ_REGISTERS)?;
                Ok(ResponsePdu::ReadInputRegisters(
                    self.store.read_input_registers(*address, *quantity)?,
                ))
            }
            RequestPdu::WriteSingleCoil { address, value } => {
                self.store.write_coils(*address, &[*value])?;
                Ok(ResponsePdu::WriteSingleCoil {
                    address: *address,
                    value: *value,
                })
            }
            RequestPdu::WriteSingleRegister { address, value } => {
                self.store.write_holding_registers(*address, &[*value])?;
                Ok(ResponsePdu::WriteSingleRegister {
                    address: *address,
                    value: *value,
                })
            }
            RequestPdu::WriteMultipleCoils { address, values } => {
                let quantity = check_len(values.len(), MAX_WRITE_BITS)?;
                self.store.write_coils(*address, values)?;
                Ok(ResponsePdu::WriteMultipleCoils {
                    address: *address,
                    quantity,
                })
            }
            RequestPdu::WriteMultipleRegisters { address, values } => {
                let quantity = check_len(values.len(), MAX_WRITE_REGISTERS)?;
                self.store.write_holding_registers(*address, values)?;
                Ok(ResponsePdu::WriteMultipleRegisters {
                    address: *address,
                    quantity,
                })
            }
            RequestPdu::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values,
            } => {
                check_quantity(*read_quantity, MAX_READ_REGISTERS)?;
                check_len(values.len(), MAX_READ_WRITE_REGISTERS)?;
                Ok(ResponsePdu::ReadWriteMultipleRegisters(
                    self.store.write_read_holding_registers(
                        *write_address,
                        values,
                        *read_address,
                        *read_quantity,
                    )?,
                ))
            }
            RequestPdu::Unsupported { function } => {
                debug!(function = *function, "Unsupported function code");
                Err(Rejection::Exception(ExceptionCode::IllegalFunction))
            }
        }
    }
}

impl RequestProcessor for SlaveProcessor {
    fn apply(&self, request: &Request) -> Result<Response, ProcessorError> {
        if let Some(unit_id) = self.unit_id {
            if request.unit_id != unit_id {
                trace!(%request, "Request for another unit");
                return Ok(request.exception(ExceptionCode::GatewayTargetFailedToRespond));
            }
        }

        match self.dispatch(&request.pdu) {
            Ok(pdu) => Ok(request.reply(pdu)),
            Err(Rejection::Exception(code)) => {
                trace!(%request, exception = %code, "Request rejected");
                Ok(request.exception(code))
            }
            Err(Rejection::Failed(err)) => Err(err),
        }
    }
}

fn check_quantity(quantity: u16, max: u16) -> Result<(), Rejection> {
    if quantity == 0 || quantity > max {
        return Err(Rejection::Exception(ExceptionCode::IllegalDataValue));
    }
    Ok(())
}

fn check_len(len: usize, max: u16) -> Result<u16, Rejection> {
    match u16::try_from(len) {
        Ok(quantity) => {
            check_quantity(quantity, max)?;
            Ok(quantity)
        }
        Err(_) => Err(Rejection::Exception(ExceptionCode::IllegalDataValue)),
    }
}
