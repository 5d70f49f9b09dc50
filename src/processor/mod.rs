//! Request Processor Module
//!
//! This module implements the application layer of the slave. It receives
//! decoded requests, executes them against the data store, and returns the
//! responses to send back.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  ModbusCodec    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ SlaveProcessor  │  (this module)
//! │                 │
//! │  - Validate     │
//! │  - Dispatch     │
//! │  - Execute      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   DataStore     │  (storage module)
//! └─────────────────┘
//! ```
//!
//! The connection handler only depends on the [`RequestProcessor`] trait,
//! so other applications can plug in their own processor.

pub mod handler;

// Re-export the processor types
pub use handler::{ProcessorError, RequestProcessor, SlaveProcessor};
