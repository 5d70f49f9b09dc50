//! Storage Module
//!
//! This module provides the slave's data tables.
//!
//! ## Components
//!
//! - **DataStore**: Coils, discrete inputs, holding registers and input
//!   registers, each behind its own `RwLock`
//!
//! ## Example
//!
//! ```ignore
//! use mbslave::storage::DataStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(DataStore::new());
//!
//! store.write_holding_registers(0, &[0x1234, 0x5678])?;
//! let values = store.read_holding_registers(0, 2)?;
//! assert_eq!(values, vec![0x1234, 0x5678]);
//!
//! // Device side: publish a measurement
//! store.set_input_registers(100, &[231])?;
//! ```

pub mod engine;

// Re-export commonly used types
pub use engine::{DataStore, StoreError, StoreStats, TABLE_SIZE};
