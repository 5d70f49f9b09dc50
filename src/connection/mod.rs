//! Connection Handler Module
//!
//! This module manages individual client connections to the slave.
//! Each client connection is handled by its own async task, allowing
//! the server to serve many Modbus masters at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │──── register ───> ConnectionRegistry
//!           └────────────┬───────────┘                         ▲
//!                        │                                     │
//!                        │ spawn task                          │ ConnectionClosed
//!                        ▼                                     │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ Read header │───>│Read payload │───>│ Decode and  │     │
//! │  │  (6 bytes)  │    │ (N bytes)   │    │   apply     │     │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘     │
//! │         ▲                                     │             │
//! │         │                                     ▼             │
//! │         │                            ┌─────────────┐        │
//! │         └────────────────────────────│ Send resp   │        │
//! │                                      └─────────────┘        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Async I/O**: Uses Tokio for non-blocking network operations
//! - **Exact Framing**: Reads exactly the length the MBAP header announces
//! - **One Transaction at a Time**: No pipelining, no overlapping I/O
//! - **Statistics**: Tracks connection and transaction metrics
//!
//! ## Example
//!
//! ```ignore
//! use mbslave::connection::{handle_connection, ConnectionRegistry, ConnectionStats};
//! use mbslave::processor::SlaveProcessor;
//! use mbslave::protocol::ModbusCodec;
//! use mbslave::storage::DataStore;
//! use std::sync::Arc;
//!
//! let processor = Arc::new(SlaveProcessor::new(Arc::new(DataStore::new())));
//! let codec = Arc::new(ModbusCodec::new());
//! let stats = Arc::new(ConnectionStats::new());
//! let (registry, events) = ConnectionRegistry::new();
//!
//! // For each accepted connection...
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, processor, codec, stats, registry));
//! ```

pub mod handler;
pub mod registry;

// Re-export commonly used types
pub use handler::{
    handle_connection, ConnectionClosed, ConnectionError, ConnectionHandler, ConnectionState,
    ConnectionStats, DisposeHandle,
};
pub use registry::ConnectionRegistry;
