//! # mbslave - An Async Modbus TCP Slave
//!
//! mbslave is a Modbus TCP slave (server) written in Rust. Each client
//! connection runs its own transaction loop: read the MBAP header, read
//! exactly the payload it announces, process the request, write the
//! response, and start over.
//!
//! ## Features
//!
//! - **Exact Framing**: The 6-byte MBAP header drives every read
//! - **Transaction Correlation**: Responses always echo the request's
//!   transaction id
//! - **Quiet Disconnects**: Orderly closes and peer resets end a connection
//!   silently; everything else is surfaced
//! - **Async I/O**: Built on Tokio, one task per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              mbslave                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│   Slave     │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Processor  │                  │
//! │  └──────┬──────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │         │                  │                  │                         │
//! │         ▼                  ▼                  ▼                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────────┐ │
//! │  │ Connection  │    │   Modbus    │    │          DataStore           │ │
//! │  │  Registry   │    │   Codec     │    │ coils │ inputs │ registers   │ │
//! │  └─────────────┘    └─────────────┘    └──────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use mbslave::connection::{handle_connection, ConnectionRegistry, ConnectionStats};
//! use mbslave::processor::{RequestProcessor, SlaveProcessor};
//! use mbslave::protocol::{FrameCodec, ModbusCodec};
//! use mbslave::storage::DataStore;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(DataStore::new());
//!     let processor: Arc<dyn RequestProcessor> = Arc::new(SlaveProcessor::new(store));
//!     let codec: Arc<dyn FrameCodec> = Arc::new(ModbusCodec::new());
//!     let stats = Arc::new(ConnectionStats::new());
//!
//!     let (registry, events) = ConnectionRegistry::new();
//!     let registry = Arc::new(registry);
//!     let listener_registry = Arc::clone(&registry);
//!     tokio::spawn(async move { listener_registry.listen(events).await });
//!
//!     let listener = TcpListener::bind("127.0.0.1:502").await.unwrap();
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await.unwrap();
//!         tokio::spawn(handle_connection(
//!             stream,
//!             addr,
//!             Arc::clone(&processor),
//!             Arc::clone(&codec),
//!             Arc::clone(&stats),
//!             Arc::clone(&registry),
//!         ));
//!     }
//! }
//! ```
//!
//! ## Supported Function Codes
//!
//! - `0x01` Read Coils / `0x02` Read Discrete Inputs
//! - `0x03` Read Holding Registers / `0x04` Read Input Registers
//! - `0x05` Write Single Coil / `0x06` Write Single Register
//! - `0x0F` Write Multiple Coils / `0x10` Write Multiple Registers
//! - `0x17` Read/Write Multiple Registers
//!
//! Other function codes are answered with an Illegal Function exception.
//!
//! ## Module Overview
//!
//! - [`protocol`]: MBAP header, message types and the Modbus codec
//! - [`storage`]: Thread-safe data tables
//! - [`processor`]: Applies requests to the data tables
//! - [`connection`]: Per-connection transaction loop and registry
//! - [`config`]: CLI and TOML configuration

pub mod config;
pub mod connection;
pub mod processor;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use connection::{
    handle_connection, ConnectionClosed, ConnectionError, ConnectionHandler, ConnectionRegistry,
    ConnectionStats,
};
pub use processor::{ProcessorError, RequestProcessor, SlaveProcessor};
pub use protocol::{CodecError, FrameCodec, MbapHeader, ModbusCodec, Request, Response};
pub use storage::DataStore;

/// The standard Modbus TCP port
pub const DEFAULT_PORT: u16 = 502;

/// Version of mbslave
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
