//! mbslave - An Async Modbus TCP Slave
//!
//! This is the main entry point for the mbslave server.
//! It sets up the TCP listener, data store, and handles incoming connections.

use mbslave::config::Config;
use mbslave::connection::{handle_connection, ConnectionRegistry, ConnectionStats};
use mbslave::processor::{RequestProcessor, SlaveProcessor};
use mbslave::protocol::{FrameCodec, ModbusCodec};
use mbslave::storage::DataStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config) {
    println!(
        r#"
mbslave v{} - Modbus TCP Slave
──────────────────────────────────────────────────────────────
Server started on {}
Unit id: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        mbslave::VERSION,
        config.listen,
        config
            .unit_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "any".to_string()),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments and the config file
    let config = Config::load()?;

    // Set up logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    print_banner(&config);

    // Create the data store and processor (shared across all connections)
    let store = Arc::new(DataStore::new());
    let mut slave = SlaveProcessor::new(Arc::clone(&store));
    if let Some(unit_id) = config.unit_id {
        slave = slave.with_unit_id(unit_id);
    }
    let processor: Arc<dyn RequestProcessor> = Arc::new(slave);
    let codec: Arc<dyn FrameCodec> = Arc::new(ModbusCodec::new());
    info!(unit_id = ?config.unit_id, "Data store initialized");

    // Create connection statistics and the registry
    let stats = Arc::new(ConnectionStats::new());
    let (registry, events) = ConnectionRegistry::new();
    let registry = Arc::new(registry);
    let registry_task = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.listen(events).await })
    };

    // Bind the TCP listener
    let listener = TcpListener::bind(&config.listen).await?;
    info!("Listening on {}", config.listen);

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    // Main accept loop
    tokio::select! {
        _ = accept_loop(listener, processor, codec, Arc::clone(&stats), Arc::clone(&registry)) => {}
        _ = shutdown => {}
    }

    registry.dispose_all();
    registry_task.abort();

    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        transactions = stats.transactions_processed.load(Ordering::Relaxed),
        reads = store.stats().reads,
        writes = store.stats().writes,
        "Server shutdown complete"
    );
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(
    listener: TcpListener,
    processor: Arc<dyn RequestProcessor>,
    codec: Arc<dyn FrameCodec>,
    stats: Arc<ConnectionStats>,
    registry: Arc<ConnectionRegistry>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    error!(client = %addr, "Failed to set TCP_NODELAY: {}", e);
                }

                // Spawn a task to handle this connection
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    Arc::clone(&processor),
                    Arc::clone(&codec),
                    Arc::clone(&stats),
                    Arc::clone(&registry),
                ));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
