//! Connection Registry
//!
//! Keeps track of live connections by endpoint. Handlers report their end
//! through a [`ConnectionClosed`] event on the registry's channel; the
//! registry's listener task releases the entry when the event arrives.
//!
//! On shutdown the registry disposes every connection it still knows about.

use crate::connection::handler::{ConnectionClosed, DisposeHandle};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug)]
struct Registration {
    dispose: DisposeHandle,
    connected_at: Instant,
}

/// Live connections, keyed by remote endpoint.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Registration>>,
    events: mpsc::UnboundedSender<ConnectionClosed>,
}

impl ConnectionRegistry {
    /// Creates an empty registry and the receiving end of its close events.
    ///
    /// Pass the receiver to [`listen`](Self::listen).
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionClosed>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            connections: Mutex::new(HashMap::new()),
            events,
        };
        (registry, rx)
    }

    /// Returns a sender for a new handler's close notification.
    pub fn close_listener(&self) -> mpsc::UnboundedSender<ConnectionClosed> {
        self.events.clone()
    }

    /// Starts tracking a connection.
    pub fn register(&self, endpoint: &str, dispose: DisposeHandle) {
        let registration = Registration {
            dispose,
            connected_at: Instant::now(),
        };
        self.lock().insert(endpoint.to_string(), registration);
    }

    /// Stops tracking a connection. Returns false if it was not tracked.
    pub fn release(&self, endpoint: &str) -> bool {
        match self.lock().remove(endpoint) {
            Some(registration) => {
                debug!(
                    client = %endpoint,
                    duration_ms = registration.connected_at.elapsed().as_millis() as u64,
                    "Connection released"
                );
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.lock().contains_key(endpoint)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Disposes every tracked connection. Entries are released once their
    /// handlers report the close. Returns the number of connections disposed.
    pub fn dispose_all(&self) -> usize {
        let connections = self.lock();
        for registration in connections.values() {
            registration.dispose.dispose();
        }
        if !connections.is_empty() {
            info!(count = connections.len(), "Disposing open connections");
        }
        connections.len()
    }

    /// Releases connections as their close events arrive.
    ///
    /// Runs until every sender, including the registry's own, is dropped.
    pub async fn listen(&self, mut events: mpsc::UnboundedReceiver<ConnectionClosed>) {
        while let Some(event) = events.recv().await {
            self.release(&event.endpoint);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        // The map stays consistent even if a holder panicked
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
