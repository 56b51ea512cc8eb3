//! Connection Manager - one cached hypervisor session per URI.
//!
//! Sessions are opened on first use and kept for the life of the process.
//! Each URI has its own async slot lock, so concurrent `acquire` calls for the
//! same URI wait for a single open instead of racing to reconnect, while
//! different URIs never block each other.
//!
//! A broken session is noticed lazily: either the health check in `acquire`
//! fails, or an operation reports a connection error and the dispatcher
//! calls [`ConnectionManager::invalidate`]. The next `acquire` reopens it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use virtpilot_hypervisor::{Connector, Hypervisor};

use crate::error::{ControlError, Result};

/// A live session to one hypervisor URI.
#[derive(Clone)]
pub struct Connection {
    uri: String,
    hypervisor: Arc<dyn Hypervisor>,
    generation: u64,
}

impl Connection {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// Identifies this particular session among reconnects to the same URI.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("uri", &self.uri)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Attempts made to open a session before reporting a connection error.
const OPEN_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(100);

type Slot = Arc<tokio::sync::Mutex<Option<Connection>>>;

/// Caches hypervisor sessions per URI.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn slot(&self, uri: &str) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| ControlError::Driver("connection table lock poisoned".to_string()))?;
        Ok(slots.entry(uri.to_string()).or_default().clone())
    }

    /// Return a usable session to `uri`, opening or reopening it as needed.
    pub async fn acquire(&self, uri: &str) -> Result<Connection> {
        if uri.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "hypervisor URI is empty".to_string(),
            ));
        }

        let slot = self.slot(uri)?;
        let mut cached = slot.lock().await;

        if let Some(conn) = cached.as_ref() {
            match conn.hypervisor.health_check().await {
                Ok(true) => return Ok(conn.clone()),
                Ok(false) => warn!(uri = %uri, "Cached connection is dead, reconnecting"),
                Err(e) => warn!(uri = %uri, error = %e, "Health check failed, reconnecting"),
            }
            *cached = None;
        }

        let mut attempt = 0;
        let hypervisor = loop {
            attempt += 1;
            debug!(uri = %uri, attempt, "Opening hypervisor connection");

            match self.connector.open(uri).await {
                Ok(hypervisor) => break hypervisor,
                Err(e) if attempt < OPEN_ATTEMPTS => {
                    warn!(uri = %uri, error = %e, "Connect failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(ControlError::Connection {
                        uri: uri.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        };

        let conn = Connection {
            uri: uri.to_string(),
            hypervisor,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        info!(uri = %uri, generation = conn.generation, "Hypervisor connection established");

        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached session if it is still `conn`.
    ///
    /// A newer session opened by another caller in the meantime is kept.
    pub async fn invalidate(&self, conn: &Connection) {
        let Ok(slot) = self.slot(&conn.uri) else {
            return;
        };
        let mut cached = slot.lock().await;

        if cached.as_ref().map(Connection::generation) == Some(conn.generation) {
            warn!(uri = %conn.uri, generation = conn.generation, "Invalidating hypervisor connection");
            *cached = None;
        }
    }

    /// URIs with an established session, sorted.
    pub async fn hosts(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = match self.slots.lock() {
            Ok(slots) => slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(_) => return Vec::new(),
        };

        let mut hosts = Vec::new();
        for (uri, slot) in slots {
            if slot.lock().await.is_some() {
                hosts.push(uri);
            }
        }
        hosts.sort();
        hosts
    }
}
