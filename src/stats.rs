//! Named counters reported at well-defined points of a connection's life.
//!
//! The proxy core only ever calls [`StatsSink::incr`]; collection, export and
//! periodic logging belong to the embedding application. Implementations must
//! never block and never fail the connection.

use std::collections::HashMap;
use std::sync::Mutex;

/// Counter keys used by the core.
pub mod keys {
    pub const CONNECTIONS_ACCEPTED: &str = "connections/accepted";
    /// Bytes flowing client -> destination.
    pub const DATA_SENT: &str = "data/sent";
    /// Bytes flowing destination -> client.
    pub const DATA_RECEIVED: &str = "data/received";
    pub const AUTH_ATTEMPTS: &str = "auth/attempts";
    pub const AUTH_FAILURES: &str = "auth/failures";
}

/// A narrow "increment counter by name" interface.
pub trait StatsSink: Send + Sync {
    fn incr(&self, key: &str, n: u64);
}

/// Discards every measurement; the default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn incr(&self, _key: &str, _n: u64) {}
}

/// An in-memory counter table, useful for tests and for periodic
/// stats logging in the embedding application.
#[derive(Debug, Default)]
pub struct MemoryStats {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// A point-in-time copy of every counter, sorted by key for stable logging.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self
            .counters
            .lock()
            .map(|c| c.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        entries.sort();
        entries
    }
}

impl StatsSink for MemoryStats {
    fn incr(&self, key: &str, n: u64) {
        // A poisoned lock only loses the measurement, never the connection.
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(key.to_string()).or_insert(0) += n;
        }
    }
}
