//! Per-backend-port connection counters.
//!
//! Admission control on the control listener is a compare-and-swap reserve:
//! a slot is taken before the backend dial and handed to the splice as a
//! guard, so a port's count can never exceed its configured maximum and is
//! released exactly once however the relay ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

/// Active-connection counts keyed by backend port.
pub struct ConnectionCounters {
    cells: RwLock<HashMap<u16, Arc<AtomicU32>>>,
}

impl ConnectionCounters {
    pub fn new() -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
        }
    }

    async fn cell(&self, port: u16) -> Arc<AtomicU32> {
        // Fast path: read lock
        {
            let cells = self.cells.read().await;
            if let Some(cell) = cells.get(&port) {
                return Arc::clone(cell);
            }
        }

        // Slow path: write lock
        let mut cells = self.cells.write().await;
        Arc::clone(cells.entry(port).or_default())
    }

    /// Current active-connection count for a port.
    pub async fn get(&self, port: u16) -> u32 {
        let cells = self.cells.read().await;
        cells
            .get(&port)
            .map(|cell| cell.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Reserve a slot if the port is below `max`.
    ///
    /// CAS loop: concurrent admits on the same port cannot push the count
    /// past the maximum. `max == 0` never admits.
    pub async fn try_admit(&self, port: u16, max: u32) -> Option<CounterGuard> {
        let cell = self.cell(port).await;
        let mut current = cell.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match cell.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(CounterGuard { cell }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Take a slot unconditionally (splices that are not admission-checked).
    pub async fn acquire(&self, port: u16) -> CounterGuard {
        let cell = self.cell(port).await;
        cell.fetch_add(1, Ordering::AcqRel);
        CounterGuard { cell }
    }
}

impl Default for ConnectionCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// A held connection slot; releases its count exactly once on drop.
pub struct CounterGuard {
    cell: Arc<AtomicU32>,
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        let previous = self.cell.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "connection counter underflow");
    }
}
