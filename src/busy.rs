//! In-flight request accounting per backend.
//!
//! A backend is "busy" with one request in flight and "full" once it reaches
//! its configured concurrency limit. Entries are removed outright when the
//! count returns to zero, so the busy query stays proportional to active
//! backends rather than fleet size.

use crate::fleet::BackendId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct BusyTracker {
    in_flight: Mutex<HashMap<BackendId, u32>>,
}

impl BusyTracker {
    pub fn mark_start(&self, id: BackendId) {
        let mut in_flight = self.in_flight.lock().expect("busy tracker poisoned");
        *in_flight.entry(id).or_insert(0) += 1;
    }

    /// Decrement, removing the entry at zero. Untracked ids are a no-op so
    /// mismatched start/end pairs from error paths can never go negative.
    pub fn mark_end(&self, id: BackendId) {
        let mut in_flight = self.in_flight.lock().expect("busy tracker poisoned");
        match in_flight.get_mut(&id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                in_flight.remove(&id);
            }
            None => {}
        }
    }

    pub fn busy_backend_ids(&self) -> Vec<BackendId> {
        let in_flight = self.in_flight.lock().expect("busy tracker poisoned");
        in_flight.keys().copied().collect()
    }

    pub fn in_flight(&self, id: BackendId) -> u32 {
        let in_flight = self.in_flight.lock().expect("busy tracker poisoned");
        in_flight.get(&id).copied().unwrap_or(0)
    }

    /// Backends at or above their concurrency limit. Ids absent from `limits`
    /// default to a limit of 1, so any in-flight request makes them full.
    pub fn full_backend_ids(&self, limits: &HashMap<BackendId, u32>) -> Vec<BackendId> {
        let in_flight = self.in_flight.lock().expect("busy tracker poisoned");
        in_flight
            .iter()
            .filter(|(id, count)| **count >= limits.get(id).copied().unwrap_or(1))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// RAII slot on a backend: taken just before a forward, released on drop.
/// Travels inside the streamed response body so the slot is held until the
/// last byte is sent, the stream errors, or the client disconnects.
#[derive(Debug)]
pub struct BusyGuard {
    tracker: Arc<BusyTracker>,
    id: BackendId,
}

impl BusyGuard {
    pub fn acquire(tracker: Arc<BusyTracker>, id: BackendId) -> Self {
        tracker.mark_start(id);
        Self { tracker, id }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.tracker.mark_end(self.id);
    }
}
