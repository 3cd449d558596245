//! In-flight request tracking.
//!
//! Every probe is held here from just before it is written until either a
//! reply or the reaper removes it. Removal goes through a single lock so a
//! request is handed out at most once. A request still being written is
//! never reaped.

use super::RegisterError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightRequest {
    pub sequence: u16,
    pub target: IpAddr,
    /// Identifier stamped in the echo request.
    pub identifier: u16,
    pub sent_at: Instant,
}

impl InFlightRequest {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.sent_at)
    }
}

#[derive(Debug)]
struct Entry {
    request: InFlightRequest,
    /// False until the write went through.
    on_wire: bool,
}

#[derive(Debug, Default)]
pub struct RequestState {
    next: AtomicU16,
    ongoing: Mutex<BTreeMap<u16, Entry>>,
}

impl RequestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start issuing sequence numbers from `sequence` instead of 0.
    pub fn starting_at(sequence: u16) -> Self {
        Self {
            next: AtomicU16::new(sequence),
            ongoing: Mutex::new(BTreeMap::new()),
        }
    }

    /// Issue the next sequence number, wrapping after `u16::MAX`.
    pub fn next_sequence(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a request that is already on the wire.
    pub fn register(&self, request: InFlightRequest) -> Result<(), RegisterError> {
        self.insert(request, true)
    }

    /// Track a request about to be written. Replies can resolve it right
    /// away, but it only expires once [`confirm`](Self::confirm)ed.
    pub fn reserve(&self, request: InFlightRequest) -> Result<(), RegisterError> {
        self.insert(request, false)
    }

    /// Mark a reserved request as written. Returns false when it is already
    /// gone, answered before the write returned.
    pub fn confirm(&self, sequence: u16) -> bool {
        match self.ongoing.lock().get_mut(&sequence) {
            Some(entry) => {
                entry.on_wire = true;
                true
            }
            None => false,
        }
    }

    fn insert(&self, request: InFlightRequest, on_wire: bool) -> Result<(), RegisterError> {
        let mut ongoing = self.ongoing.lock();
        if let Some(holder) = ongoing.get(&request.sequence) {
            return Err(RegisterError::Occupied {
                sequence: request.sequence,
                holder: holder.request.target,
            });
        }
        ongoing.insert(request.sequence, Entry { request, on_wire });
        Ok(())
    }

    pub fn resolve(&self, sequence: u16) -> Option<InFlightRequest> {
        self.ongoing.lock().remove(&sequence).map(|entry| entry.request)
    }

    /// Remove every written request at least `timeout` old at `now`.
    pub fn sweep_expired(&self, timeout: Duration, now: Instant) -> Vec<InFlightRequest> {
        let mut ongoing = self.ongoing.lock();
        let lost: Vec<u16> = ongoing
            .values()
            .filter(|entry| entry.on_wire && entry.request.age(now) >= timeout)
            .map(|entry| entry.request.sequence)
            .collect();
        lost.into_iter()
            .filter_map(|sequence| ongoing.remove(&sequence))
            .map(|entry| entry.request)
            .collect()
    }

    pub fn contains(&self, sequence: u16) -> bool {
        self.ongoing.lock().contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.ongoing.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ongoing.lock().is_empty()
    }
}
