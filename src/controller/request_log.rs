//! Bounded in-memory log of recent request outcomes.
//!
//! Purely observational: never consulted for authorization decisions and
//! never persisted. One entry per (device, network) pair; the slot index
//! is derived from the atomically incremented total-request counter, so
//! last-writer-wins stays well defined under concurrent arrivals.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

use ahash::RandomState;
use papaya::HashMap as PapayaHashMap;

use crate::identity::DeviceAddr;
use crate::store::records::NetworkId;

/// Outcomes retained per (device, network) pair.
pub const REQUEST_LOG_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOutcome {
    pub time: u64,
    pub protocol_version: Option<String>,
    pub from_addr: SocketAddr,
    pub authorized: bool,
}

#[derive(Default)]
struct ActivityEntry {
    total_requests: AtomicU64,
    last_request_time: AtomicU64,
    slots: Mutex<[Option<LogOutcome>; REQUEST_LOG_SIZE]>,
}

/// Cumulative counters plus the retained outcomes, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub total_requests: u64,
    pub last_request_time: u64,
    pub outcomes: Vec<LogOutcome>,
}

#[derive(Default)]
pub struct RequestLog {
    entries: PapayaHashMap<(DeviceAddr, NetworkId), Arc<ActivityEntry>, RandomState>,
}

impl RequestLog {
    pub(crate) fn record(&self, node: DeviceAddr, network_id: NetworkId, outcome: LogOutcome) {
        let guard = self.entries.guard();
        let entry = self
            .entries
            .get_or_insert_with((node, network_id), Default::default, &guard);

        let total = entry.total_requests.fetch_add(1, SeqCst);
        entry.last_request_time.store(outcome.time, SeqCst);
        // map update only, no I/O inside the critical section
        let mut slots = entry.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots[(total % REQUEST_LOG_SIZE as u64) as usize] = Some(outcome);
    }

    pub fn snapshot(&self, node: DeviceAddr, network_id: NetworkId) -> Option<ActivitySnapshot> {
        let guard = self.entries.guard();
        let entry = self.entries.get(&(node, network_id), &guard)?;

        let total_requests = entry.total_requests.load(SeqCst);
        let last_request_time = entry.last_request_time.load(SeqCst);
        let slots = entry.slots.lock().unwrap_or_else(|e| e.into_inner());

        // replay the ring oldest-to-newest
        let mut outcomes = Vec::new();
        let newest = total_requests % REQUEST_LOG_SIZE as u64;
        for i in 0..REQUEST_LOG_SIZE as u64 {
            let idx = ((newest + i) % REQUEST_LOG_SIZE as u64) as usize;
            if let Some(outcome) = &slots[idx] {
                outcomes.push(outcome.clone());
            }
        }

        Some(ActivitySnapshot {
            total_requests,
            last_request_time,
            outcomes,
        })
    }
}
