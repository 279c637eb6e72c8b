//! Bookkeeping for relayed flows.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Dialing,
    Active,
    Closing,
}

#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub protocol: Protocol,
    pub client: SocketAddr,
    pub target: String,
    pub remote: Option<SocketAddr>,
    pub state: FlowState,
    pub started: Instant,
}

#[derive(Debug, Default)]
pub struct FlowTracker {
    flows: DashMap<u64, FlowRecord>,
    next_id: AtomicU64,
}

impl FlowTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(self: &Arc<Self>, protocol: Protocol, client: SocketAddr, target: impl Into<String>) -> FlowHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.flows.insert(
            id,
            FlowRecord {
                protocol,
                client,
                target: target.into(),
                remote: None,
                state: FlowState::Dialing,
                started: Instant::now(),
            },
        );
        FlowHandle {
            tracker: Arc::clone(self),
            id,
        }
    }

    /// Flows that have not been torn down, including ones still dialing.
    pub fn active(&self) -> usize {
        self.flows.len()
    }

    pub fn snapshot(&self) -> Vec<FlowRecord> {
        self.flows.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Keeps a flow registered until dropped.
#[derive(Debug)]
pub struct FlowHandle {
    tracker: Arc<FlowTracker>,
    id: u64,
}

impl FlowHandle {
    pub fn activate(&self, remote: SocketAddr) {
        if let Some(mut record) = self.tracker.flows.get_mut(&self.id) {
            record.remote = Some(remote);
            record.state = FlowState::Active;
        }
    }

    pub fn closing(&self) {
        if let Some(mut record) = self.tracker.flows.get_mut(&self.id) {
            record.state = FlowState::Closing;
        }
    }

    pub fn state(&self) -> Option<FlowState> {
        self.tracker.flows.get(&self.id).map(|record| record.state)
    }
}

impl Drop for FlowHandle {
    fn drop(&mut self) {
        self.tracker.flows.remove(&self.id);
    }
}
