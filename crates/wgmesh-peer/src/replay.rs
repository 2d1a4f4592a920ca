//! Command idempotence cache
//!
//! The first application of a command performs the effect; a replayed
//! command id returns the cached response without re-running the
//! handler. Bounded because retried command ids are always recent.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use wgmesh_proto::CommandResponse;

struct ReplayInner {
    responses: HashMap<u64, CommandResponse>,
    order: VecDeque<u64>,
}

/// Bounded cache of applied (command_id -> response)
pub struct ReplayCache {
    capacity: usize,
    inner: Mutex<ReplayInner>,
}

impl ReplayCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(ReplayInner {
                responses: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Cached response for a command id, if the command was applied
    pub fn get(&self, command_id: u64) -> Option<CommandResponse> {
        self.inner.lock().unwrap().responses.get(&command_id).cloned()
    }

    /// Record an applied command; evicts the oldest entry past capacity
    pub fn insert(&self, command_id: u64, response: CommandResponse) {
        let mut inner = self.inner.lock().unwrap();

        if inner.responses.insert(command_id, response).is_none() {
            inner.order.push_back(command_id);
        }

        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.responses.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(1024)
    }
}
