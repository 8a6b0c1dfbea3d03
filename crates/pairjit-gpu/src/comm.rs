//! In-process rank group.
//!
//! Ranks are threads of one process sharing a barrier and a broadcast slot.
//! Used to run several sub-domains on one node and to exercise the
//! autotuner's cross-rank agreement without an MPI launcher.

use pairjit_core::Communicator;
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};

struct GroupState {
    size: usize,
    barrier: Barrier,
    slot: Mutex<u32>,
}

/// One rank's handle to an in-process group.
#[derive(Clone)]
pub struct LocalGroup {
    state: Arc<GroupState>,
    rank: usize,
}

impl LocalGroup {
    /// Create `size` connected handles, one per rank, in rank order.
    pub fn new(size: usize) -> Vec<LocalGroup> {
        let size = size.max(1);
        let state = Arc::new(GroupState {
            size,
            barrier: Barrier::new(size),
            slot: Mutex::new(0),
        });
        (0..size)
            .map(|rank| LocalGroup {
                state: state.clone(),
                rank,
            })
            .collect()
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.state.size)
            .finish()
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.size
    }

    fn broadcast_u32(&self, value: u32, root: usize) -> u32 {
        if self.rank == root {
            *self.state.slot.lock() = value;
        }
        self.state.barrier.wait();
        let agreed = *self.state.slot.lock();
        // Nobody may overwrite the slot until every rank has read it.
        self.state.barrier.wait();
        agreed
    }
}
