//! Collaborator interfaces consumed by the execution layer.
//!
//! Neighbor lists, particle storage and inter-process communication are
//! owned elsewhere; the dispatcher only talks to them through these traits.

use crate::errors::Result;
use crate::types::{ParticleFlags, Quat, SimBox};

/// How pairs are stored in a neighbor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// Each pair appears once (Newton's third law applied by the consumer)
    Half,
    /// Each pair appears from both particles' perspectives
    Full,
}

/// Neighbor-list collaborator.
///
/// Neighbors of particle `i` are `nlist()[head_list()[i] .. head_list()[i] + n_neigh()[i]]`.
pub trait NeighborList: Send {
    /// Bring the list up to date for `timestep`.
    fn compute(&mut self, timestep: u64, particles: &dyn ParticleData) -> Result<()>;

    fn storage_mode(&self) -> StorageMode;

    /// Per-particle neighbor counts
    fn n_neigh(&self) -> &[u32];

    /// Flattened neighbor indices
    fn nlist(&self) -> &[u32];

    /// Offset of each particle's first neighbor in `nlist()`
    fn head_list(&self) -> &[usize];
}

/// Particle-data collaborator.
pub trait ParticleData: Send + Sync {
    /// Number of local particles
    fn n(&self) -> usize;

    fn n_types(&self) -> usize;

    fn positions(&self) -> &[[f32; 3]];

    fn velocities(&self) -> &[[f32; 3]];

    fn tags(&self) -> &[u32];

    fn types(&self) -> &[u32];

    /// Body orientations; `None` means every body is unrotated.
    fn orientations(&self) -> Option<&[Quat]> {
        None
    }

    fn sim_box(&self) -> SimBox;

    /// Quantities the current step must produce
    fn flags(&self) -> ParticleFlags;
}

/// Collective operations across cooperating ranks.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Every rank passes its local `value`; all ranks return the value of `root`.
    fn broadcast_u32(&self, value: u32, root: usize) -> u32;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Communicator for a run without domain decomposition.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn broadcast_u32(&self, value: u32, _root: usize) -> u32 {
        value
    }
}
