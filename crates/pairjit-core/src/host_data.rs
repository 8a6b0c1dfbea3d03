//! Plain host-memory collaborators.
//!
//! `HostParticleData` stores particle arrays in `Vec`s and
//! `BruteForceNeighborList` builds an O(N²) list with a skin buffer. Both are
//! enough to drive the dispatcher in tests, benchmarks and small systems.

use crate::errors::{PairJitError, Result};
use crate::traits::{NeighborList, ParticleData, StorageMode};
use crate::types::{ParticleFlags, Quat, SimBox};

/// Particle arrays held in host memory.
#[derive(Debug, Clone)]
pub struct HostParticleData {
    pub positions: Vec<[f32; 3]>,
    pub velocities: Vec<[f32; 3]>,
    pub tags: Vec<u32>,
    pub types: Vec<u32>,
    pub orientations: Option<Vec<Quat>>,
    pub sim_box: SimBox,
    pub n_types: usize,
    pub flags: ParticleFlags,
}

impl HostParticleData {
    /// Particles at rest, tagged in insertion order.
    pub fn new(sim_box: SimBox, n_types: usize) -> Self {
        Self {
            positions: Vec::new(),
            velocities: Vec::new(),
            tags: Vec::new(),
            types: Vec::new(),
            orientations: None,
            sim_box,
            n_types,
            flags: ParticleFlags::default(),
        }
    }

    /// Append a particle and return its local index.
    pub fn push(&mut self, position: [f32; 3], type_id: u32) -> usize {
        let idx = self.positions.len();
        self.positions.push(position);
        self.velocities.push([0.0; 3]);
        self.tags.push(idx as u32);
        self.types.push(type_id);
        if let Some(orientations) = self.orientations.as_mut() {
            orientations.push(Quat::identity());
        }
        idx
    }

    pub fn with_flags(mut self, flags: ParticleFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the orientation of one body, allocating the array on first use.
    pub fn set_orientation(&mut self, idx: usize, q: Quat) {
        let n = self.positions.len();
        let orientations = self
            .orientations
            .get_or_insert_with(|| vec![Quat::identity(); n]);
        orientations[idx] = q;
    }

    /// Check that all per-particle arrays agree in length and types are known.
    pub fn validate(&self) -> Result<()> {
        let n = self.positions.len();
        if self.velocities.len() != n || self.tags.len() != n || self.types.len() != n {
            return Err(PairJitError::config("particle arrays differ in length"));
        }
        if let Some(o) = &self.orientations {
            if o.len() != n {
                return Err(PairJitError::config("orientation array differs in length"));
            }
        }
        if let Some(t) = self.types.iter().find(|&&t| t as usize >= self.n_types) {
            return Err(PairJitError::config(format!(
                "particle type {} out of range ({} types)",
                t, self.n_types
            )));
        }
        Ok(())
    }
}

impl ParticleData for HostParticleData {
    fn n(&self) -> usize {
        self.positions.len()
    }

    fn n_types(&self) -> usize {
        self.n_types
    }

    fn positions(&self) -> &[[f32; 3]] {
        &self.positions
    }

    fn velocities(&self) -> &[[f32; 3]] {
        &self.velocities
    }

    fn tags(&self) -> &[u32] {
        &self.tags
    }

    fn types(&self) -> &[u32] {
        &self.types
    }

    fn orientations(&self) -> Option<&[Quat]> {
        self.orientations.as_deref()
    }

    fn sim_box(&self) -> SimBox {
        self.sim_box
    }

    fn flags(&self) -> ParticleFlags {
        self.flags
    }
}

/// All-pairs neighbor list with a Verlet skin.
///
/// Rebuilds when any particle has moved more than half the skin since the
/// last build, or when the particle count changes.
#[derive(Debug, Clone)]
pub struct BruteForceNeighborList {
    r_cut: f32,
    r_skin: f32,
    mode: StorageMode,
    n_neigh: Vec<u32>,
    nlist: Vec<u32>,
    head_list: Vec<usize>,
    ref_positions: Vec<[f32; 3]>,
    last_timestep: Option<u64>,
    builds: u64,
}

impl BruteForceNeighborList {
    pub fn new(r_cut: f32, r_skin: f32, mode: StorageMode) -> Self {
        Self {
            r_cut,
            r_skin,
            mode,
            n_neigh: Vec::new(),
            nlist: Vec::new(),
            head_list: Vec::new(),
            ref_positions: Vec::new(),
            last_timestep: None,
            builds: 0,
        }
    }

    /// Number of full rebuilds so far.
    pub fn builds(&self) -> u64 {
        self.builds
    }

    pub fn set_storage_mode(&mut self, mode: StorageMode) {
        if mode != self.mode {
            self.mode = mode;
            self.ref_positions.clear();
        }
    }

    fn needs_rebuild(&self, particles: &dyn ParticleData) -> bool {
        let positions = particles.positions();
        if positions.len() != self.ref_positions.len() || self.builds == 0 {
            return true;
        }
        let sim_box = particles.sim_box();
        let limit_sq = (0.5 * self.r_skin) * (0.5 * self.r_skin);
        positions.iter().zip(&self.ref_positions).any(|(p, r)| {
            let d = sim_box.min_image([p[0] - r[0], p[1] - r[1], p[2] - r[2]]);
            d[0] * d[0] + d[1] * d[1] + d[2] * d[2] > limit_sq
        })
    }

    fn rebuild(&mut self, particles: &dyn ParticleData) {
        let positions = particles.positions();
        let sim_box = particles.sim_box();
        let n = positions.len();
        let r_list = self.r_cut + self.r_skin;
        let r_list_sq = r_list * r_list;

        self.n_neigh.clear();
        self.nlist.clear();
        self.head_list.clear();

        for i in 0..n {
            self.head_list.push(self.nlist.len());
            let start = self.nlist.len();
            for j in 0..n {
                if i == j || (self.mode == StorageMode::Half && j < i) {
                    continue;
                }
                let d = sim_box.min_image([
                    positions[j][0] - positions[i][0],
                    positions[j][1] - positions[i][1],
                    positions[j][2] - positions[i][2],
                ]);
                if d[0] * d[0] + d[1] * d[1] + d[2] * d[2] < r_list_sq {
                    self.nlist.push(j as u32);
                }
            }
            self.n_neigh.push((self.nlist.len() - start) as u32);
        }

        self.ref_positions = positions.to_vec();
        self.builds += 1;
        log::debug!(
            "Neighbor list rebuilt: {} particles, {} entries ({:?})",
            n,
            self.nlist.len(),
            self.mode
        );
    }
}

impl NeighborList for BruteForceNeighborList {
    fn compute(&mut self, timestep: u64, particles: &dyn ParticleData) -> Result<()> {
        if self.last_timestep == Some(timestep) && !self.ref_positions.is_empty() {
            return Ok(());
        }
        self.last_timestep = Some(timestep);
        if self.needs_rebuild(particles) {
            self.rebuild(particles);
        }
        Ok(())
    }

    fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    fn n_neigh(&self) -> &[u32] {
        &self.n_neigh
    }

    fn nlist(&self) -> &[u32] {
        &self.nlist
    }

    fn head_list(&self) -> &[usize] {
        &self.head_list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_of_three() -> HostParticleData {
        let mut p = HostParticleData::new(SimBox::cube(20.0), 1);
        p.push([0.0, 0.0, 0.0], 0);
        p.push([1.0, 0.0, 0.0], 0);
        p.push([2.0, 0.0, 0.0], 0);
        p
    }

    #[test]
    fn test_full_list_is_symmetric() {
        let p = line_of_three();
        let mut nl = BruteForceNeighborList::new(1.5, 0.0, StorageMode::Full);
        nl.compute(0, &p).unwrap();
        assert_eq!(nl.n_neigh(), &[1, 2, 1]);
        let neigh = |i: usize| {
            let h = nl.head_list()[i];
            nl.nlist()[h..h + nl.n_neigh()[i] as usize].to_vec()
        };
        assert_eq!(neigh(0), vec![1]);
        assert_eq!(neigh(1), vec![0, 2]);
        assert_eq!(neigh(2), vec![1]);
    }

    #[test]
    fn test_half_list_counts_each_pair_once() {
        let p = line_of_three();
        let mut nl = BruteForceNeighborList::new(1.5, 0.0, StorageMode::Half);
        nl.compute(0, &p).unwrap();
        assert_eq!(nl.n_neigh().iter().sum::<u32>(), 2);
    }

    #[test]
    fn test_skin_avoids_rebuild() {
        let mut p = line_of_three();
        let mut nl = BruteForceNeighborList::new(1.5, 0.4, StorageMode::Full);
        nl.compute(0, &p).unwrap();
        p.positions[0][0] += 0.1;
        nl.compute(1, &p).unwrap();
        assert_eq!(nl.builds(), 1);
        p.positions[0][0] += 0.5;
        nl.compute(2, &p).unwrap();
        assert_eq!(nl.builds(), 2);
    }

    #[test]
    fn test_validate_catches_bad_type() {
        let mut p = line_of_three();
        p.types[1] = 4;
        assert!(p.validate().is_err());
    }
}
