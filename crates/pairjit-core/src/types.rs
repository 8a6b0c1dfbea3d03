//! Geometry and per-step data types shared by host and device paths.

use crate::errors::{PairJitError, Result};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

pub type Vec3 = Vector3<f32>;
pub type Quat = UnitQuaternion<f32>;

/// Packed `(x, y, z, w)` element, the layout device kernels read and write.
/// Positions carry the particle type in `w`, forces carry the energy.
pub type Scalar4 = [f32; 4];

/// Number of independent virial components (xx, xy, xz, yy, yz, zz).
pub const VIRIAL_COMPONENTS: usize = 6;

/// Orthorhombic simulation box with per-axis periodicity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimBox {
    pub lengths: [f32; 3],
    pub periodic: [bool; 3],
}

impl SimBox {
    /// Fully periodic cube.
    pub fn cube(length: f32) -> Self {
        Self {
            lengths: [length; 3],
            periodic: [true; 3],
        }
    }

    /// Fully periodic orthorhombic box.
    pub fn new(lx: f32, ly: f32, lz: f32) -> Self {
        Self {
            lengths: [lx, ly, lz],
            periodic: [true; 3],
        }
    }

    /// Apply the minimum image convention to a separation vector.
    #[inline]
    pub fn min_image(&self, mut d: [f32; 3]) -> [f32; 3] {
        for axis in 0..3 {
            if self.periodic[axis] && self.lengths[axis] > 0.0 {
                let l = self.lengths[axis];
                d[axis] -= l * (d[axis] / l).round();
            }
        }
        d
    }

    pub fn volume(&self) -> f32 {
        self.lengths.iter().product()
    }
}

/// Derived quantities a step must produce in addition to forces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleFlags {
    /// Accumulate the per-particle virial (pressure tensor)
    pub pressure_tensor: bool,
}

/// Symmetric cutoff table indexed by `(type_i, type_j)`, stored squared.
#[derive(Debug, Clone, PartialEq)]
pub struct CutoffTable {
    n_types: usize,
    rcutsq: Vec<f32>,
}

impl CutoffTable {
    /// Every pair of types shares one cutoff.
    pub fn uniform(n_types: usize, rcut: f32) -> Self {
        Self {
            n_types,
            rcutsq: vec![rcut * rcut; n_types * n_types],
        }
    }

    /// Set the cutoff for a type pair (both orderings).
    pub fn set(&mut self, type_i: usize, type_j: usize, rcut: f32) -> Result<()> {
        if type_i >= self.n_types || type_j >= self.n_types {
            return Err(PairJitError::config(format!(
                "cutoff for types ({}, {}) outside a table of {} types",
                type_i, type_j, self.n_types
            )));
        }
        if !(rcut.is_finite() && rcut >= 0.0) {
            return Err(PairJitError::config(format!(
                "cutoff must be finite and non-negative, got {}",
                rcut
            )));
        }
        let rsq = rcut * rcut;
        self.rcutsq[type_i * self.n_types + type_j] = rsq;
        self.rcutsq[type_j * self.n_types + type_i] = rsq;
        Ok(())
    }

    /// Squared cutoff, zero for unknown types (pair never interacts).
    #[inline]
    pub fn rcutsq(&self, type_i: usize, type_j: usize) -> f32 {
        if type_i >= self.n_types || type_j >= self.n_types {
            return 0.0;
        }
        self.rcutsq[type_i * self.n_types + type_j]
    }

    pub fn n_types(&self) -> usize {
        self.n_types
    }

    /// Raw row-major squared cutoffs, as uploaded to a device.
    pub fn as_slice(&self) -> &[f32] {
        &self.rcutsq
    }
}

/// Output buffers of one force evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForceBuffers {
    /// Per-particle force `(fx, fy, fz, energy)`
    pub force: Vec<Scalar4>,
    /// Per-particle virial, `VIRIAL_COMPONENTS` values each, zero unless requested
    pub virial: Vec<[f32; VIRIAL_COMPONENTS]>,
}

impl ForceBuffers {
    pub fn zeroed(n: usize) -> Self {
        Self {
            force: vec![[0.0; 4]; n],
            virial: vec![[0.0; VIRIAL_COMPONENTS]; n],
        }
    }

    /// Resize to `n` particles and clear.
    pub fn reset(&mut self, n: usize) {
        self.force.clear();
        self.force.resize(n, [0.0; 4]);
        self.virial.clear();
        self.virial.resize(n, [0.0; VIRIAL_COMPONENTS]);
    }

    /// Total potential energy over all particles.
    pub fn total_energy(&self) -> f64 {
        self.force.iter().map(|f| f[3] as f64).sum()
    }

    /// Vector sum of all forces.
    pub fn net_force(&self) -> [f64; 3] {
        self.force.iter().fold([0.0; 3], |mut acc, f| {
            acc[0] += f[0] as f64;
            acc[1] += f[1] as f64;
            acc[2] += f[2] as f64;
            acc
        })
    }
}
