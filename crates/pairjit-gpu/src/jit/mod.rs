//! Runtime-compiled pair kernels.
//!
//! A [`KernelFactory`] compiles user source once at construction, binds
//! named external parameter arrays, and launches the result for a
//! neighbor-listed pair evaluation. Two backends exist:
//!
//! - [`host::HostKernelFactory`]: compiles a small expression language and
//!   runs it on the rayon pool, emulating the device thread grouping
//! - `cuda::CudaKernelFactory` (feature `cuda`): NVRTC + driver module
//!   loading through cudarc

pub mod host;
pub mod program;
pub mod syntax;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::autotuner::KernelTimer;
use crate::shapes::{CompositeShapeIndex, NarrowPhaseCounts};
use pairjit_core::{
    CutoffTable, ForceBuffers, LaunchParams, PairJitError, ParticleFlags, Quat, Result, SimBox,
};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

/// Launch bounds compiled when the options do not name any.
pub const DEFAULT_LAUNCH_BOUNDS: [u32; 4] = [32, 64, 128, 256];

/// Host-side storage of an external parameter array.
pub type ParamArray = Arc<RwLock<Vec<f32>>>;

/// Address bound to an external parameter symbol.
#[derive(Debug, Clone)]
pub enum ParamAddress {
    /// Host array shared with the caller; the caller may update it between steps
    Host(ParamArray),
    /// Raw device pointer
    Device(u64),
}

impl ParamAddress {
    pub fn host(values: Vec<f32>) -> Self {
        ParamAddress::Host(Arc::new(RwLock::new(values)))
    }
}

/// Extra source linked into the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxLibrary {
    Path(PathBuf),
    Source { name: String, text: String },
}

impl AuxLibrary {
    /// Unit name and contents.
    pub fn load(&self) -> Result<(String, String)> {
        match self {
            AuxLibrary::Path(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok((path.display().to_string(), text))
            }
            AuxLibrary::Source { name, text } => Ok((name.clone(), text.clone())),
        }
    }
}

impl From<PathBuf> for AuxLibrary {
    fn from(path: PathBuf) -> Self {
        AuxLibrary::Path(path)
    }
}

/// Execution-width limits of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Native thread-group width
    pub warp_size: u32,
    pub max_threads_per_block: u32,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            warp_size: 32,
            max_threads_per_block: 1024,
        }
    }
}

/// What a compiled module exports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub entry: String,
    /// Constituent-pair kernel of union bodies
    pub union_entry: Option<String>,
    /// External parameter symbols the kernels dereference
    pub externs: Vec<String>,
    /// Compiler and linker output
    pub log: String,
}

/// Compiler options understood by every backend.
///
/// `-DNAME=value` defines, `--launch-bounds=a,b,c` and `--union-kernel=NAME`
/// are interpreted; everything else is passed through to the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileOptions {
    pub defines: Vec<(String, String)>,
    pub launch_bounds: Vec<u32>,
    pub union_kernel: Option<String>,
    pub passthrough: Vec<String>,
}

impl CompileOptions {
    pub fn parse(options: &[String]) -> Result<Self> {
        let mut parsed = CompileOptions::default();
        for opt in options {
            if let Some(def) = opt.strip_prefix("-D") {
                let (name, value) = def.split_once('=').unwrap_or((def, "1"));
                if name.is_empty() {
                    return Err(PairJitError::compilation(
                        "<options>",
                        format!("malformed define '{}'", opt),
                    ));
                }
                parsed.defines.push((name.to_string(), value.to_string()));
            } else if let Some(list) = opt.strip_prefix("--launch-bounds=") {
                for item in list.split(',').filter(|s| !s.trim().is_empty()) {
                    let lb = item.trim().parse::<u32>().map_err(|_| {
                        PairJitError::compilation(
                            "<options>",
                            format!("invalid launch bound '{}' in '{}'", item, opt),
                        )
                    })?;
                    parsed.launch_bounds.push(lb);
                }
            } else if let Some(name) = opt.strip_prefix("--union-kernel=") {
                parsed.union_kernel = Some(name.to_string());
            } else {
                parsed.passthrough.push(opt.clone());
            }
        }
        if parsed.launch_bounds.is_empty() {
            parsed.launch_bounds = DEFAULT_LAUNCH_BOUNDS.to_vec();
        }
        parsed.launch_bounds.sort_unstable();
        parsed.launch_bounds.dedup();
        Ok(parsed)
    }
}

/// Read views for one launch.
#[derive(Debug, Clone, Copy)]
pub struct PairKernelArgs<'a> {
    pub n_neigh: &'a [u32],
    pub nlist: &'a [u32],
    pub head_list: &'a [usize],
    pub positions: &'a [[f32; 3]],
    pub velocities: &'a [[f32; 3]],
    pub tags: &'a [u32],
    pub types: &'a [u32],
    pub orientations: Option<&'a [Quat]>,
    pub sim_box: SimBox,
    pub cutoffs: &'a CutoffTable,
    pub flags: ParticleFlags,
    pub seed: u64,
    pub timestep: u64,
    /// Constituent geometry for union bodies
    pub shapes: Option<&'a CompositeShapeIndex>,
}

impl<'a> PairKernelArgs<'a> {
    pub fn n(&self) -> usize {
        self.positions.len()
    }

    /// Check that every per-particle array covers all particles.
    pub fn validate(&self) -> Result<()> {
        let n = self.n();
        let short = [
            ("velocities", self.velocities.len()),
            ("tags", self.tags.len()),
            ("types", self.types.len()),
            ("n_neigh", self.n_neigh.len()),
            ("head_list", self.head_list.len()),
        ]
        .into_iter()
        .find(|(_, len)| *len < n);
        if let Some((what, len)) = short {
            return Err(PairJitError::usage(format!(
                "{} has {} entries for {} particles",
                what, len, n
            )));
        }
        if let Some(o) = self.orientations {
            if o.len() < n {
                return Err(PairJitError::usage(format!(
                    "orientations has {} entries for {} particles",
                    o.len(),
                    n
                )));
            }
        }
        Ok(())
    }
}

/// Work counted by one launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchStats {
    /// Particle pairs handed to the entry or union kernel, counted once per listing
    pub pairs: u64,
    pub constituents: NarrowPhaseCounts,
}

impl std::ops::AddAssign for LaunchStats {
    fn add_assign(&mut self, rhs: Self) {
        self.pairs += rhs.pairs;
        self.constituents += rhs.constituents;
    }
}

/// A compiled pair-kernel module.
pub trait KernelFactory: Send {
    /// Ordered execution queue the backend launches on.
    type Stream;

    fn device(&self) -> DeviceProperties;

    fn module_info(&self) -> &ModuleInfo;

    /// Bind `address` to the external parameter `symbol`.
    ///
    /// Fails with a symbol resolution error if the module has no such symbol.
    fn set_parameter_pointer(&mut self, symbol: &str, address: ParamAddress) -> Result<()>;

    /// Block-size upper bounds the module was compiled for, ascending.
    fn launch_bound_candidates(&self) -> &[u32];

    /// Queue the input transfers for the next `launch` of `params` and
    /// `args`, ahead of any timing window. Backends that read inputs in
    /// place do nothing.
    fn stage(
        &mut self,
        _params: &LaunchParams,
        _args: &PairKernelArgs<'_>,
        _stream: &Self::Stream,
    ) -> Result<()> {
        Ok(())
    }

    /// Enqueue the kernel on `stream` and return without waiting. Inputs
    /// not already staged for this launch are transferred first.
    fn launch(
        &mut self,
        params: &LaunchParams,
        args: &PairKernelArgs<'_>,
        stream: &Self::Stream,
    ) -> Result<()>;

    /// Surface a fault raised by work already on `stream`.
    fn check_errors(&mut self, stream: &Self::Stream) -> Result<()>;

    /// Wait for `stream` and write the results of the last launch into `out`.
    fn synchronize(&mut self, stream: &Self::Stream, out: &mut ForceBuffers)
        -> Result<LaunchStats>;

    /// Timer measuring work on `stream`.
    fn timer(&self, stream: &Self::Stream) -> Box<dyn KernelTimer>;
}
