//! Host backend: compiles kernel source to stack programs and runs them on
//! the rayon pool.
//!
//! The launch mirrors the device thread layout so every tuning key changes
//! how work is split and reduced, not what is computed:
//!
//! ```text
//! block b ── particles [b*ppb, (b+1)*ppb)        ppb = block / (lanes * eval)
//!   particle i ── neighbor k → lane k % lanes     reduced pairwise in tree order
//!     union pair ── constituent pair c → lane c % eval_threads
//! ```
//!
//! Results are staged by `launch` and only become visible in the caller's
//! buffers at `synchronize`, the same contract as an asynchronous device.

use super::program::{compile_kernel, fold_const, EvalFault, PairInputs, Program, Scratch};
use super::syntax::{parse, Diagnostic, KernelDef, Span};
use super::{
    AuxLibrary, CompileOptions, DeviceProperties, KernelFactory, LaunchStats, ModuleInfo,
    PairKernelArgs, ParamAddress, ParamArray,
};
use crate::autotuner::{HostTimer, KernelTimer};
use crate::shapes::CompositeShapeIndex;
use pairjit_core::{
    CompilerConfig, ForceBuffers, LaunchParams, PairJitError, Quat, Result, Scalar4, Vec3, VIRIAL_COMPONENTS,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;

const SOURCE_UNIT: &str = "<source>";
const OPTIONS_UNIT: &str = "<options>";

/// Launch queue of the host backend. Launches run to completion on the
/// calling thread, so the queue carries no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostStream;

#[derive(Debug, Clone)]
struct Fault {
    kernel: String,
    message: String,
}

impl Fault {
    fn new(kernel: &str, message: impl Into<String>) -> Self {
        Self {
            kernel: kernel.to_string(),
            message: message.into(),
        }
    }

    fn eval(kernel: &str, fault: EvalFault) -> Self {
        Self::new(kernel, fault.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Accum {
    force: [f32; 3],
    energy: f32,
    virial: [f32; VIRIAL_COMPONENTS],
}

impl Accum {
    /// Add one pair term: `force` on this particle, `arm` the separation it
    /// acts across.
    #[inline]
    fn add_pair(&mut self, arm: &[f32; 3], force: &[f32; 3], energy: f32, pressure: bool) {
        for a in 0..3 {
            self.force[a] += force[a];
        }
        self.energy += 0.5 * energy;
        if pressure {
            self.virial[0] += 0.5 * arm[0] * force[0];
            self.virial[1] += 0.5 * arm[0] * force[1];
            self.virial[2] += 0.5 * arm[0] * force[2];
            self.virial[3] += 0.5 * arm[1] * force[1];
            self.virial[4] += 0.5 * arm[1] * force[2];
            self.virial[5] += 0.5 * arm[2] * force[2];
        }
    }

    #[inline]
    fn merge(&mut self, other: &Accum) {
        for a in 0..3 {
            self.force[a] += other.force[a];
        }
        self.energy += other.energy;
        for c in 0..VIRIAL_COMPONENTS {
            self.virial[c] += other.virial[c];
        }
    }
}

/// Pairwise reduction of lane partial sums, halving the active width each
/// round like a warp shuffle reduction.
fn tree_reduce(lanes: &mut [Accum]) -> Accum {
    let mut width = lanes.len();
    while width > 1 {
        let half = width.div_ceil(2);
        for l in 0..(width - half) {
            let other = lanes[l + half];
            lanes[l].merge(&other);
        }
        width = half;
    }
    lanes.first().copied().unwrap_or_default()
}

/// Uniform value in [-1, 1] shared by both listings of a pair.
fn pair_uniform(
    seed: u64,
    timestep: u64,
    tag_i: u32,
    tag_j: u32,
    sub: Option<(usize, usize)>,
) -> f32 {
    let (lo, hi, sub) = if tag_i <= tag_j {
        (tag_i, tag_j, sub)
    } else {
        (tag_j, tag_i, sub.map(|(a, b)| (b, a)))
    };
    let mut key = seed ^ timestep.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    key ^= (((lo as u64) << 32) | hi as u64).rotate_left(29);
    if let Some((a, b)) = sub {
        key ^= (((a as u64) << 32) | b as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    }
    StdRng::seed_from_u64(key).gen_range(-1.0f32..=1.0)
}

#[inline]
fn wxyz(q: &Quat) -> [f32; 4] {
    [q.w, q.i, q.j, q.k]
}

struct Worker {
    scratch: Scratch,
    lanes: Vec<Accum>,
    sub: Vec<Accum>,
}

struct BlockResult {
    accums: Vec<Accum>,
    stats: LaunchStats,
    fault: Option<Fault>,
}

struct UnionStage<'a> {
    program: &'a Program,
    externs: &'a [&'a [f32]],
    shapes: &'a CompositeShapeIndex,
}

struct LaunchCtx<'a> {
    args: PairKernelArgs<'a>,
    pair: &'a Program,
    pair_externs: &'a [&'a [f32]],
    union: Option<UnionStage<'a>>,
}

impl<'a> LaunchCtx<'a> {
    #[inline]
    fn orientation(&self, i: usize) -> Quat {
        self.args
            .orientations
            .map(|o| o[i])
            .unwrap_or_else(Quat::identity)
    }

    fn particle(
        &self,
        i: usize,
        worker: &mut Worker,
        stats: &mut LaunchStats,
    ) -> std::result::Result<Accum, Fault> {
        let a = &self.args;
        let n = a.n();
        let pressure = a.flags.pressure_tensor;
        let head = a.head_list[i];
        let count = a.n_neigh[i] as usize;
        let pos_i = a.positions[i];
        let vel_i = a.velocities[i];
        let ti = a.types[i];
        let n_lanes = worker.lanes.len();
        worker.lanes.fill(Accum::default());

        for k in 0..count {
            let j = *a.nlist.get(head + k).ok_or_else(|| {
                Fault::new(
                    self.pair.name(),
                    format!("neighbor list of particle {} runs past the end of the list", i),
                )
            })? as usize;
            if j >= n {
                return Err(Fault::new(
                    self.pair.name(),
                    format!(
                        "neighbor index {} of particle {} out of range ({} particles)",
                        j, i, n
                    ),
                ));
            }

            let pos_j = a.positions[j];
            let dx = a.sim_box.min_image([
                pos_i[0] - pos_j[0],
                pos_i[1] - pos_j[1],
                pos_i[2] - pos_j[2],
            ]);
            let rsq = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2];
            let tj = a.types[j];
            let rcutsq = a.cutoffs.rcutsq(ti as usize, tj as usize);
            let in_pair = rsq < rcutsq;
            // Constituents reach past the centre cutoff by up to both extents.
            let union = self.union.as_ref().filter(|stage| {
                stage
                    .shapes
                    .union_range(ti as usize, tj as usize)
                    .is_some_and(|range| rsq <= range * range)
            });
            if !in_pair && union.is_none() {
                continue;
            }
            stats.pairs += 1;

            let vel_j = a.velocities[j];
            let dvdr = dx[0] * (vel_i[0] - vel_j[0])
                + dx[1] * (vel_i[1] - vel_j[1])
                + dx[2] * (vel_i[2] - vel_j[2]);
            if in_pair {
                let mut inputs = PairInputs {
                    r: rsq.sqrt(),
                    rsq,
                    rcut: rcutsq.sqrt(),
                    dx,
                    dvdr,
                    type_i: ti,
                    type_j: tj,
                    orientation: [wxyz(&self.orientation(i)), wxyz(&self.orientation(j))],
                    timestep: a.timestep,
                    ..Default::default()
                };
                if self.pair.uses_rand() {
                    inputs.rand = pair_uniform(a.seed, a.timestep, a.tags[i], a.tags[j], None);
                }
                let res = self
                    .pair
                    .eval(&inputs, self.pair_externs, &mut worker.scratch)
                    .map_err(|f| Fault::eval(self.pair.name(), f))?;
                let f = [
                    dx[0] * res.force_divr,
                    dx[1] * res.force_divr,
                    dx[2] * res.force_divr,
                ];
                worker.lanes[k % n_lanes].add_pair(&dx, &f, res.energy, pressure);
            }

            if let Some(stage) = union {
                let u = self.union_pair(stage, i, j, &dx, dvdr, worker, stats)?;
                worker.lanes[k % n_lanes].merge(&u);
            }
        }
        Ok(tree_reduce(&mut worker.lanes))
    }

    /// Sum of constituent terms between bodies `i` and `j`; `dx` is `r_i - r_j`.
    #[allow(clippy::too_many_arguments)]
    fn union_pair(
        &self,
        stage: &UnionStage<'_>,
        i: usize,
        j: usize,
        dx: &[f32; 3],
        dvdr: f32,
        worker: &mut Worker,
        stats: &mut LaunchStats,
    ) -> std::result::Result<Accum, Fault> {
        let a = &self.args;
        let (view_i, view_j) = match (
            stage.shapes.index(a.types[i] as usize),
            stage.shapes.index(a.types[j] as usize),
        ) {
            (Ok(vi), Ok(vj)) => (vi, vj),
            _ => return Ok(Accum::default()),
        };
        let q_i = self.orientation(i);
        let q_j = self.orientation(j);
        let rij = Vec3::new(-dx[0], -dx[1], -dx[2]);
        let pressure = a.flags.pressure_tensor;
        let rcut = stage.shapes.r_cut_constituent();
        let program = stage.program;
        let n_sub = worker.sub.len();
        worker.sub.fill(Accum::default());

        let Worker { scratch, sub, .. } = worker;
        let mut c = 0usize;
        let mut fault = None;
        let counts = view_i.for_each_near_pair(&view_j, &q_i, &q_j, &rij, |ca, cb, d| {
            if fault.is_some() {
                return;
            }
            let ci = view_i.constituents;
            let cj = view_j.constituents;
            let dxc = [-d.x, -d.y, -d.z];
            let rsq = d.norm_squared();
            let mut inputs = PairInputs {
                r: rsq.sqrt(),
                rsq,
                rcut,
                dx: dxc,
                dvdr,
                type_i: ci.typeids[ca],
                type_j: cj.typeids[cb],
                charge: [ci.charges[ca], cj.charges[cb]],
                diameter: [ci.diameters[ca], cj.diameters[cb]],
                orientation: [
                    wxyz(&(q_i * ci.orientations[ca])),
                    wxyz(&(q_j * cj.orientations[cb])),
                ],
                timestep: a.timestep,
                rand: 0.0,
            };
            if program.uses_rand() {
                inputs.rand =
                    pair_uniform(a.seed, a.timestep, a.tags[i], a.tags[j], Some((ca, cb)));
            }
            match program.eval(&inputs, stage.externs, scratch) {
                Ok(res) => {
                    let f = [
                        dxc[0] * res.force_divr,
                        dxc[1] * res.force_divr,
                        dxc[2] * res.force_divr,
                    ];
                    sub[c % n_sub].add_pair(dx, &f, res.energy, pressure);
                    c += 1;
                }
                Err(e) => fault = Some(Fault::eval(program.name(), e)),
            }
        });
        stats.constituents += counts;
        match fault {
            Some(f) => Err(f),
            None => Ok(tree_reduce(sub)),
        }
    }
}

struct Staged {
    force: Vec<Scalar4>,
    virial: Vec<[f32; VIRIAL_COMPONENTS]>,
    stats: LaunchStats,
}

/// Kernel factory evaluating compiled programs on the host.
pub struct HostKernelFactory {
    info: ModuleInfo,
    pair: Program,
    union: Option<Program>,
    launch_bounds: Vec<u32>,
    bindings: HashMap<String, ParamArray>,
    staged: Option<Staged>,
    fault: Option<Fault>,
    device: DeviceProperties,
}

impl std::fmt::Debug for HostKernelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKernelFactory")
            .field("entry", &self.info.entry)
            .field("union_entry", &self.info.union_entry)
            .field("launch_bounds", &self.launch_bounds)
            .field("bound", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn compile_error(symbol: &str, diagnostics: &[Diagnostic]) -> PairJitError {
    let log = diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("\n");
    PairJitError::compilation(symbol, log)
}

impl HostKernelFactory {
    /// Compile and link `source` with `libraries`.
    ///
    /// `target_arch` only matters to device backends and is recorded in the
    /// module log.
    pub fn new(
        source: &str,
        entry: &str,
        options: &[String],
        libraries: &[AuxLibrary],
        target_arch: u32,
    ) -> Result<Self> {
        let opts = CompileOptions::parse(options)?;
        for p in &opts.passthrough {
            log::debug!("Host compiler ignores option '{}'", p);
        }

        let mut units = Vec::with_capacity(libraries.len() + 1);
        let mut diagnostics = Vec::new();
        match parse(SOURCE_UNIT, source) {
            Ok(u) => units.push(u),
            Err(d) => diagnostics.push(d),
        }
        for lib in libraries {
            let (name, text) = lib.load()?;
            match parse(&name, &text) {
                Ok(u) => units.push(u),
                Err(d) => diagnostics.push(d),
            }
        }
        if !diagnostics.is_empty() {
            return Err(compile_error(entry, &diagnostics));
        }

        // Link: defines first, then constants and kernels of every unit in order.
        let mut consts: HashMap<String, f32> = HashMap::new();
        for (name, value) in &opts.defines {
            match value.parse::<f32>() {
                Ok(v) => {
                    consts.insert(name.clone(), v);
                }
                Err(_) => diagnostics.push(Diagnostic::new(
                    OPTIONS_UNIT,
                    Span::default(),
                    format!("define '{}' has non-numeric value '{}'", name, value),
                )),
            }
        }
        let mut const_origin: HashMap<&str, &str> = HashMap::new();
        for unit in &units {
            for c in &unit.consts {
                if let Some(first) = const_origin.get(c.name.as_str()) {
                    diagnostics.push(Diagnostic::new(
                        &unit.name,
                        c.span,
                        format!("duplicate symbol '{}' (first defined in {})", c.name, first),
                    ));
                    continue;
                }
                const_origin.insert(c.name.as_str(), unit.name.as_str());
                if opts.defines.iter().any(|(d, _)| d == &c.name) {
                    continue;
                }
                match fold_const(&unit.name, &c.value, &consts) {
                    Ok(v) => {
                        consts.insert(c.name.clone(), v);
                    }
                    Err(d) => diagnostics.push(d),
                }
            }
        }

        let mut kernels: HashMap<&str, (&str, &KernelDef)> = HashMap::new();
        for unit in &units {
            for k in &unit.kernels {
                if let Some((first, _)) = kernels.get(k.name.as_str()) {
                    diagnostics.push(Diagnostic::new(
                        &unit.name,
                        k.span,
                        format!("duplicate symbol '{}' (first defined in {})", k.name, first),
                    ));
                } else {
                    kernels.insert(k.name.as_str(), (unit.name.as_str(), k));
                }
            }
        }

        let mut programs: HashMap<&str, Program> = HashMap::new();
        for unit in &units {
            for k in &unit.kernels {
                match compile_kernel(&unit.name, k, &consts) {
                    Ok(p) => {
                        programs.entry(k.name.as_str()).or_insert(p);
                    }
                    Err(mut d) => diagnostics.append(&mut d),
                }
            }
        }
        if !diagnostics.is_empty() {
            return Err(compile_error(entry, &diagnostics));
        }

        let pair = programs
            .remove(entry)
            .ok_or_else(|| PairJitError::symbol(entry))?;
        let union = match &opts.union_kernel {
            Some(name) => Some(
                programs
                    .remove(name.as_str())
                    .ok_or_else(|| PairJitError::symbol(name.as_str()))?,
            ),
            None => None,
        };

        let mut externs: Vec<String> = pair.externs().to_vec();
        if let Some(u) = &union {
            for e in u.externs() {
                if !externs.contains(e) {
                    externs.push(e.clone());
                }
            }
        }

        let log = format!(
            "host module: {} unit(s), {} kernel(s), {} constant(s), target sm_{} ignored",
            units.len(),
            kernels.len(),
            consts.len(),
            target_arch
        );
        log::info!(
            "Compiled kernel '{}'{} ({})",
            entry,
            opts.union_kernel
                .as_ref()
                .map(|u| format!(" with union kernel '{}'", u))
                .unwrap_or_default(),
            log
        );

        Ok(Self {
            info: ModuleInfo {
                entry: entry.to_string(),
                union_entry: opts.union_kernel.clone(),
                externs,
                log,
            },
            pair,
            union,
            launch_bounds: opts.launch_bounds,
            bindings: HashMap::new(),
            staged: None,
            fault: None,
            device: DeviceProperties::default(),
        })
    }

    /// Compile with the options, libraries and launch bounds of `config`.
    pub fn from_config(source: &str, entry: &str, config: &CompilerConfig) -> Result<Self> {
        let options = config.effective_options();
        let libraries: Vec<AuxLibrary> = config
            .libraries
            .iter()
            .cloned()
            .map(AuxLibrary::Path)
            .collect();
        Self::new(source, entry, &options, &libraries, config.target_arch)
    }

    /// Arrays bound to the externs of `program`, in slot order.
    fn bound(&self, program: &Program) -> Result<Vec<ParamArray>> {
        program
            .externs()
            .iter()
            .map(|symbol| {
                self.bindings.get(symbol).cloned().ok_or_else(|| {
                    PairJitError::usage(format!(
                        "parameter symbol '{}' of kernel '{}' was never bound",
                        symbol,
                        program.name()
                    ))
                })
            })
            .collect()
    }
}

impl KernelFactory for HostKernelFactory {
    type Stream = HostStream;

    fn device(&self) -> DeviceProperties {
        self.device
    }

    fn module_info(&self) -> &ModuleInfo {
        &self.info
    }

    fn set_parameter_pointer(&mut self, symbol: &str, address: ParamAddress) -> Result<()> {
        if !self.info.externs.iter().any(|e| e == symbol) {
            return Err(PairJitError::symbol(symbol));
        }
        match address {
            ParamAddress::Host(array) => {
                log::debug!("Bound '{}' ({} values)", symbol, array.read().len());
                self.bindings.insert(symbol.to_string(), array);
                Ok(())
            }
            ParamAddress::Device(ptr) => Err(PairJitError::usage(format!(
                "host backend cannot dereference device address {:#x} for '{}'",
                ptr, symbol
            ))),
        }
    }

    fn launch_bound_candidates(&self) -> &[u32] {
        &self.launch_bounds
    }

    fn launch(
        &mut self,
        params: &LaunchParams,
        args: &PairKernelArgs<'_>,
        _stream: &HostStream,
    ) -> Result<()> {
        args.validate()?;
        if let LaunchParams::NarrowPhase(np) = params {
            if !self.launch_bounds.contains(&np.launch_bound) {
                return Err(PairJitError::usage(format!(
                    "module was not compiled for launch bound {} (have {:?})",
                    np.launch_bound, self.launch_bounds
                )));
            }
        }
        if params.block_size() > self.device.max_threads_per_block {
            return Err(PairJitError::usage(format!(
                "block size {} exceeds the device limit {}",
                params.block_size(),
                self.device.max_threads_per_block
            )));
        }

        let pair_arrays = self.bound(&self.pair)?;
        let union_arrays = match &self.union {
            Some(u) => self.bound(u)?,
            None => Vec::new(),
        };
        let pair_guards: Vec<_> = pair_arrays.iter().map(|a| a.read()).collect();
        let union_guards: Vec<_> = union_arrays.iter().map(|a| a.read()).collect();
        let pair_externs: Vec<&[f32]> = pair_guards.iter().map(|g| g.as_slice()).collect();
        let union_externs: Vec<&[f32]> = union_guards.iter().map(|g| g.as_slice()).collect();

        let union = match (&self.union, args.shapes) {
            (Some(program), Some(shapes)) if shapes.has_constituents() => Some(UnionStage {
                program,
                externs: &union_externs,
                shapes,
            }),
            _ => None,
        };
        let ctx = LaunchCtx {
            args: *args,
            pair: &self.pair,
            pair_externs: &pair_externs,
            union,
        };

        let n = args.n();
        let ppb = params.particles_per_block().max(1) as usize;
        let lanes = params.lanes_per_particle().max(1) as usize;
        let eval_threads = params.eval_threads().max(1) as usize;
        log::trace!(
            "Host launch '{}': {} particles, {} per block, {} lanes, {} eval threads",
            self.info.entry,
            n,
            ppb,
            lanes,
            eval_threads
        );

        let blocks: Vec<BlockResult> = (0..n.div_ceil(ppb))
            .into_par_iter()
            .map_init(
                || Worker {
                    scratch: Scratch::default(),
                    lanes: vec![Accum::default(); lanes],
                    sub: vec![Accum::default(); eval_threads],
                },
                |worker, b| {
                    let start = b * ppb;
                    let end = (start + ppb).min(n);
                    let mut out = BlockResult {
                        accums: Vec::with_capacity(end - start),
                        stats: LaunchStats::default(),
                        fault: None,
                    };
                    for i in start..end {
                        match ctx.particle(i, worker, &mut out.stats) {
                            Ok(acc) => out.accums.push(acc),
                            Err(f) => {
                                out.fault = Some(f);
                                break;
                            }
                        }
                    }
                    out.accums.resize(end - start, Accum::default());
                    out
                },
            )
            .collect();

        let mut staged = Staged {
            force: Vec::with_capacity(n),
            virial: Vec::with_capacity(n),
            stats: LaunchStats::default(),
        };
        for block in blocks {
            for acc in &block.accums {
                staged
                    .force
                    .push([acc.force[0], acc.force[1], acc.force[2], acc.energy]);
                staged.virial.push(acc.virial);
            }
            staged.stats += block.stats;
            if self.fault.is_none() {
                self.fault = block.fault;
            }
        }
        self.staged = Some(staged);
        Ok(())
    }

    fn check_errors(&mut self, _stream: &HostStream) -> Result<()> {
        match self.fault.take() {
            Some(f) => {
                log::warn!("Kernel '{}' faulted: {}", f.kernel, f.message);
                Err(PairJitError::device(f.kernel, f.message))
            }
            None => Ok(()),
        }
    }

    fn synchronize(&mut self, _stream: &HostStream, out: &mut ForceBuffers) -> Result<LaunchStats> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| PairJitError::usage("synchronize called with no launch in flight"))?;
        out.force = staged.force;
        out.virial = staged.virial;
        Ok(staged.stats)
    }

    fn timer(&self, _stream: &HostStream) -> Box<dyn KernelTimer> {
        Box::new(HostTimer::default())
    }
}
