//! One pair-interaction evaluation per step.
//!
//! ```text
//! compute_forces(t)
//!   ├─ neighbor list refresh          (reject half storage, fatal)
//!   ├─ publish changed union shapes
//!   ├─ key = pinned | tuner.param()   → decode → LaunchParams
//!   ├─ stage inputs
//!   ├─ tuner.begin() ─ launch ─ check_errors? ─ tuner.end()
//!   └─ synchronize → ForceBuffers
//! ```

use crate::autotuner::Autotuner;
use crate::jit::{KernelFactory, LaunchStats, PairKernelArgs, ParamAddress};
use crate::shapes::{CompositeShapeIndex, Constituents};
use pairjit_core::{
    Communicator, CutoffTable, EngineConfig, ForceBuffers, KeyScheme, LaunchParams,
    NeighborList, PairJitError, ParticleData, Quat, Result, StorageMode, Vec3,
};
use std::sync::Arc;

/// Drives a compiled pair kernel over the particles of one simulation.
pub struct InteractionDispatcher<F: KernelFactory, N: NeighborList, P: ParticleData> {
    factory: F,
    stream: F::Stream,
    nlist: N,
    particles: P,
    cutoffs: CutoffTable,
    shapes: CompositeShapeIndex,
    tuner: Autotuner,
    scheme: KeyScheme,
    pinned: Option<u32>,
    check_errors: bool,
    seed: u64,
    comm: Option<Arc<dyn Communicator>>,
    sync_ranks: bool,
    forces: ForceBuffers,
    last_stats: LaunchStats,
    launches: u64,
}

impl<F: KernelFactory, N: NeighborList, P: ParticleData> InteractionDispatcher<F, N, P> {
    /// Build a dispatcher whose tuner sweeps every valid key for the
    /// factory's launch bounds.
    ///
    /// The key scheme is narrow-phase when the module exports a union
    /// kernel, pair otherwise, unless `config.dispatch.key_scheme` says
    /// otherwise.
    pub fn new(
        factory: F,
        stream: F::Stream,
        nlist: N,
        particles: P,
        cutoffs: CutoffTable,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let n_types = particles.n_types();
        if cutoffs.n_types() < n_types {
            return Err(PairJitError::config(format!(
                "cutoff table covers {} types, particle data has {}",
                cutoffs.n_types(),
                n_types
            )));
        }

        let info = factory.module_info();
        let scheme = config.dispatch.key_scheme.unwrap_or(if info.union_entry.is_some() {
            KeyScheme::NarrowPhase
        } else {
            KeyScheme::Pair
        });
        let warp_size = factory.device().warp_size;
        let candidates = scheme.candidates(factory.launch_bound_candidates(), warp_size)?;
        let scope = match scheme {
            KeyScheme::Pair => format!("pair_{}", info.entry),
            KeyScheme::NarrowPhase => format!(
                "narrow_{}",
                info.union_entry.as_deref().unwrap_or(&info.entry)
            ),
        };
        log::info!(
            "Dispatcher for '{}': {:?} keys, {} candidates",
            info.entry,
            scheme,
            candidates.len()
        );

        let mut tuner = Autotuner::new(
            candidates,
            config.tuner.warmup_samples,
            config.tuner.period,
            scope,
        )?
        .with_timer(factory.timer(&stream));
        tuner.set_enabled(config.tuner.enabled);

        let shapes = CompositeShapeIndex::from_config(n_types, &config.shapes)?;

        let mut dispatcher = Self {
            factory,
            stream,
            nlist,
            particles,
            cutoffs,
            shapes,
            tuner,
            scheme,
            pinned: None,
            check_errors: config.dispatch.check_errors,
            seed: config.dispatch.seed,
            comm: None,
            sync_ranks: config.tuner.sync_across_ranks,
            forces: ForceBuffers::default(),
            last_stats: LaunchStats::default(),
            launches: 0,
        };
        dispatcher.set_tuning_param(config.dispatch.tuning_param)?;
        Ok(dispatcher)
    }

    /// Evaluate forces, energies and (if requested) virials for `timestep`.
    pub fn compute_forces(&mut self, timestep: u64) -> Result<&ForceBuffers> {
        self.nlist.compute(timestep, &self.particles)?;
        if self.nlist.storage_mode() == StorageMode::Half {
            let entry = &self.factory.module_info().entry;
            log::error!(
                "Kernel '{}' needs a full neighbor list; got half storage",
                entry
            );
            return Err(PairJitError::usage(format!(
                "kernel '{}' requires a full neighbor list, the neighbor list stores half",
                entry
            )));
        }

        let union_active = self.factory.module_info().union_entry.is_some();
        if union_active {
            self.shapes.publish_all();
        }

        let key = match self.pinned {
            Some(key) => key,
            None => self.tuner.param(),
        };
        let warp_size = self.factory.device().warp_size;
        let params: LaunchParams = self.scheme.decode(key, warp_size)?;

        let p = &self.particles;
        let args = PairKernelArgs {
            n_neigh: self.nlist.n_neigh(),
            nlist: self.nlist.nlist(),
            head_list: self.nlist.head_list(),
            positions: p.positions(),
            velocities: p.velocities(),
            tags: p.tags(),
            types: p.types(),
            orientations: p.orientations(),
            sim_box: p.sim_box(),
            cutoffs: &self.cutoffs,
            flags: p.flags(),
            seed: self.seed,
            timestep,
            shapes: union_active.then_some(&self.shapes),
        };

        self.factory.stage(&params, &args, &self.stream)?;
        let timed = self.pinned.is_none();
        if timed {
            self.tuner.begin();
        }
        self.factory.launch(&params, &args, &self.stream)?;
        self.launches += 1;
        if self.check_errors {
            self.factory.check_errors(&self.stream)?;
        }
        if timed {
            self.tuner.end();
        }

        self.last_stats = self.factory.synchronize(&self.stream, &mut self.forces)?;
        log::trace!(
            "Step {}: key {}, {} pairs, {} constituent pairs ({} pruned)",
            timestep,
            key,
            self.last_stats.pairs,
            self.last_stats.constituents.evaluated,
            self.last_stats.constituents.pruned
        );
        Ok(&self.forces)
    }

    /// Turn tuning on or off and set the steps between sweeps.
    pub fn set_autotuner_params(&mut self, enable: bool, period: u64) {
        self.tuner.set_enabled(enable);
        self.tuner.set_period(period);
    }

    /// Pin a key, bypassing the tuner, or return to tuned keys with `None`.
    pub fn set_tuning_param(&mut self, key: Option<u32>) -> Result<()> {
        if let Some(key) = key {
            let warp_size = self.factory.device().warp_size;
            self.scheme.decode(key, warp_size)?;
            log::debug!("Pinned tuning key {} for '{}'", key, self.tuner.scope());
        }
        self.pinned = key;
        Ok(())
    }

    /// Communicator of the ranks sharing this simulation. Tuned keys are
    /// only agreed across ranks while rank sync is on.
    pub fn set_communicator(&mut self, comm: Option<Arc<dyn Communicator>>) {
        self.comm = comm;
        self.attach_sync();
    }

    pub fn set_sync_across_ranks(&mut self, enabled: bool) {
        self.sync_ranks = enabled;
        self.attach_sync();
    }

    fn attach_sync(&mut self) {
        let comm = if self.sync_ranks { self.comm.clone() } else { None };
        if let Some(c) = &comm {
            log::debug!(
                "Autotuner '{}' syncing across {} ranks",
                self.tuner.scope(),
                c.size()
            );
        }
        self.tuner.set_sync(comm);
    }

    pub fn set_check_errors(&mut self, enabled: bool) {
        self.check_errors = enabled;
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    pub fn set_parameter_pointer(&mut self, symbol: &str, address: ParamAddress) -> Result<()> {
        self.factory.set_parameter_pointer(symbol, address)
    }

    pub fn set_cutoffs(&mut self, cutoffs: CutoffTable) -> Result<()> {
        if cutoffs.n_types() < self.particles.n_types() {
            return Err(PairJitError::config(format!(
                "cutoff table covers {} types, particle data has {}",
                cutoffs.n_types(),
                self.particles.n_types()
            )));
        }
        self.cutoffs = cutoffs;
        Ok(())
    }

    pub fn set_constituents(&mut self, type_id: usize, constituents: Constituents) -> Result<()> {
        self.shapes.set_constituents(type_id, constituents)
    }

    pub fn set_positions(&mut self, type_id: usize, positions: Vec<Vec3>) -> Result<()> {
        self.shapes.set_positions(type_id, positions)
    }

    pub fn set_orientations(&mut self, type_id: usize, orientations: Vec<Quat>) -> Result<()> {
        self.shapes.set_orientations(type_id, orientations)
    }

    pub fn set_diameters(&mut self, type_id: usize, diameters: Vec<f32>) -> Result<()> {
        self.shapes.set_diameters(type_id, diameters)
    }

    pub fn set_charges(&mut self, type_id: usize, charges: Vec<f32>) -> Result<()> {
        self.shapes.set_charges(type_id, charges)
    }

    pub fn set_typeids(&mut self, type_id: usize, typeids: Vec<u32>) -> Result<()> {
        self.shapes.set_typeids(type_id, typeids)
    }

    pub fn set_r_cut_constituent(&mut self, r_cut: f32) -> Result<()> {
        self.shapes.set_r_cut_constituent(r_cut)
    }

    pub fn tuner(&self) -> &Autotuner {
        &self.tuner
    }

    pub fn shapes(&self) -> &CompositeShapeIndex {
        &self.shapes
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn key_scheme(&self) -> KeyScheme {
        self.scheme
    }

    pub fn pinned_param(&self) -> Option<u32> {
        self.pinned
    }

    /// Results of the last completed step.
    pub fn forces(&self) -> &ForceBuffers {
        &self.forces
    }

    pub fn last_stats(&self) -> LaunchStats {
        self.last_stats
    }

    /// Kernel launches issued so far.
    pub fn launches(&self) -> u64 {
        self.launches
    }

    pub fn particles(&self) -> &P {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut P {
        &mut self.particles
    }

    pub fn neighbor_list(&self) -> &N {
        &self.nlist
    }

    pub fn neighbor_list_mut(&mut self) -> &mut N {
        &mut self.nlist
    }
}

impl<F: KernelFactory, N: NeighborList, P: ParticleData> std::fmt::Debug
    for InteractionDispatcher<F, N, P>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionDispatcher")
            .field("entry", &self.factory.module_info().entry)
            .field("scheme", &self.scheme)
            .field("tuner", &self.tuner)
            .field("pinned", &self.pinned)
            .field("launches", &self.launches)
            .finish()
    }
}
