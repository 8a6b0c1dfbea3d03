//! End-to-end dispatcher tests on the host backend.
//!
//! Run with: cargo test -p pairjit-gpu --test dispatcher

use anyhow::Result;
use approx::assert_relative_eq;
use pairjit_core::{
    BruteForceNeighborList, CutoffTable, EngineConfig, ForceBuffers, HostParticleData,
    KeyScheme, LaunchParams, PairJitError, PairLaunch, ParticleFlags, Quat, SimBox, StorageMode,
    Vec3,
};
use pairjit_gpu::{
    Constituents, DeviceProperties, HostKernelFactory, HostStream, InteractionDispatcher,
    KernelFactory, KernelTimer, LaunchStats, LocalGroup, ModuleInfo, PairKernelArgs,
    ParamAddress,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const LJ: &str = r#"
    const SIGMA = 1.0;
    kernel lj {
        extern epsilon;
        let sr6 = (SIGMA * SIGMA / rsq) ^ 3;
        energy = 4 * epsilon[type_i] * (sr6 * sr6 - sr6);
    }
"#;

const DIMERS: &str = r#"
    kernel body { energy = 0; }
    kernel site { energy = charge_i * charge_j * exp(-r) / r; }
"#;

fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

fn lj_factory() -> Result<HostKernelFactory> {
    let mut f = HostKernelFactory::new(LJ, "lj", &[], &[], 86)?;
    f.set_parameter_pointer("epsilon", ParamAddress::host(vec![1.0, 1.0]))?;
    Ok(f)
}

fn lattice(n_side: usize, spacing: f32) -> HostParticleData {
    let mut p = HostParticleData::new(SimBox::cube(n_side as f32 * spacing), 1);
    for x in 0..n_side {
        for y in 0..n_side {
            for z in 0..n_side {
                let wobble = 0.07 * ((x + 2 * y + 3 * z) % 4) as f32;
                p.push(
                    [
                        x as f32 * spacing + wobble,
                        y as f32 * spacing - wobble,
                        z as f32 * spacing,
                    ],
                    0,
                );
            }
        }
    }
    p
}

fn lj_dispatcher(
    particles: HostParticleData,
    mode: StorageMode,
    config: &EngineConfig,
) -> Result<InteractionDispatcher<HostKernelFactory, BruteForceNeighborList, HostParticleData>> {
    let cutoffs = CutoffTable::uniform(particles.n_types, 2.5);
    let nlist = BruteForceNeighborList::new(2.5, 0.3, mode);
    Ok(InteractionDispatcher::new(
        lj_factory()?,
        HostStream,
        nlist,
        particles,
        cutoffs,
        config,
    )?)
}

fn lj_energy_and_force_divr(r: f32) -> (f32, f32) {
    let sr6 = (1.0 / (r * r)).powi(3);
    let e = 4.0 * (sr6 * sr6 - sr6);
    let de_dr = 4.0 * (-12.0 * sr6 * sr6 + 6.0 * sr6) / r;
    (e, -de_dr / r)
}

/// Host factory that counts how often each entry point is reached.
struct CountingFactory {
    inner: HostKernelFactory,
    launches: Arc<AtomicU64>,
}

impl KernelFactory for CountingFactory {
    type Stream = HostStream;

    fn device(&self) -> DeviceProperties {
        self.inner.device()
    }

    fn module_info(&self) -> &ModuleInfo {
        self.inner.module_info()
    }

    fn set_parameter_pointer(
        &mut self,
        symbol: &str,
        address: ParamAddress,
    ) -> pairjit_core::Result<()> {
        self.inner.set_parameter_pointer(symbol, address)
    }

    fn launch_bound_candidates(&self) -> &[u32] {
        self.inner.launch_bound_candidates()
    }

    fn launch(
        &mut self,
        params: &LaunchParams,
        args: &PairKernelArgs<'_>,
        stream: &HostStream,
    ) -> pairjit_core::Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.inner.launch(params, args, stream)
    }

    fn check_errors(&mut self, stream: &HostStream) -> pairjit_core::Result<()> {
        self.inner.check_errors(stream)
    }

    fn synchronize(
        &mut self,
        stream: &HostStream,
        out: &mut ForceBuffers,
    ) -> pairjit_core::Result<LaunchStats> {
        self.inner.synchronize(stream, out)
    }

    fn timer(&self, stream: &HostStream) -> Box<dyn KernelTimer> {
        self.inner.timer(stream)
    }
}

#[test]
fn test_half_neighbor_list_rejected_before_launch() -> Result<()> {
    init_logging();
    let launches = Arc::new(AtomicU64::new(0));
    let factory = CountingFactory {
        inner: lj_factory()?,
        launches: launches.clone(),
    };
    let particles = lattice(3, 1.2);
    let cutoffs = CutoffTable::uniform(1, 2.5);
    let nlist = BruteForceNeighborList::new(2.5, 0.3, StorageMode::Half);
    let mut d = InteractionDispatcher::new(
        factory,
        HostStream,
        nlist,
        particles,
        cutoffs,
        &EngineConfig::default(),
    )?;

    let err = d.compute_forces(0).unwrap_err();
    assert!(matches!(err, PairJitError::Usage(ref m) if m.contains("full neighbor list")));
    assert!(err.is_fatal());
    assert_eq!(launches.load(Ordering::SeqCst), 0);
    assert_eq!(d.launches(), 0);

    d.neighbor_list_mut().set_storage_mode(StorageMode::Full);
    d.compute_forces(1)?;
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_lj_dimer_matches_analytic() -> Result<()> {
    init_logging();
    let r = 1.2f32;
    let mut particles = HostParticleData::new(SimBox::cube(10.0), 1);
    particles.push([1.0, 1.0, 1.0], 0);
    particles.push([1.0 + r, 1.0, 1.0], 0);

    let mut d = lj_dispatcher(particles, StorageMode::Full, &EngineConfig::default())?;
    let out = d.compute_forces(0)?;

    let (e, force_divr) = lj_energy_and_force_divr(r);
    // Particle 0 sits at -r along x relative to particle 1.
    assert_relative_eq!(out.force[0][0], -r * force_divr, max_relative = 1e-4);
    assert_relative_eq!(out.force[1][0], r * force_divr, max_relative = 1e-4);
    assert_relative_eq!(out.force[0][3], 0.5 * e, max_relative = 1e-4);
    assert_relative_eq!(out.total_energy() as f32, e, max_relative = 1e-4);
    assert_eq!(d.last_stats().pairs, 2);
    Ok(())
}

#[test]
fn test_full_list_forces_sum_to_zero() -> Result<()> {
    init_logging();
    let mut d = lj_dispatcher(lattice(5, 1.15), StorageMode::Full, &EngineConfig::default())?;
    for step in 0..3 {
        let out = d.compute_forces(step)?;
        let net = out.net_force();
        let scale: f64 = out
            .force
            .iter()
            .map(|f| (f[0].abs() + f[1].abs() + f[2].abs()) as f64)
            .sum();
        for c in net {
            assert!(c.abs() <= 1e-5 * scale.max(1.0), "net force {:?}", net);
        }
    }
    Ok(())
}

#[test]
fn test_tuned_keys_agree_with_pinned_key() -> Result<()> {
    init_logging();
    let pinned = KeyScheme::Pair.encode(
        &LaunchParams::Pair(PairLaunch {
            block_size: 64,
            threads_per_particle: 4,
        }),
        32,
    )?;
    let mut config = EngineConfig::default();
    config.dispatch.tuning_param = Some(pinned);
    let mut reference = lj_dispatcher(lattice(4, 1.25), StorageMode::Full, &config)?;
    let expected = reference.compute_forces(0)?.clone();
    assert_eq!(reference.pinned_param(), Some(pinned));
    assert!(!reference.tuner().is_complete());

    config.dispatch.tuning_param = None;
    config.tuner.warmup_samples = 1;
    let mut tuned = lj_dispatcher(lattice(4, 1.25), StorageMode::Full, &config)?;
    let n_candidates = tuned.tuner().candidates().len() as u64;
    for step in 0..n_candidates {
        let out = tuned.compute_forces(step)?;
        for (a, b) in out.force.iter().zip(&expected.force) {
            for c in 0..4 {
                assert_relative_eq!(a[c], b[c], epsilon = 1e-4, max_relative = 1e-4);
            }
        }
    }
    assert!(tuned.tuner().is_complete());
    assert!(tuned.tuner().candidates().contains(&tuned.tuner().best()));
    Ok(())
}

#[test]
fn test_invalid_pinned_key_rejected() -> Result<()> {
    let mut d = lj_dispatcher(lattice(2, 1.2), StorageMode::Full, &EngineConfig::default())?;
    // 48 threads per particle does not divide a 32-wide thread group
    let err = d.set_tuning_param(Some(64 * 10_000 + 48)).unwrap_err();
    assert!(matches!(err, PairJitError::Configuration(_)));
    assert_eq!(d.pinned_param(), None);
    Ok(())
}

#[test]
fn test_parameter_array_updates_between_steps() -> Result<()> {
    init_logging();
    let mut d = lj_dispatcher(lattice(3, 1.2), StorageMode::Full, &EngineConfig::default())?;
    let epsilon = ParamAddress::host(vec![1.0]);
    d.set_parameter_pointer("epsilon", epsilon.clone())?;
    let e1 = d.compute_forces(0)?.total_energy();

    if let ParamAddress::Host(array) = &epsilon {
        array.write()[0] = 2.0;
    }
    let e2 = d.compute_forces(1)?.total_energy();
    assert_relative_eq!(e2, 2.0 * e1, max_relative = 1e-5);
    Ok(())
}

#[test]
fn test_device_fault_surfaces_when_checking() -> Result<()> {
    init_logging();
    let mut particles = lattice(2, 1.2);
    particles.n_types = 4;
    particles.types[5] = 3;

    let mut d = lj_dispatcher(particles.clone(), StorageMode::Full, &EngineConfig::default())?;
    // Without checking the launch is reported as queued.
    d.compute_forces(0)?;

    let mut config = EngineConfig::default();
    config.dispatch.check_errors = true;
    let mut d = lj_dispatcher(particles, StorageMode::Full, &config)?;
    match d.compute_forces(0) {
        Err(PairJitError::DeviceExecution { kernel, message }) => {
            assert_eq!(kernel, "lj");
            assert!(message.contains("epsilon"), "{}", message);
        }
        other => panic!("expected device fault, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn test_virial_only_with_pressure_flag() -> Result<()> {
    init_logging();
    let particles = lattice(3, 1.2);
    let mut d = lj_dispatcher(particles.clone(), StorageMode::Full, &EngineConfig::default())?;
    let out = d.compute_forces(0)?;
    assert!(out.virial.iter().all(|v| v.iter().all(|&c| c == 0.0)));

    let flagged = particles.with_flags(ParticleFlags {
        pressure_tensor: true,
    });
    let mut d = lj_dispatcher(flagged, StorageMode::Full, &EngineConfig::default())?;
    let out = d.compute_forces(0)?;
    assert!(out.virial.iter().any(|v| v[0] != 0.0));
    // xx + yy + zz summed over particles is the pair virial sum 0.5 * r . F
    let trace: f32 = out.virial.iter().map(|v| v[0] + v[3] + v[5]).sum();
    assert!(trace.is_finite());
    Ok(())
}

fn dimer_dispatcher(
    separation: f32,
    r_cut_constituent: f32,
) -> Result<InteractionDispatcher<HostKernelFactory, BruteForceNeighborList, HostParticleData>> {
    union_dispatcher(DIMERS, separation, r_cut_constituent, 4.0)
}

fn union_dispatcher(
    source: &str,
    separation: f32,
    r_cut_constituent: f32,
    list_range: f32,
) -> Result<InteractionDispatcher<HostKernelFactory, BruteForceNeighborList, HostParticleData>> {
    let options = vec!["--union-kernel=site".to_string()];
    let factory = HostKernelFactory::new(source, "body", &options, &[], 86)?;
    let mut particles = HostParticleData::new(SimBox::cube(20.0), 1);
    particles.push([5.0, 5.0, 5.0], 0);
    particles.push([5.0 + separation, 5.0, 5.0], 0);

    let mut config = EngineConfig::default();
    config.shapes.r_cut_constituent = r_cut_constituent;
    config.shapes.leaf_capacity = 1;
    let mut d = InteractionDispatcher::new(
        factory,
        HostStream,
        BruteForceNeighborList::new(list_range, 0.0, StorageMode::Full),
        particles,
        CutoffTable::uniform(1, 4.0),
        &config,
    )?;
    d.set_constituents(
        0,
        Constituents {
            positions: vec![Vec3::new(-0.5, 0.0, 0.0), Vec3::new(0.5, 0.0, 0.0)],
            orientations: vec![Quat::identity(); 2],
            diameters: vec![1.0; 2],
            charges: vec![1.0; 2],
            typeids: vec![0; 2],
        },
    )?;
    Ok(d)
}

#[test]
fn test_union_dimers_prune_distant_constituents() -> Result<()> {
    init_logging();
    let mut d = dimer_dispatcher(3.0, 2.6)?;
    assert_eq!(d.key_scheme(), KeyScheme::NarrowPhase);
    let out = d.compute_forces(0)?;

    // Only the facing constituents (2.0 apart) are within range.
    let r = 2.0f32;
    let e = (-r).exp() / r;
    let de_dr = -(-r).exp() / r - (-r).exp() / (r * r);
    assert_relative_eq!(out.total_energy() as f32, e, max_relative = 1e-4);
    assert_relative_eq!(out.force[0][0], de_dr, max_relative = 1e-4);
    assert_relative_eq!(out.force[1][0], -de_dr, max_relative = 1e-4);

    let stats = d.last_stats();
    assert_eq!(stats.pairs, 2);
    assert_eq!(stats.constituents.evaluated, 2);
    assert_eq!(stats.constituents.pruned, 6);
    assert!(d.shapes().is_published(0));
    Ok(())
}

#[test]
fn test_union_shape_edit_republishes() -> Result<()> {
    init_logging();
    let mut d = dimer_dispatcher(3.0, 2.6)?;
    d.compute_forces(0)?;
    let advised = d.shapes().advise_calls();
    d.compute_forces(1)?;
    assert_eq!(d.shapes().advise_calls(), advised);

    // Widening the constituent range rebuilds and republishes.
    d.set_r_cut_constituent(4.5)?;
    assert!(!d.shapes().is_published(0));
    d.compute_forces(2)?;
    assert!(d.shapes().advise_calls() > advised);
    assert_eq!(d.last_stats().constituents.evaluated, 8);
    assert_eq!(d.last_stats().constituents.pruned, 0);
    Ok(())
}

#[test]
fn test_union_constituents_reach_past_centre_cutoff() -> Result<()> {
    init_logging();
    // Centres 4.5 apart are outside the 4.0 table cutoff, the facing
    // constituents (3.5 apart) are inside r_cut_constituent.
    let mut d = union_dispatcher(DIMERS, 4.5, 4.0, 6.0)?;
    assert_relative_eq!(d.shapes().union_range(0, 0).unwrap(), 5.0);
    let out = d.compute_forces(0)?;

    let r = 3.5f32;
    let e = (-r).exp() / r;
    let de_dr = -(-r).exp() / r - (-r).exp() / (r * r);
    assert_relative_eq!(out.total_energy() as f32, e, max_relative = 1e-4);
    assert_relative_eq!(out.force[0][0], de_dr, max_relative = 1e-4);
    let stats = d.last_stats();
    assert_eq!(stats.pairs, 2);
    assert_eq!(stats.constituents.evaluated, 2);
    assert_eq!(stats.constituents.pruned, 6);

    // Past r_cut_constituent plus both extents no stage runs.
    let mut far = union_dispatcher(DIMERS, 5.2, 4.0, 6.0)?;
    let out = far.compute_forces(0)?;
    assert_eq!(out.total_energy(), 0.0);
    assert_eq!(far.last_stats().pairs, 0);
    assert_eq!(far.last_stats().constituents.evaluated, 0);
    Ok(())
}

const ORIENTED: &str = r#"
    kernel body { energy = 0; }
    kernel site { energy = (1 + qz_i * qz_j) * exp(-r) / r; }
"#;

#[test]
fn test_constituent_orientations_reach_union_kernel() -> Result<()> {
    init_logging();
    let mut d = union_dispatcher(ORIENTED, 3.0, 2.6, 4.0)?;
    let r = 2.0f32;
    let e = (-r).exp() / r;
    let base = d.compute_forces(0)?.clone();
    assert_relative_eq!(base.total_energy() as f32, e, max_relative = 1e-4);

    // Quarter turn about z: qz = sin(pi/4) on both sides.
    let quarter = Quat::from_axis_angle(&Vec3::z_axis(), std::f32::consts::FRAC_PI_2);
    d.set_orientations(0, vec![quarter; 2])?;
    let turned = d.compute_forces(1)?;
    assert_relative_eq!(turned.total_energy() as f32, 1.5 * e, max_relative = 1e-4);
    assert_relative_eq!(turned.force[0][0], 1.5 * base.force[0][0], max_relative = 1e-4);
    Ok(())
}

/// Host factory recording the order in which the dispatcher drives it.
struct TracingFactory {
    inner: HostKernelFactory,
    trace: Arc<Mutex<Vec<&'static str>>>,
}

struct TracingTimer {
    trace: Arc<Mutex<Vec<&'static str>>>,
}

impl KernelTimer for TracingTimer {
    fn start(&mut self) {
        self.trace.lock().push("start");
    }

    fn stop(&mut self) -> f32 {
        self.trace.lock().push("stop");
        1.0
    }
}

impl KernelFactory for TracingFactory {
    type Stream = HostStream;

    fn device(&self) -> DeviceProperties {
        self.inner.device()
    }

    fn module_info(&self) -> &ModuleInfo {
        self.inner.module_info()
    }

    fn set_parameter_pointer(
        &mut self,
        symbol: &str,
        address: ParamAddress,
    ) -> pairjit_core::Result<()> {
        self.inner.set_parameter_pointer(symbol, address)
    }

    fn launch_bound_candidates(&self) -> &[u32] {
        self.inner.launch_bound_candidates()
    }

    fn stage(
        &mut self,
        params: &LaunchParams,
        args: &PairKernelArgs<'_>,
        stream: &HostStream,
    ) -> pairjit_core::Result<()> {
        self.trace.lock().push("stage");
        self.inner.stage(params, args, stream)
    }

    fn launch(
        &mut self,
        params: &LaunchParams,
        args: &PairKernelArgs<'_>,
        stream: &HostStream,
    ) -> pairjit_core::Result<()> {
        self.trace.lock().push("launch");
        self.inner.launch(params, args, stream)
    }

    fn check_errors(&mut self, stream: &HostStream) -> pairjit_core::Result<()> {
        self.inner.check_errors(stream)
    }

    fn synchronize(
        &mut self,
        stream: &HostStream,
        out: &mut ForceBuffers,
    ) -> pairjit_core::Result<LaunchStats> {
        self.inner.synchronize(stream, out)
    }

    fn timer(&self, _stream: &HostStream) -> Box<dyn KernelTimer> {
        Box::new(TracingTimer {
            trace: self.trace.clone(),
        })
    }
}

#[test]
fn test_inputs_staged_before_timing_window() -> Result<()> {
    init_logging();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let factory = TracingFactory {
        inner: lj_factory()?,
        trace: trace.clone(),
    };
    let particles = lattice(3, 1.2);
    let cutoffs = CutoffTable::uniform(particles.n_types, 2.5);
    let mut d = InteractionDispatcher::new(
        factory,
        HostStream,
        BruteForceNeighborList::new(2.5, 0.3, StorageMode::Full),
        particles,
        cutoffs,
        &EngineConfig::default(),
    )?;
    d.compute_forces(0)?;
    assert_eq!(*trace.lock(), vec!["stage", "start", "launch", "stop"]);

    // Pinned keys are never timed but are still staged.
    trace.lock().clear();
    let key = d.tuner().candidates()[0];
    d.set_tuning_param(Some(key))?;
    d.compute_forces(1)?;
    assert_eq!(*trace.lock(), vec!["stage", "launch"]);
    Ok(())
}

#[test]
fn test_ranks_settle_on_same_key() -> Result<()> {
    init_logging();
    let mut config = EngineConfig::default();
    config.tuner.warmup_samples = 1;
    config.tuner.sync_across_ranks = true;

    let handles: Vec<_> = LocalGroup::new(2)
        .into_iter()
        .map(|rank| {
            let config = config.clone();
            std::thread::spawn(move || -> Result<u32> {
                let spacing = if pairjit_core::Communicator::rank(&rank) == 0 { 1.2 } else { 1.3 };
                let mut d = lj_dispatcher(lattice(3, spacing), StorageMode::Full, &config)?;
                d.set_communicator(Some(Arc::new(rank)));
                let steps = d.tuner().candidates().len() as u64;
                for step in 0..steps {
                    d.compute_forces(step)?;
                }
                assert!(d.tuner().is_complete());
                Ok(d.tuner().best())
            })
        })
        .collect();
    let best: Vec<u32> = handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect::<Result<_>>()?;
    assert_eq!(best[0], best[1]);
    Ok(())
}
