//! Host pair-kernel benchmarks
//!
//! Times one Lennard-Jones evaluation across launch configurations and
//! system sizes, and the constituent traversal of union bodies.
//!
//! ## Usage
//! ```bash
//! cargo bench -p pairjit-gpu --bench kernels
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nalgebra::Vector3;
use pairjit_core::{
    BruteForceNeighborList, CutoffTable, ForceBuffers, HostParticleData, KeyScheme, LaunchParams,
    NeighborList, PairLaunch, ParticleData, Quat, SimBox, StorageMode,
};
use pairjit_gpu::{
    CompositeShapeIndex, HostKernelFactory, HostStream, KernelFactory, PairKernelArgs,
    ParamAddress,
};

const LJ: &str = r#"
    kernel lj {
        extern epsilon;
        let sr6 = (1 / rsq) ^ 3;
        energy = 4 * epsilon[type_i] * (sr6 * sr6 - sr6);
    }
"#;

fn lattice(n_side: usize) -> HostParticleData {
    let spacing = 1.1;
    let mut p = HostParticleData::new(SimBox::cube(n_side as f32 * spacing), 1);
    for x in 0..n_side {
        for y in 0..n_side {
            for z in 0..n_side {
                p.push(
                    [x as f32 * spacing, y as f32 * spacing, z as f32 * spacing],
                    0,
                );
            }
        }
    }
    p
}

/// Benchmark one launch + synchronize per launch configuration
fn bench_pair_launch_configs(c: &mut Criterion) {
    let data = lattice(8);
    let mut nl = BruteForceNeighborList::new(2.5, 0.0, StorageMode::Full);
    nl.compute(0, &data).expect("neighbor list");
    let cutoffs = CutoffTable::uniform(1, 2.5);
    let mut factory = HostKernelFactory::new(LJ, "lj", &[], &[], 86).expect("compile");
    factory
        .set_parameter_pointer("epsilon", ParamAddress::host(vec![1.0]))
        .expect("bind");

    let args = PairKernelArgs {
        n_neigh: nl.n_neigh(),
        nlist: nl.nlist(),
        head_list: nl.head_list(),
        positions: data.positions(),
        velocities: data.velocities(),
        tags: data.tags(),
        types: data.types(),
        orientations: None,
        sim_box: data.sim_box(),
        cutoffs: &cutoffs,
        flags: data.flags(),
        seed: 0,
        timestep: 0,
        shapes: None,
    };

    let mut group = c.benchmark_group("pair_launch");
    group.throughput(Throughput::Elements(nl.nlist().len() as u64));
    for (block_size, tpp) in [(32, 1), (64, 4), (128, 8), (256, 32)] {
        let params = LaunchParams::Pair(PairLaunch {
            block_size,
            threads_per_particle: tpp,
        });
        let key = KeyScheme::Pair.encode(&params, 32).expect("valid key");
        let mut out = ForceBuffers::default();
        group.bench_with_input(BenchmarkId::from_parameter(key), &params, |b, params| {
            b.iter(|| {
                factory.launch(params, &args, &HostStream).unwrap();
                factory.synchronize(&HostStream, &mut out).unwrap();
                black_box(out.force.len())
            });
        });
    }
    group.finish();
}

/// Benchmark constituent traversal for growing union bodies
fn bench_union_traversal(c: &mut Criterion) {
    let mut group = c.benchmark_group("union_traversal");
    for n in [8usize, 64, 256] {
        let mut index = CompositeShapeIndex::new(1, 0.6, 4).expect("index");
        let side = (n as f32).cbrt().ceil() as usize;
        let positions = (0..n)
            .map(|k| {
                Vector3::new(
                    (k % side) as f32 * 0.5,
                    ((k / side) % side) as f32 * 0.5,
                    (k / (side * side)) as f32 * 0.5,
                )
            })
            .collect();
        index.set_positions(0, positions).expect("positions");
        let view = index.index(0).expect("view");
        let q_j = Quat::from_euler_angles(0.2, 0.4, -0.3);
        let dx = Vector3::new(side as f32 * 0.5, 0.0, 0.0);

        group.throughput(Throughput::Elements((n * n) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let mut sum = 0.0f32;
                let counts = view.for_each_near_pair(
                    &view,
                    &Quat::identity(),
                    &q_j,
                    &dx,
                    |_, _, d| sum += d.norm_squared(),
                );
                black_box((counts, sum))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pair_launch_configs, bench_union_traversal);
criterion_main!(benches);
