//! Autotuner convergence and periodic re-tuning
//!
//! Feeds synthetic timings through `record_sample` so the outcome does not
//! depend on the machine running the test.

use pairjit_core::Communicator;
use pairjit_gpu::{Autotuner, KernelTimer, LocalGroup, TunerState};
use std::sync::Arc;

const A: u32 = 320_001;
const B: u32 = 640_004;
const C: u32 = 1_280_032;

fn timing(key: u32) -> f32 {
    match key {
        A => 10.0,
        B => 3.0,
        C => 7.0,
        _ => 100.0,
    }
}

/// Run one full sweep, returning the keys handed out along the way.
fn sweep(tuner: &mut Autotuner, timing: impl Fn(u32) -> f32) -> Vec<u32> {
    let n = tuner.candidates().len() * 5;
    let mut seen = Vec::with_capacity(n);
    for _ in 0..n {
        let key = tuner.param();
        seen.push(key);
        tuner.record_sample(timing(key));
    }
    seen
}

#[test]
fn test_settles_on_fastest_candidate() {
    let mut tuner = Autotuner::new(vec![A, B, C], 5, 100, "pair_lj").unwrap();
    let seen = sweep(&mut tuner, timing);

    // Each candidate is held for its five samples in order.
    assert_eq!(&seen[..5], &[A; 5]);
    assert_eq!(&seen[5..10], &[B; 5]);
    assert_eq!(&seen[10..], &[C; 5]);

    assert!(tuner.is_complete());
    assert_eq!(tuner.best(), B);
    assert_eq!(tuner.param(), B);
    assert_eq!(tuner.state(), TunerState::Settled { countdown: 100 });
}

#[test]
fn test_period_holds_choice_then_rescans() {
    let mut tuner = Autotuner::new(vec![A, B, C], 5, 100, "pair_lj").unwrap();
    sweep(&mut tuner, timing);

    for step in 0..100 {
        assert_eq!(tuner.param(), B, "step {} left the settled key", step);
        tuner.record_sample(timing(B));
    }
    assert_eq!(
        tuner.state(),
        TunerState::Scanning {
            index: 0,
            samples: 0
        }
    );
    assert_eq!(tuner.param(), A);

    // The second sweep sees C become fastest and follows it.
    sweep(&mut tuner, |k| if k == C { 1.0 } else { timing(k) });
    assert_eq!(tuner.best(), C);
    assert_eq!(tuner.sweeps(), 2);
}

#[test]
fn test_median_resists_single_slow_sample() {
    let mut tuner = Autotuner::new(vec![A, B], 5, 10, "narrow_site").unwrap();
    let mut b_samples = vec![3.0, 3.1, 500.0, 2.9, 3.0].into_iter();
    for _ in 0..10 {
        let key = tuner.param();
        let t = if key == B {
            b_samples.next().unwrap()
        } else {
            4.0
        };
        tuner.record_sample(t);
    }
    assert_eq!(tuner.best(), B);
}

#[test]
fn test_disable_freezes_best() {
    let mut tuner = Autotuner::new(vec![A, B, C], 5, 100, "pair_lj").unwrap();
    sweep(&mut tuner, timing);
    tuner.set_enabled(false);
    assert_eq!(tuner.state(), TunerState::Idle);

    for _ in 0..1000 {
        tuner.begin();
        assert_eq!(tuner.param(), B);
        tuner.end();
        tuner.record_sample(0.001);
    }
    assert_eq!(tuner.sweeps(), 1);

    tuner.set_enabled(true);
    assert_eq!(
        tuner.state(),
        TunerState::Scanning {
            index: 0,
            samples: 0
        }
    );
}

#[test]
fn test_new_rejects_zero_samples() {
    assert!(Autotuner::new(vec![A], 0, 100, "pair_lj").is_err());
}

struct FixedTimer(f32);

impl KernelTimer for FixedTimer {
    fn start(&mut self) {}

    fn stop(&mut self) -> f32 {
        self.0
    }
}

#[test]
fn test_begin_end_uses_attached_timer() {
    let mut tuner = Autotuner::new(vec![A], 2, 7, "pair_lj")
        .unwrap()
        .with_timer(Box::new(FixedTimer(1.5)));
    for _ in 0..2 {
        tuner.begin();
        tuner.end();
    }
    assert!(tuner.is_complete());
    assert_eq!(tuner.state(), TunerState::Settled { countdown: 7 });
}

#[test]
fn test_ranks_agree_on_root_choice() {
    let group = LocalGroup::new(3);
    let handles: Vec<_> = group
        .into_iter()
        .map(|rank| {
            std::thread::spawn(move || {
                let r = rank.rank();
                let comm: Arc<dyn Communicator> = Arc::new(rank);
                let mut tuner = Autotuner::new(vec![A, B, C], 5, 100, "pair_lj").unwrap();
                tuner.set_sync(Some(comm));
                // Every rank measures a different winner locally.
                let local_best = [B, C, A][r];
                sweep(&mut tuner, |k| if k == local_best { 1.0 } else { 9.0 });
                tuner.best()
            })
        })
        .collect();
    let choices: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(choices, vec![B, B, B]);
}
