//! Online launch-configuration autotuner.
//!
//! Sweeps a fixed list of candidate keys, timing `warmup_samples` launches of
//! each, then settles on the candidate with the lowest median time for
//! `period` steps before sweeping again.
//!
//! ```text
//!            set_enabled(true)
//!   Idle ─────────────────────────► Scanning(0, 0)
//!    ▲                                 │ end(): samples += 1
//!    │ set_enabled(false)              │ samples == warmup → index += 1
//!    │ (from any state)                │ index wraps → settle
//!    │                                 ▼
//!    └──────────────────────────── Settled(countdown = period)
//!                                      │ end(): countdown -= 1
//!                                      │ countdown == 0 → Scanning(0, 0)
//! ```
//!
//! With a communicator attached, the settled choice is broadcast from rank 0
//! so every rank launches identical configurations.

use pairjit_core::{Communicator, PairJitError, Result};
use std::sync::Arc;
use std::time::Instant;

/// Measures the device time of one bracketed launch.
pub trait KernelTimer: Send {
    /// Mark the start of the timed region.
    fn start(&mut self);

    /// Mark the end of the timed region and return the elapsed milliseconds.
    fn stop(&mut self) -> f32;
}

/// Wall-clock timer for backends whose launches complete on the host thread.
#[derive(Debug, Default)]
pub struct HostTimer {
    started: Option<Instant>,
}

impl KernelTimer for HostTimer {
    fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    fn stop(&mut self) -> f32 {
        self.started
            .take()
            .map(|t| t.elapsed().as_secs_f32() * 1000.0)
            .unwrap_or(0.0)
    }
}

/// Tuning session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerState {
    /// Disabled; `param()` returns the best known candidate
    Idle,
    /// Sweeping candidates
    Scanning { index: usize, samples: u32 },
    /// Holding the best candidate for `countdown` more steps
    Settled { countdown: u64 },
}

/// Autotuner for one kernel scope.
pub struct Autotuner {
    scope: String,
    candidates: Vec<u32>,
    warmup_samples: u32,
    period: u64,
    enabled: bool,
    state: TunerState,
    samples: Vec<Vec<f32>>,
    best: usize,
    timer: Box<dyn KernelTimer>,
    timing: bool,
    comm: Option<Arc<dyn Communicator>>,
    sweeps: u64,
}

impl std::fmt::Debug for Autotuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autotuner")
            .field("scope", &self.scope)
            .field("candidates", &self.candidates.len())
            .field("state", &self.state)
            .field("best", &self.candidates[self.best])
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl Autotuner {
    /// Create an enabled tuner that starts scanning on the first launch.
    ///
    /// Fails with a configuration error if `candidates` is empty or
    /// `warmup_samples` is zero.
    pub fn new(
        candidates: Vec<u32>,
        warmup_samples: u32,
        period: u64,
        scope: impl Into<String>,
    ) -> Result<Self> {
        let scope = scope.into();
        if candidates.is_empty() {
            return Err(PairJitError::config(format!(
                "autotuner '{}' needs at least one candidate",
                scope
            )));
        }
        if warmup_samples == 0 {
            return Err(PairJitError::config(format!(
                "autotuner '{}' needs at least one sample per candidate",
                scope
            )));
        }
        let n = candidates.len();
        Ok(Self {
            scope,
            candidates,
            warmup_samples,
            period,
            enabled: true,
            state: TunerState::Scanning {
                index: 0,
                samples: 0,
            },
            samples: vec![Vec::with_capacity(warmup_samples as usize); n],
            best: 0,
            timer: Box::new(HostTimer::default()),
            timing: false,
            comm: None,
            sweeps: 0,
        })
    }

    /// Replace the timer, e.g. with a device event timer.
    pub fn with_timer(mut self, timer: Box<dyn KernelTimer>) -> Self {
        self.timer = timer;
        self
    }

    /// Agree on settled choices with the other ranks of `comm`.
    pub fn set_sync(&mut self, comm: Option<Arc<dyn Communicator>>) {
        self.comm = comm;
    }

    /// Start timing the next device operation. No-op when disabled.
    pub fn begin(&mut self) {
        if !self.enabled {
            return;
        }
        self.timer.start();
        self.timing = true;
    }

    /// The key to launch with now.
    pub fn param(&self) -> u32 {
        match self.state {
            TunerState::Scanning { index, .. } => self.candidates[index],
            TunerState::Idle | TunerState::Settled { .. } => self.candidates[self.best],
        }
    }

    /// Stop timing and record the sample against the current candidate.
    /// No-op when disabled or when `begin()` was not called.
    pub fn end(&mut self) {
        if !self.enabled || !self.timing {
            return;
        }
        self.timing = false;
        let elapsed_ms = self.timer.stop();
        self.advance(elapsed_ms);
    }

    /// Record an externally measured sample, as `end()` would.
    pub fn record_sample(&mut self, elapsed_ms: f32) {
        if !self.enabled {
            return;
        }
        self.timing = false;
        self.advance(elapsed_ms);
    }

    /// Enable or disable tuning. Disabling freezes `param()` at the best
    /// known candidate; re-enabling starts a fresh sweep.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        self.timing = false;
        if enabled {
            self.start_scan();
        } else {
            self.state = TunerState::Idle;
            log::debug!(
                "Autotuner '{}' disabled, holding {}",
                self.scope,
                self.candidates[self.best]
            );
        }
    }

    /// Steps to hold a settled choice before the next sweep.
    pub fn set_period(&mut self, period: u64) {
        self.period = period;
        if let TunerState::Settled { countdown } = self.state {
            if period == 0 {
                self.start_scan();
            } else {
                self.state = TunerState::Settled {
                    countdown: countdown.min(period),
                };
            }
        }
    }

    /// Force a new sweep at the next launch.
    pub fn start_scan(&mut self) {
        if !self.enabled {
            return;
        }
        for s in &mut self.samples {
            s.clear();
        }
        self.state = TunerState::Scanning {
            index: 0,
            samples: 0,
        };
    }

    pub fn state(&self) -> TunerState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True once at least one sweep has settled.
    pub fn is_complete(&self) -> bool {
        self.sweeps > 0
    }

    /// Best known candidate.
    pub fn best(&self) -> u32 {
        self.candidates[self.best]
    }

    pub fn candidates(&self) -> &[u32] {
        &self.candidates
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    /// Completed sweeps.
    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    fn advance(&mut self, elapsed_ms: f32) {
        match self.state {
            TunerState::Idle => {}
            TunerState::Scanning { index, samples } => {
                self.samples[index].push(elapsed_ms);
                let samples = samples + 1;
                if samples < self.warmup_samples {
                    self.state = TunerState::Scanning { index, samples };
                } else if index + 1 < self.candidates.len() {
                    log::debug!(
                        "Autotuner '{}': {} done, trying {}",
                        self.scope,
                        self.candidates[index],
                        self.candidates[index + 1]
                    );
                    self.state = TunerState::Scanning {
                        index: index + 1,
                        samples: 0,
                    };
                } else {
                    self.settle();
                }
            }
            TunerState::Settled { countdown } => {
                let countdown = countdown.saturating_sub(1);
                if countdown == 0 {
                    log::debug!("Autotuner '{}' starting periodic sweep", self.scope);
                    self.start_scan();
                } else {
                    self.state = TunerState::Settled { countdown };
                }
            }
        }
    }

    fn settle(&mut self) {
        let medians: Vec<f32> = self.samples.iter().map(|s| median(s)).collect();
        let mut best = 0;
        for (i, m) in medians.iter().enumerate() {
            if m.total_cmp(&medians[best]).is_lt() {
                best = i;
            }
        }

        if let Some(comm) = &self.comm {
            let agreed = comm.broadcast_u32(self.candidates[best], 0);
            match self.candidates.iter().position(|&c| c == agreed) {
                Some(idx) => best = idx,
                None => log::warn!(
                    "Autotuner '{}': broadcast value {} is not a local candidate, keeping {}",
                    self.scope,
                    agreed,
                    self.candidates[best]
                ),
            }
        }

        self.best = best;
        self.sweeps += 1;
        log::info!(
            "Autotuner '{}' settled on {} ({:.4} ms median, sweep {})",
            self.scope,
            self.candidates[best],
            medians[best],
            self.sweeps
        );

        if self.period == 0 {
            self.start_scan();
        } else {
            self.state = TunerState::Settled {
                countdown: self.period,
            };
        }
    }
}

fn median(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::INFINITY;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}
