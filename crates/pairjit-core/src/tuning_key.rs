//! Packing of structured launch parameters into opaque tuning keys.
//!
//! The autotuner only ever sees `u32` keys. Two packing families exist:
//!
//! ```text
//! pair         key = block_size * 10_000 + threads_per_particle
//! narrow phase key = launch_bound * 1_000_000 + group_size * 100 + eval_threads
//! ```
//!
//! Every sub-field has an explicit upper bound below its radix, so the
//! mapping is a bijection over the valid range. Keys that would carry into
//! a neighbouring field are rejected instead of wrapping.

use crate::errors::{PairJitError, Result};
use serde::{Deserialize, Serialize};

/// Radix separating block size from threads-per-particle.
pub const PAIR_RADIX: u32 = 10_000;
/// Radix separating the launch bound from the rest of a narrow-phase key.
pub const NARROW_LAUNCH_RADIX: u32 = 1_000_000;
/// Radix separating group size from eval threads.
pub const NARROW_GROUP_RADIX: u32 = 100;

/// Hard ceiling on threads per block on every supported device.
pub const MAX_BLOCK_SIZE: u32 = 1024;
/// Largest encodable threads-per-particle / eval-threads value.
pub const MAX_LANES: u32 = NARROW_GROUP_RADIX - 1;
/// Largest encodable group size.
pub const MAX_GROUP_SIZE: u32 = NARROW_LAUNCH_RADIX / NARROW_GROUP_RADIX - 1;

/// Block size and threads cooperating on one particle's neighbor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairLaunch {
    pub block_size: u32,
    pub threads_per_particle: u32,
}

/// Launch configuration of the union narrow-phase kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NarrowPhaseLaunch {
    /// Compiled `__launch_bounds__` instantiation, also the block size
    pub launch_bound: u32,
    /// Threads cooperating on one particle's neighbor list
    pub group_size: u32,
    /// Threads cooperating on one pair's constituent evaluations
    pub eval_threads: u32,
}

/// Decoded launch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaunchParams {
    Pair(PairLaunch),
    NarrowPhase(NarrowPhaseLaunch),
}

impl LaunchParams {
    /// Threads per block for the launch.
    pub fn block_size(&self) -> u32 {
        match self {
            LaunchParams::Pair(p) => p.block_size,
            LaunchParams::NarrowPhase(n) => n.launch_bound,
        }
    }

    /// Threads cooperating on one particle.
    pub fn lanes_per_particle(&self) -> u32 {
        match self {
            LaunchParams::Pair(p) => p.threads_per_particle,
            LaunchParams::NarrowPhase(n) => n.group_size,
        }
    }

    /// Threads cooperating on one pair's constituent work (1 for plain pair kernels).
    pub fn eval_threads(&self) -> u32 {
        match self {
            LaunchParams::Pair(_) => 1,
            LaunchParams::NarrowPhase(n) => n.eval_threads,
        }
    }

    /// Particles handled by one block.
    pub fn particles_per_block(&self) -> u32 {
        (self.block_size() / (self.lanes_per_particle() * self.eval_threads())).max(1)
    }
}

/// Which packing family a tuning key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScheme {
    Pair,
    NarrowPhase,
}

impl KeyScheme {
    /// Pack structured fields into a key, validating against `warp_size`.
    pub fn encode(&self, params: &LaunchParams, warp_size: u32) -> Result<u32> {
        match (self, params) {
            (KeyScheme::Pair, LaunchParams::Pair(p)) => {
                validate_pair(p, warp_size)?;
                Ok(p.block_size * PAIR_RADIX + p.threads_per_particle)
            }
            (KeyScheme::NarrowPhase, LaunchParams::NarrowPhase(n)) => {
                validate_narrow(n, warp_size)?;
                Ok(n.launch_bound * NARROW_LAUNCH_RADIX
                    + n.group_size * NARROW_GROUP_RADIX
                    + n.eval_threads)
            }
            _ => Err(PairJitError::config(format!(
                "launch parameters {:?} do not belong to the {:?} key scheme",
                params, self
            ))),
        }
    }

    /// Unpack a key, validating against `warp_size`.
    pub fn decode(&self, key: u32, warp_size: u32) -> Result<LaunchParams> {
        match self {
            KeyScheme::Pair => {
                let p = PairLaunch {
                    block_size: key / PAIR_RADIX,
                    threads_per_particle: key % PAIR_RADIX,
                };
                validate_pair(&p, warp_size)?;
                Ok(LaunchParams::Pair(p))
            }
            KeyScheme::NarrowPhase => {
                let rest = key % NARROW_LAUNCH_RADIX;
                let n = NarrowPhaseLaunch {
                    launch_bound: key / NARROW_LAUNCH_RADIX,
                    group_size: rest / NARROW_GROUP_RADIX,
                    eval_threads: rest % NARROW_GROUP_RADIX,
                };
                validate_narrow(&n, warp_size)?;
                Ok(LaunchParams::NarrowPhase(n))
            }
        }
    }

    /// Every valid key for this scheme.
    ///
    /// Pair keys sweep block sizes in steps of `warp_size` up to the largest
    /// launch bound and power-of-two threads per particle up to `warp_size`.
    /// Narrow-phase keys enumerate power-of-two group sizes and eval threads
    /// that evenly divide each launch bound.
    pub fn candidates(&self, launch_bounds: &[u32], warp_size: u32) -> Result<Vec<u32>> {
        validate_width(warp_size)?;
        let mut keys = Vec::new();
        match self {
            KeyScheme::Pair => {
                let max_block = launch_bounds
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(MAX_BLOCK_SIZE)
                    .min(MAX_BLOCK_SIZE);
                let mut block_size = warp_size;
                while block_size <= max_block {
                    for tpp in pow2_up_to(warp_size) {
                        keys.push(self.encode(
                            &LaunchParams::Pair(PairLaunch {
                                block_size,
                                threads_per_particle: tpp,
                            }),
                            warp_size,
                        )?);
                    }
                    block_size += warp_size;
                }
            }
            KeyScheme::NarrowPhase => {
                for &launch_bound in launch_bounds {
                    for group_size in pow2_up_to(launch_bound) {
                        for eval_threads in pow2_up_to(warp_size) {
                            if launch_bound % (group_size * eval_threads) != 0 {
                                continue;
                            }
                            let params = LaunchParams::NarrowPhase(NarrowPhaseLaunch {
                                launch_bound,
                                group_size,
                                eval_threads,
                            });
                            keys.push(self.encode(&params, warp_size)?);
                        }
                    }
                }
            }
        }
        if keys.is_empty() {
            return Err(PairJitError::config(format!(
                "no valid {:?} launch configurations for launch bounds {:?}",
                self, launch_bounds
            )));
        }
        Ok(keys)
    }
}

fn pow2_up_to(limit: u32) -> impl Iterator<Item = u32> {
    std::iter::successors(Some(1u32), |v| v.checked_mul(2)).take_while(move |v| *v <= limit)
}

fn validate_width(warp_size: u32) -> Result<()> {
    if warp_size == 0 || !warp_size.is_power_of_two() || warp_size > MAX_LANES {
        return Err(PairJitError::config(format!(
            "unsupported native thread-group width {}",
            warp_size
        )));
    }
    Ok(())
}

fn validate_pair(p: &PairLaunch, warp_size: u32) -> Result<()> {
    validate_width(warp_size)?;
    if p.block_size == 0 || p.block_size > MAX_BLOCK_SIZE {
        return Err(PairJitError::config(format!(
            "block size {} outside 1..={}",
            p.block_size, MAX_BLOCK_SIZE
        )));
    }
    if p.threads_per_particle == 0 || p.threads_per_particle > MAX_LANES {
        return Err(PairJitError::config(format!(
            "threads per particle {} outside 1..={}",
            p.threads_per_particle, MAX_LANES
        )));
    }
    if p.block_size % warp_size != 0 {
        return Err(PairJitError::config(format!(
            "block size {} is not a multiple of the thread-group width {}",
            p.block_size, warp_size
        )));
    }
    if warp_size % p.threads_per_particle != 0 {
        return Err(PairJitError::config(format!(
            "threads per particle {} does not divide the thread-group width {}",
            p.threads_per_particle, warp_size
        )));
    }
    Ok(())
}

fn validate_narrow(n: &NarrowPhaseLaunch, warp_size: u32) -> Result<()> {
    validate_width(warp_size)?;
    if n.launch_bound == 0 || n.launch_bound > MAX_BLOCK_SIZE {
        return Err(PairJitError::config(format!(
            "launch bound {} outside 1..={}",
            n.launch_bound, MAX_BLOCK_SIZE
        )));
    }
    if n.group_size == 0 || n.group_size > MAX_GROUP_SIZE {
        return Err(PairJitError::config(format!(
            "group size {} outside 1..={}",
            n.group_size, MAX_GROUP_SIZE
        )));
    }
    if n.eval_threads == 0 || n.eval_threads > warp_size.min(MAX_LANES) {
        return Err(PairJitError::config(format!(
            "eval threads {} outside 1..={}",
            n.eval_threads,
            warp_size.min(MAX_LANES)
        )));
    }
    if n.launch_bound % (n.group_size * n.eval_threads) != 0 {
        return Err(PairJitError::config(format!(
            "launch bound {} not divisible by group size {} x eval threads {}",
            n.launch_bound, n.group_size, n.eval_threads
        )));
    }
    Ok(())
}
