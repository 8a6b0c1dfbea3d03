//! # pairjit-core
//!
//! Core types, traits, and errors for the pairjit execution layer.
//!
//! This crate holds everything the device-facing crate shares with its
//! callers:
//! - **Errors**: `PairJitError` and the fatal/non-fatal policy
//! - **Tuning keys**: packing of launch parameters into autotuner keys
//! - **Traits**: neighbor list, particle data and rank communicator collaborators
//! - **Config**: TOML-backed engine configuration
//!
//! ```text
//! ┌─────────────────┐
//! │  pairjit-core   │  ← types / traits / config
//! └────────▲────────┘
//!          │
//! ┌────────┴────────┐
//! │  pairjit-gpu    │  ← autotuner, JIT factories, shape index, dispatcher
//! └─────────────────┘
//! ```

pub mod config;
pub mod errors;
pub mod host_data;
pub mod traits;
pub mod tuning_key;
pub mod types;

// Re-export commonly used items
pub use config::{CompilerConfig, DispatchConfig, EngineConfig, ShapeConfig, TunerConfig};
pub use errors::{PairJitError, Result};
pub use host_data::{BruteForceNeighborList, HostParticleData};
pub use traits::{Communicator, NeighborList, ParticleData, SingleProcess, StorageMode};
pub use tuning_key::{KeyScheme, LaunchParams, NarrowPhaseLaunch, PairLaunch};
pub use types::{
    CutoffTable, ForceBuffers, ParticleFlags, Quat, Scalar4, SimBox, Vec3, VIRIAL_COMPONENTS,
};
