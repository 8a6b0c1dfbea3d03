//! # pairjit-gpu
//!
//! Execution layer for runtime-compiled pair and union-patch interactions.
//!
//! ```text
//! ┌──────────────────────────── InteractionDispatcher ───────────────────────────┐
//! │ NeighborList ─┐                                                              │
//! │ ParticleData ─┼─► PairKernelArgs ─► KernelFactory::launch (host | cuda)      │
//! │ Autotuner ────┘        ▲                                                     │
//! │ CompositeShapeIndex ───┘ (union bodies)                                      │
//! └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The host backend is always available. Enable the `cuda` feature for the
//! NVRTC backend.

pub mod autotuner;
pub mod comm;
pub mod dispatcher;
pub mod jit;
pub mod shapes;

pub use autotuner::{Autotuner, HostTimer, KernelTimer, TunerState};
pub use comm::LocalGroup;
pub use dispatcher::InteractionDispatcher;
pub use jit::host::{HostKernelFactory, HostStream};
pub use jit::{
    AuxLibrary, CompileOptions, DeviceProperties, KernelFactory, LaunchStats, ModuleInfo,
    PairKernelArgs, ParamAddress,
};
pub use shapes::{CompositeShapeIndex, Constituents, NarrowPhaseCounts, ResidencyHint};

#[cfg(feature = "cuda")]
pub use jit::cuda::{CudaKernelFactory, EventTimer};
