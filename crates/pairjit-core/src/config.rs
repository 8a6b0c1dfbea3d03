//! TOML configuration for the execution layer.
//!
//! ```toml
//! [tuner]
//! enabled = true
//! period = 100000
//! warmup_samples = 5
//!
//! [compiler]
//! options = ["-DSIGMA=1.0"]
//! launch_bounds = [32, 64, 128, 256]
//!
//! [dispatch]
//! check_errors = true
//! seed = 42
//!
//! [shapes]
//! r_cut_constituent = 1.5
//! ```

use crate::errors::{PairJitError, Result};
use crate::tuning_key::{KeyScheme, MAX_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub tuner: TunerConfig,

    #[serde(default)]
    pub compiler: CompilerConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub shapes: ShapeConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        self.tuner.validate()?;
        self.compiler.validate()?;
        self.shapes.validate()?;
        Ok(())
    }
}

// =============================================================================
// Autotuner
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Steps between the end of one sweep and the start of the next
    #[serde(default = "default_period")]
    pub period: u64,

    /// Timed samples taken per candidate during a sweep
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: u32,

    /// Broadcast the chosen configuration from rank 0 after each sweep
    #[serde(default)]
    pub sync_across_ranks: bool,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: default_period(),
            warmup_samples: default_warmup_samples(),
            sync_across_ranks: false,
        }
    }
}

impl TunerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.warmup_samples == 0 {
            return Err(PairJitError::config("tuner.warmup_samples must be at least 1"));
        }
        Ok(())
    }
}

// =============================================================================
// Runtime compiler
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Extra compiler flags passed through verbatim
    #[serde(default)]
    pub options: Vec<String>,

    /// Auxiliary libraries linked into the module
    #[serde(default)]
    pub libraries: Vec<PathBuf>,

    /// Compute capability as `major * 10 + minor` (device backend only)
    #[serde(default = "default_target_arch")]
    pub target_arch: u32,

    /// `__launch_bounds__` instantiations to compile
    #[serde(default = "default_launch_bounds")]
    pub launch_bounds: Vec<u32>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            options: Vec::new(),
            libraries: Vec::new(),
            target_arch: default_target_arch(),
            launch_bounds: default_launch_bounds(),
        }
    }
}

impl CompilerConfig {
    /// Compiler flags with the launch bounds appended unless the flags
    /// already name some.
    pub fn effective_options(&self) -> Vec<String> {
        let mut options = self.options.clone();
        if !options.iter().any(|o| o.starts_with("--launch-bounds=")) {
            let bounds: Vec<String> = self.launch_bounds.iter().map(u32::to_string).collect();
            options.push(format!("--launch-bounds={}", bounds.join(",")));
        }
        options
    }

    pub fn validate(&self) -> Result<()> {
        if self.launch_bounds.is_empty() {
            return Err(PairJitError::config("compiler.launch_bounds must not be empty"));
        }
        if let Some(lb) = self
            .launch_bounds
            .iter()
            .find(|&&lb| lb == 0 || lb > MAX_BLOCK_SIZE)
        {
            return Err(PairJitError::config(format!(
                "launch bound {} outside 1..={}",
                lb, MAX_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Check for device faults after every launch (slow)
    #[serde(default)]
    pub check_errors: bool,

    /// Seed for stochastic pair terms
    #[serde(default)]
    pub seed: u64,

    /// Fixed tuning key; disables the autotuner search when set
    #[serde(default)]
    pub tuning_param: Option<u32>,

    /// Packing family of the tuning key; chosen automatically when absent
    #[serde(default)]
    pub key_scheme: Option<KeyScheme>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            check_errors: false,
            seed: 0,
            tuning_param: None,
            key_scheme: None,
        }
    }
}

// =============================================================================
// Union shapes
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeConfig {
    /// Interaction range between constituents of different bodies
    #[serde(default = "default_r_cut_constituent")]
    pub r_cut_constituent: f32,

    /// Maximum constituents per hierarchy leaf
    #[serde(default = "default_leaf_capacity")]
    pub leaf_capacity: usize,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            r_cut_constituent: default_r_cut_constituent(),
            leaf_capacity: default_leaf_capacity(),
        }
    }
}

impl ShapeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.r_cut_constituent.is_finite() && self.r_cut_constituent >= 0.0) {
            return Err(PairJitError::config(format!(
                "shapes.r_cut_constituent must be finite and non-negative, got {}",
                self.r_cut_constituent
            )));
        }
        if self.leaf_capacity == 0 {
            return Err(PairJitError::config("shapes.leaf_capacity must be at least 1"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_period() -> u64 {
    100_000
}

fn default_warmup_samples() -> u32 {
    5
}

fn default_target_arch() -> u32 {
    86
}

fn default_launch_bounds() -> Vec<u32> {
    vec![32, 64, 128, 256]
}

fn default_r_cut_constituent() -> f32 {
    1.0
}

fn default_leaf_capacity() -> usize {
    4
}
