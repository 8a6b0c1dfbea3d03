//! Error types for pairjit.
//!
//! Every failure the execution layer can report falls into one of the
//! categories below. Compilation failures, listing-mode violations and
//! detected device faults are fatal: the caller is expected to stop the run.

use thiserror::Error;

/// Unified error type for all pairjit operations.
#[derive(Error, Debug)]
pub enum PairJitError {
    /// Invalid tuning candidates, malformed constituent geometry, bad config values
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The device (or host) compiler/linker rejected the source.
    /// `diagnostics` is the compiler log, unmodified.
    #[error("Compilation of '{symbol}' failed:\n{diagnostics}")]
    Compilation { symbol: String, diagnostics: String },

    /// The entry symbol (or another required symbol) is missing after linking
    #[error("Symbol '{symbol}' not found in compiled module")]
    SymbolResolution { symbol: String },

    /// API misuse: unbound parameter symbols, half neighbor lists
    #[error("Usage error: {0}")]
    Usage(String),

    /// A fault detected after launch while error checking is enabled
    #[error("Device execution error in kernel '{kernel}': {message}")]
    DeviceExecution { kernel: String, message: String },

    /// Driver / runtime failures that are not attributable to a kernel
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O errors (config files, auxiliary libraries)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML configuration parse errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl PairJitError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        PairJitError::Configuration(message.into())
    }

    /// Creates a compilation error carrying the compiler log verbatim.
    pub fn compilation(symbol: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        PairJitError::Compilation {
            symbol: symbol.into(),
            diagnostics: diagnostics.into(),
        }
    }

    /// Creates a symbol resolution error.
    pub fn symbol(symbol: impl Into<String>) -> Self {
        PairJitError::SymbolResolution {
            symbol: symbol.into(),
        }
    }

    /// Creates a usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        PairJitError::Usage(message.into())
    }

    /// Creates a device execution error for `kernel`.
    pub fn device(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        PairJitError::DeviceExecution {
            kernel: kernel.into(),
            message: message.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        PairJitError::Backend(message.into())
    }

    /// Fatal errors terminate the run; there is no retry path.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PairJitError::Compilation { .. }
                | PairJitError::SymbolResolution { .. }
                | PairJitError::Usage(_)
                | PairJitError::DeviceExecution { .. }
                | PairJitError::Backend(_)
        )
    }

    /// Compiler diagnostics, if this is a compilation error.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            PairJitError::Compilation { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Result type alias for pairjit operations.
pub type Result<T> = std::result::Result<T, PairJitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let cfg = PairJitError::config("empty candidate set");
        assert!(matches!(cfg, PairJitError::Configuration(_)));

        let comp = PairJitError::compilation("lj", "1:4: unexpected token");
        assert_eq!(comp.diagnostics(), Some("1:4: unexpected token"));

        let dev = PairJitError::device("pair_dpd", "neighbor index out of range");
        assert!(dev.to_string().contains("pair_dpd"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PairJitError::usage("half neighbor list").is_fatal());
        assert!(PairJitError::compilation("k", "log").is_fatal());
        assert!(!PairJitError::config("bad period").is_fatal());
    }
}
