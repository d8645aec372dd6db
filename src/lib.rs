//! Triplet Kernel - weighted triplet margin loss for metric learning
//!
//! Features:
//! - Forward pass producing a scalar loss from anchor, positive and negative batches
//! - Backward pass writing per-role gradients for the inputs the caller asks for
//! - SIMD row kernels with runtime instruction set detection
//! - Optional rayon parallelism over samples
//! - Finite-difference gradient checking

pub mod config;
pub mod error;
pub mod nn;
pub mod tensor;

pub use config::{ConfigBuilder, KernelConfig, PerformanceConfig, TripletLossConfig};
pub use error::{KernelError, KernelResult};
pub use nn::{
    GradientBatch, GradientChecker, GradientRequest, LossFactory, LossInputs, LossLayer,
    PairDifference, TripletLoss, TripletRole,
};
pub use tensor::{SampleBatch, SampleWeights, Shape};

use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins over the configured log level. Calling this more than once
/// is harmless.
pub fn init() -> KernelResult<()> {
    let development = config::get_config().development;
    let level = if development.verbose_logging {
        "debug".to_string()
    } else {
        development.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .map_err(|e| KernelError::ConfigurationError(format!("invalid log level '{}': {}", level, e)))?;

    // Another subscriber may already be installed by the host or a test.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    tracing::info!(
        version = version(),
        isa = ?tensor::simd::isa_level(),
        "Triplet kernel initialized"
    );
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
