//! Loss layers with explicit forward and backward passes
//!
//! A host compute graph drives a layer through `reshape_inputs` (once per
//! new input shape), then `forward_inputs` and `backward_inputs` for every
//! evaluation. Layers are looked up by name through [`LossFactory`].

pub mod distance;
pub mod triplet;

pub use distance::{DistanceStage, PairDifference};
pub use triplet::{ForwardSummary, GradientBatch, GradientRequest, TripletLoss, TripletRole};

use crate::{
    config::KernelConfig,
    error::{KernelError, KernelResult},
    tensor::{SampleBatch, SampleWeights},
};

/// Batches and per-sample weights handed to a loss layer by the host.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    pub batches: &'a [&'a SampleBatch],
    pub weights: &'a SampleWeights,
}

impl<'a> LossInputs<'a> {
    pub fn new(batches: &'a [&'a SampleBatch], weights: &'a SampleWeights) -> Self {
        Self { batches, weights }
    }
}

/// Base trait for all loss layers
pub trait LossLayer: Send + Sync {
    /// Get the name of the loss layer
    fn name(&self) -> &'static str;

    /// Number of feature batches the layer consumes besides the weights
    fn num_batches(&self) -> usize;

    /// Validate input shapes and size internal buffers
    fn reshape_inputs(&mut self, inputs: &LossInputs<'_>) -> KernelResult<()>;

    /// Compute the scalar loss and retain what backward needs
    fn forward_inputs(&mut self, inputs: &LossInputs<'_>) -> KernelResult<f32>;

    /// Write gradients for every batch whose `propagate_down` flag is set.
    ///
    /// `grads` holds one caller-owned buffer per batch; unflagged buffers
    /// must be left untouched.
    fn backward_inputs(
        &self,
        upstream: f32,
        propagate_down: &[bool],
        grads: &mut [SampleBatch],
    ) -> KernelResult<()>;

    /// `true` when backward writes the negated partial derivative.
    fn emits_descent_direction(&self) -> bool {
        false
    }

    /// Per-sample "contributes gradient" mask of the latest forward pass,
    /// for layers with piecewise behaviour.
    fn violation_mask(&self) -> Option<&[bool]> {
        None
    }
}

/// Loss layer factory for creating layers by name
pub struct LossFactory;

impl LossFactory {
    /// Create a loss layer by name, configured from `config`
    pub fn create(name: &str, config: &KernelConfig) -> KernelResult<Box<dyn LossLayer>> {
        match name.to_lowercase().as_str() {
            "triplet" | "triplet_loss" | "tripletloss" => {
                let layer = TripletLoss::new(config.triplet)?
                    .with_performance(config.performance.clone());
                Ok(Box::new(layer))
            },
            _ => Err(KernelError::InvalidInput(format!("Unknown loss function: {}", name))),
        }
    }

    /// List all available loss layers
    pub fn available_losses() -> Vec<&'static str> {
        vec!["triplet"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    #[test]
    fn test_loss_factory() {
        let config = ConfigBuilder::new().triplet(|t| t.margin = 0.5).build().unwrap();
        let layer = LossFactory::create("TripletLoss", &config).unwrap();
        assert_eq!(layer.name(), "TripletLoss");
        assert_eq!(layer.num_batches(), 3);
        assert!(layer.emits_descent_direction());
        assert!(layer.violation_mask().is_none());
    }

    #[test]
    fn test_unknown_loss() {
        let err = LossFactory::create("contrastive", &KernelConfig::default()).err().unwrap();
        assert!(matches!(err, KernelError::InvalidInput(_)));
    }

    #[test]
    fn test_factory_rejects_invalid_margin() {
        let mut config = KernelConfig::default();
        config.triplet.margin = -1.0;
        assert!(LossFactory::create("triplet", &config).is_err());
    }

    #[test]
    fn test_available_losses() {
        let losses = LossFactory::available_losses();
        for name in losses {
            assert!(LossFactory::create(name, &KernelConfig::default()).is_ok());
        }
    }

    #[test]
    fn test_boxed_layer_round_trip() {
        let mut layer = LossFactory::create("triplet", &KernelConfig::default()).unwrap();
        let anchor = SampleBatch::from_rows(&[[0.0, 0.0], [0.0, 0.0]]).unwrap();
        let positive = SampleBatch::from_rows(&[[0.0, 0.0], [0.0, 0.0]]).unwrap();
        let negative = SampleBatch::from_rows(&[[5.0, 0.0], [0.0, 0.1]]).unwrap();
        let weights = SampleWeights::ones(2);
        let batches = [&anchor, &positive, &negative];
        let inputs = LossInputs::new(&batches, &weights);

        layer.reshape_inputs(&inputs).unwrap();
        let loss = layer.forward_inputs(&inputs).unwrap();
        // only the second triplet violates: hinge = 1 - 0.01
        assert!((loss - 0.99 / 4.0).abs() < 1e-6);
        assert_eq!(layer.violation_mask(), Some(&[false, true][..]));

        let mut grads = vec![SampleBatch::zeros(2, 2).unwrap(); 3];
        layer.backward_inputs(1.0, &[true, true, true], &mut grads).unwrap();
        assert_eq!(grads[0].row(0), &[0.0, 0.0]);
        assert_eq!(grads[2].row(0), &[0.0, 0.0]);
        // negative: -(1/2) * (a - n) = -(1/2) * (0, -0.1)
        assert!((grads[2].row(1)[1] - 0.05).abs() < 1e-7);
    }
}
