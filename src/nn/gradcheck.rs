//! Finite-difference verification of a loss layer's backward pass

use rand::{rngs::StdRng, SeedableRng};
use tracing::debug;

use crate::{
    error::{KernelError, KernelResult},
    tensor::{SampleBatch, SampleWeights},
};
use super::losses::{LossInputs, LossLayer};

/// Compares analytic gradients with central differences of the loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientChecker {
    stepsize: f32,
    threshold: f32,
    seed: u64,
}

impl Default for GradientChecker {
    fn default() -> Self {
        Self::new(1e-2, 1e-2, 1701)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GradientReport {
    /// Elements whose analytic and numeric gradients were compared
    pub checked: usize,
    /// Elements skipped because the perturbation crossed a hinge
    pub skipped_kinks: usize,
    pub max_abs_error: f32,
}

impl GradientChecker {
    pub fn new(stepsize: f32, threshold: f32, seed: u64) -> Self {
        Self { stepsize, threshold, seed }
    }

    /// Check every element of batch `input`.
    pub fn check_exhaustive(
        &self,
        layer: &mut dyn LossLayer,
        batches: &[SampleBatch],
        weights: &SampleWeights,
        input: usize,
    ) -> KernelResult<GradientReport> {
        let len = batch_len(batches, input)?;
        self.check_elements(layer, batches, weights, input, 0..len)
    }

    /// Check `count` elements of batch `input`, drawn without replacement
    /// from an RNG seeded with the checker's seed.
    pub fn check_sampled(
        &self,
        layer: &mut dyn LossLayer,
        batches: &[SampleBatch],
        weights: &SampleWeights,
        input: usize,
        count: usize,
    ) -> KernelResult<GradientReport> {
        let len = batch_len(batches, input)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let indices = rand::seq::index::sample(&mut rng, len, count.min(len));
        self.check_elements(layer, batches, weights, input, indices.into_iter())
    }

    fn check_elements(
        &self,
        layer: &mut dyn LossLayer,
        batches: &[SampleBatch],
        weights: &SampleWeights,
        input: usize,
        indices: impl Iterator<Item = usize>,
    ) -> KernelResult<GradientReport> {
        let (_, base_mask) = evaluate(layer, batches, weights)?;

        let mut grads: Vec<SampleBatch> = batches.iter().map(SampleBatch::zeros_like).collect();
        let mut propagate_down = vec![false; batches.len()];
        propagate_down[input] = true;
        layer.backward_inputs(1.0, &propagate_down, &mut grads)?;

        let sign = if layer.emits_descent_direction() { -1.0 } else { 1.0 };
        let analytic: Vec<f32> = grads[input].as_slice().iter().map(|g| sign * g).collect();

        let mut probe = batches.to_vec();
        let mut report = GradientReport::default();

        for idx in indices {
            let original = probe[input].as_slice()[idx];

            probe[input].as_slice_mut()[idx] = original + self.stepsize;
            let (plus, plus_mask) = evaluate(layer, &probe, weights)?;
            probe[input].as_slice_mut()[idx] = original - self.stepsize;
            let (minus, minus_mask) = evaluate(layer, &probe, weights)?;
            probe[input].as_slice_mut()[idx] = original;

            if plus_mask != base_mask || minus_mask != base_mask {
                report.skipped_kinks += 1;
                continue;
            }

            let numeric = (plus - minus) / (2.0 * self.stepsize);
            let error = (analytic[idx] - numeric).abs();
            let scale = analytic[idx].abs().max(numeric.abs()).max(1.0);
            if error > self.threshold * scale {
                return Err(KernelError::operation_error(
                    "gradient_check",
                    &format!(
                        "{}: input {} element {}: analytic {} vs numeric {}",
                        layer.name(),
                        input,
                        idx,
                        analytic[idx],
                        numeric
                    ),
                ));
            }
            report.max_abs_error = report.max_abs_error.max(error);
            report.checked += 1;
        }

        // leave the layer holding the unperturbed pass
        evaluate(layer, batches, weights)?;

        debug!(
            layer = layer.name(),
            input,
            checked = report.checked,
            skipped = report.skipped_kinks,
            max_abs_error = report.max_abs_error,
            "gradient check passed"
        );
        Ok(report)
    }
}

fn batch_len(batches: &[SampleBatch], input: usize) -> KernelResult<usize> {
    batches
        .get(input)
        .map(|b| b.as_slice().len())
        .ok_or_else(|| KernelError::InvalidInput(format!(
            "input {} out of range for {} batches",
            input,
            batches.len()
        )))
}

fn evaluate(
    layer: &mut dyn LossLayer,
    batches: &[SampleBatch],
    weights: &SampleWeights,
) -> KernelResult<(f32, Option<Vec<bool>>)> {
    let refs: Vec<&SampleBatch> = batches.iter().collect();
    let loss = layer.forward_inputs(&LossInputs::new(&refs, weights))?;
    Ok((loss, layer.violation_mask().map(|m| m.to_vec())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerformanceConfig;
    use crate::nn::losses::{TripletLoss, TripletRole};
    use crate::tensor::Shape;
    use rand::Rng;

    fn random_triplets(seed: u64, num: usize, channels: usize) -> (Vec<SampleBatch>, SampleWeights) {
        let mut rng = StdRng::seed_from_u64(seed);
        let batches = (0..3)
            .map(|_| {
                let data = (0..num * channels).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
                SampleBatch::from_vec(data, Shape::new([num, channels])).unwrap()
            })
            .collect();
        let weights = SampleWeights::new((0..num).map(|_| rng.gen_range(0.0f32..1.0)).collect()).unwrap();
        (batches, weights)
    }

    fn layer() -> TripletLoss {
        TripletLoss::with_margin(1.0)
            .unwrap()
            .with_performance(PerformanceConfig { parallel: false, min_parallel_rows: 0 })
    }

    #[test]
    fn test_triplet_gradients_exhaustive() {
        let (batches, weights) = random_triplets(1701, 16, 2);
        let mut layer = layer();
        let checker = GradientChecker::default();

        for role in TripletRole::ALL {
            let report = checker
                .check_exhaustive(&mut layer, &batches, &weights, role.index())
                .unwrap();
            assert_eq!(report.checked + report.skipped_kinks, 32);
            assert!(report.checked > 0);
        }
        // the layer is left on the unperturbed inputs
        let expected = {
            let mut fresh = self::layer();
            let refs: Vec<&SampleBatch> = batches.iter().collect();
            fresh.forward_inputs(&LossInputs::new(&refs, &weights)).unwrap()
        };
        assert_eq!(layer.loss(), Some(expected));
    }

    #[test]
    fn test_triplet_gradients_sampled() {
        let (batches, weights) = random_triplets(42, 64, 8);
        let mut layer = layer();
        let checker = GradientChecker::new(1e-2, 1e-2, 7);

        let report = checker.check_sampled(&mut layer, &batches, &weights, 0, 40).unwrap();
        assert_eq!(report.checked + report.skipped_kinks, 40);
    }

    /// Reports the analytic gradient with the wrong sign.
    struct FlippedTriplet(TripletLoss);

    impl LossLayer for FlippedTriplet {
        fn name(&self) -> &'static str { "FlippedTriplet" }
        fn num_batches(&self) -> usize { 3 }
        fn reshape_inputs(&mut self, inputs: &LossInputs<'_>) -> KernelResult<()> { self.0.reshape_inputs(inputs) }
        fn forward_inputs(&mut self, inputs: &LossInputs<'_>) -> KernelResult<f32> { self.0.forward_inputs(inputs) }
        fn backward_inputs(&self, upstream: f32, propagate_down: &[bool], grads: &mut [SampleBatch]) -> KernelResult<()> {
            self.0.backward_inputs(upstream, propagate_down, grads)
        }
        fn violation_mask(&self) -> Option<&[bool]> { LossLayer::violation_mask(&self.0) }
    }

    #[test]
    fn test_wrong_sign_is_caught() {
        // a large margin keeps every sample away from the hinge
        let (batches, weights) = random_triplets(9, 8, 3);
        let mut flipped = FlippedTriplet(
            TripletLoss::with_margin(50.0)
                .unwrap()
                .with_performance(PerformanceConfig { parallel: false, min_parallel_rows: 0 }),
        );
        let checker = GradientChecker::new(1e-2, 1e-3, 1);

        let err = checker.check_exhaustive(&mut flipped, &batches, &weights, 1).unwrap_err();
        assert!(matches!(err, KernelError::OperationError { .. }));
    }

    #[test]
    fn test_input_out_of_range() {
        let (batches, weights) = random_triplets(3, 4, 2);
        let mut layer = layer();
        let err = GradientChecker::default()
            .check_exhaustive(&mut layer, &batches, &weights, 3)
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidInput(_)));
    }
}
