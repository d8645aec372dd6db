//! Weighted triplet margin loss
//!
//! For each sample `i` the layer computes
//!
//! ```text
//! hinge[i] = max(0, margin + |a[i] - p[i]|² - |a[i] - n[i]|²)
//! loss     = Σ w[i] * hinge[i] / (2 * N)
//! ```
//!
//! Forward records which samples violate the margin (`hinge[i] > 0`) next to
//! the untouched difference buffers. Backward multiplies by that mask instead
//! of re-deriving it, so non-violating samples receive exactly zero gradient.
//!
//! The buffers written by backward follow the sign convention
//!
//! ```text
//! grad_anchor[i]   =  (g / N) * w[i] * (p[i] - n[i])
//! grad_positive[i] =  (g / N) * w[i] * (a[i] - p[i])
//! grad_negative[i] = -(g / N) * w[i] * (a[i] - n[i])
//! ```
//!
//! which is the negative of `∂loss/∂input`, i.e. a descent direction.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::{
    config::{PerformanceConfig, TripletLossConfig},
    error::{ErrorContext, KernelError, KernelResult, WithContext},
    tensor::{simd, SampleBatch, SampleWeights, Shape},
};
use super::distance::{DistanceStage, PairDifference};
use super::{LossInputs, LossLayer};

/// Input role within a triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TripletRole {
    Anchor,
    Positive,
    Negative,
}

impl TripletRole {
    pub const ALL: [TripletRole; 3] = [TripletRole::Anchor, TripletRole::Positive, TripletRole::Negative];

    /// Position of the role among the layer inputs.
    pub fn index(self) -> usize {
        match self {
            TripletRole::Anchor => 0,
            TripletRole::Positive => 1,
            TripletRole::Negative => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TripletRole::Anchor => "anchor",
            TripletRole::Positive => "positive",
            TripletRole::Negative => "negative",
        }
    }

    fn rule(self) -> &'static RoleRule {
        &ROLE_RULES[self.index()]
    }
}

/// How one role's gradient is formed from the forward buffers.
#[derive(Debug)]
struct RoleRule {
    sign: f32,
    source: PairDifference,
}

/// Indexed by [`TripletRole::index`].
const ROLE_RULES: [RoleRule; 3] = [
    RoleRule { sign: 1.0, source: PairDifference::PositiveNegative },
    RoleRule { sign: 1.0, source: PairDifference::AnchorPositive },
    RoleRule { sign: -1.0, source: PairDifference::AnchorNegative },
];

/// Which inputs the host wants gradients for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GradientRequest {
    pub anchor: bool,
    pub positive: bool,
    pub negative: bool,
}

impl GradientRequest {
    pub fn all() -> Self {
        Self { anchor: true, positive: true, negative: true }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn only(role: TripletRole) -> Self {
        Self::none().with(role, true)
    }

    /// Flags in input order: anchor, positive, negative.
    pub fn from_flags(flags: [bool; 3]) -> Self {
        Self { anchor: flags[0], positive: flags[1], negative: flags[2] }
    }

    pub fn with(mut self, role: TripletRole, requested: bool) -> Self {
        match role {
            TripletRole::Anchor => self.anchor = requested,
            TripletRole::Positive => self.positive = requested,
            TripletRole::Negative => self.negative = requested,
        }
        self
    }

    pub fn is_requested(&self, role: TripletRole) -> bool {
        match role {
            TripletRole::Anchor => self.anchor,
            TripletRole::Positive => self.positive,
            TripletRole::Negative => self.negative,
        }
    }

    pub fn any(&self) -> bool {
        self.anchor || self.positive || self.negative
    }
}

/// Caller-owned gradient buffers, one per input role.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientBatch {
    pub anchor: SampleBatch,
    pub positive: SampleBatch,
    pub negative: SampleBatch,
}

impl GradientBatch {
    pub fn zeros(shape: Shape<2>) -> KernelResult<Self> {
        let zeros = SampleBatch::zeros(shape.num(), shape.channels())?;
        Ok(Self {
            anchor: zeros.clone(),
            positive: zeros.clone(),
            negative: zeros,
        })
    }

    pub fn get(&self, role: TripletRole) -> &SampleBatch {
        match role {
            TripletRole::Anchor => &self.anchor,
            TripletRole::Positive => &self.positive,
            TripletRole::Negative => &self.negative,
        }
    }

    pub fn get_mut(&mut self, role: TripletRole) -> &mut SampleBatch {
        match role {
            TripletRole::Anchor => &mut self.anchor,
            TripletRole::Positive => &mut self.positive,
            TripletRole::Negative => &mut self.negative,
        }
    }
}

/// Outcome of the latest forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardSummary {
    pub num_samples: usize,
    pub num_violating: usize,
    pub loss: f32,
}

impl ForwardSummary {
    pub fn violating_fraction(&self) -> f32 {
        self.num_violating as f32 / self.num_samples as f32
    }
}

/// Triplet loss layer: forward produces the scalar loss, backward the three
/// input gradients.
pub struct TripletLoss {
    config: TripletLossConfig,
    performance: PerformanceConfig,
    distances: Option<DistanceStage>,
    hinge: Vec<f32>,
    violating: Vec<bool>,
    weights: Vec<f32>,
    loss: f32,
    forwarded: bool,
}

impl TripletLoss {
    /// Build a layer; an invalid margin is rejected here rather than per call.
    pub fn new(config: TripletLossConfig) -> KernelResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            performance: crate::config::get_config().performance,
            distances: None,
            hinge: Vec::new(),
            violating: Vec::new(),
            weights: Vec::new(),
            loss: 0.0,
            forwarded: false,
        })
    }

    pub fn with_margin(margin: f32) -> KernelResult<Self> {
        Self::new(TripletLossConfig::new(margin))
    }

    pub fn with_performance(mut self, performance: PerformanceConfig) -> Self {
        self.performance = performance;
        self
    }

    pub fn margin(&self) -> f32 {
        self.config.margin
    }

    /// Shape the buffers were last sized for.
    pub fn shape(&self) -> Option<Shape<2>> {
        self.distances.as_ref().map(DistanceStage::shape)
    }

    /// Validate input shapes and size every internal buffer for them.
    ///
    /// Invalidates the previous forward pass when the shape changes.
    pub fn reshape(
        &mut self,
        anchor: &SampleBatch,
        positive: &SampleBatch,
        negative: &SampleBatch,
        weights: &SampleWeights,
    ) -> KernelResult<()> {
        let shape = validate_shapes(anchor, positive, negative, weights)?;
        self.resize(shape)
    }

    fn resize(&mut self, shape: Shape<2>) -> KernelResult<()> {
        match self.distances.as_mut() {
            Some(stage) if stage.shape() == shape => return Ok(()),
            Some(stage) => stage.reshape(shape)?,
            None => self.distances = Some(DistanceStage::new(shape)?),
        }

        let num = shape.num();
        self.hinge = vec![0.0; num];
        self.violating = vec![false; num];
        self.weights = vec![0.0; num];
        self.loss = 0.0;
        self.forwarded = false;
        debug!("Triplet loss reshaped to {}", shape);
        Ok(())
    }

    /// Compute the loss and keep the state backward needs.
    pub fn forward(
        &mut self,
        anchor: &SampleBatch,
        positive: &SampleBatch,
        negative: &SampleBatch,
        weights: &SampleWeights,
    ) -> KernelResult<f32> {
        let shape = validate_shapes(anchor, positive, negative, weights)?;
        self.resize(shape)?;
        // A failure below must not leave the previous pass looking valid.
        self.forwarded = false;

        let parallel = self.performance.use_parallel(shape.num());
        let stage = self.distances.as_mut().ok_or_else(|| {
            KernelError::InvalidState("distance buffers missing after reshape".to_string())
        })?;
        stage.compute(anchor, positive, negative, parallel)?;

        let margin = self.config.margin;
        let num = shape.num();
        let mut total = 0.0f32;
        let mut num_violating = 0;

        // Index order keeps the reduction reproducible.
        for i in 0..num {
            // a NaN distance keeps a NaN hinge
            let raw = margin + stage.dist_sq_ap()[i] - stage.dist_sq_an()[i];
            let hinge = if raw > 0.0 || raw.is_nan() { raw } else { 0.0 };
            let active = hinge > 0.0;
            self.hinge[i] = hinge;
            self.violating[i] = active;
            if active {
                num_violating += 1;
            }
            total += weights.as_slice()[i] * hinge;
        }
        self.weights.copy_from_slice(weights.as_slice());

        self.loss = total / (2.0 * num as f32);
        self.forwarded = true;

        debug!(
            samples = num,
            violating = num_violating,
            loss = self.loss,
            "triplet forward"
        );
        Ok(self.loss)
    }

    /// Write the requested gradients into `grads`, scaled by the upstream
    /// gradient `upstream`.
    ///
    /// Requested buffers are overwritten; the others are not touched.
    pub fn backward(
        &self,
        upstream: f32,
        request: GradientRequest,
        grads: &mut GradientBatch,
    ) -> KernelResult<()> {
        self.ensure_forwarded()?;
        if !request.any() {
            trace!("triplet backward: no gradient requested");
            return Ok(());
        }
        for role in TripletRole::ALL {
            if request.is_requested(role) {
                self.check_gradient_shape(role, grads.get(role))?;
            }
        }
        for role in TripletRole::ALL {
            if request.is_requested(role) {
                self.write_gradient(role, upstream, grads.get_mut(role))?;
            }
        }
        Ok(())
    }

    /// Allocate fresh buffers and run [`TripletLoss::backward`] into them.
    /// Unrequested roles come back as zeros.
    pub fn gradients(&self, upstream: f32, request: GradientRequest) -> KernelResult<GradientBatch> {
        let shape = self.ensure_forwarded()?;
        let mut grads = GradientBatch::zeros(shape)?;
        self.backward(upstream, request, &mut grads)?;
        Ok(grads)
    }

    fn check_gradient_shape(&self, role: TripletRole, out: &SampleBatch) -> KernelResult<()> {
        let shape = self.ensure_forwarded()?;
        if out.shape() != shape {
            return Err(KernelError::shape_error(
                &shape.to_string(),
                &out.shape().to_string(),
                None,
            ))
            .with_context(|| {
                ErrorContext::new("triplet_backward")
                    .with_shape(format!("{} gradient {}", role.name(), out.shape()))
                    .with_suggestion("Allocate gradient buffers with the shape of the forward inputs")
            });
        }
        Ok(())
    }

    /// Callers check `out` with `check_gradient_shape` first.
    fn write_gradient(&self, role: TripletRole, upstream: f32, out: &mut SampleBatch) -> KernelResult<()> {
        let stage = self.distances.as_ref().ok_or_else(|| {
            KernelError::InvalidState("backward called before reshape".to_string())
        })?;
        let shape = stage.shape();

        let rule = role.rule();
        let source = stage.difference(rule.source);
        let channels = shape.channels();
        let alpha = rule.sign * upstream / shape.num() as f32;
        trace!(role = role.name(), alpha, "triplet backward");

        let parallel = self.performance.use_parallel(shape.num());
        #[cfg(feature = "parallel")]
        {
            if parallel {
                out.as_slice_mut()
                    .par_chunks_mut(channels)
                    .zip(source.as_slice().par_chunks(channels))
                    .zip(self.weights.par_iter().zip(self.violating.par_iter()))
                    .for_each(|((row, src), (&w, &active))| gradient_row(row, src, alpha * w, active));
                return Ok(());
            }
        }
        #[cfg(not(feature = "parallel"))]
        let _ = parallel;

        for ((row, src), (&w, &active)) in out
            .rows_mut()
            .zip(source.as_slice().chunks_exact(channels))
            .zip(self.weights.iter().zip(&self.violating))
        {
            gradient_row(row, src, alpha * w, active);
        }
        Ok(())
    }

    fn ensure_forwarded(&self) -> KernelResult<Shape<2>> {
        match (&self.distances, self.forwarded) {
            (Some(stage), true) => Ok(stage.shape()),
            _ => Err(KernelError::InvalidState(
                "backward requires a completed forward pass on the current shape".to_string(),
            )),
        }
    }

    /// Scalar loss of the latest forward pass.
    pub fn loss(&self) -> Option<f32> {
        self.forwarded.then_some(self.loss)
    }

    pub fn summary(&self) -> Option<ForwardSummary> {
        self.forwarded.then(|| ForwardSummary {
            num_samples: self.violating.len(),
            num_violating: self.violating.iter().filter(|&&v| v).count(),
            loss: self.loss,
        })
    }

    /// Per-sample hinge values of the latest forward pass.
    pub fn hinge(&self) -> Option<&[f32]> {
        self.forwarded.then_some(self.hinge.as_slice())
    }

    /// `true` where the sample violates the margin and so receives gradient.
    pub fn violation_mask(&self) -> Option<&[bool]> {
        self.forwarded.then_some(self.violating.as_slice())
    }

    /// Distance buffers of the latest forward pass, unmasked.
    pub fn distances(&self) -> Option<&DistanceStage> {
        if self.forwarded {
            self.distances.as_ref()
        } else {
            None
        }
    }

    /// The difference buffer with every non-violating row zeroed.
    pub fn masked_difference(&self, pair: PairDifference) -> KernelResult<SampleBatch> {
        self.ensure_forwarded()?;
        let stage = self.distances.as_ref().ok_or_else(|| {
            KernelError::InvalidState("no distance buffers".to_string())
        })?;

        let mut masked = stage.difference(pair).clone();
        for (row, &active) in masked.rows_mut().zip(&self.violating) {
            if !active {
                row.fill(0.0);
            }
        }
        Ok(masked)
    }
}

fn gradient_row(row: &mut [f32], src: &[f32], scale: f32, active: bool) {
    if active {
        simd::scale(scale, src, row);
    } else {
        row.fill(0.0);
    }
}

fn validate_shapes(
    anchor: &SampleBatch,
    positive: &SampleBatch,
    negative: &SampleBatch,
    weights: &SampleWeights,
) -> KernelResult<Shape<2>> {
    let shape = anchor.shape();
    let context = || {
        ErrorContext::new("triplet_reshape")
            .with_shape(format!("anchor {}", anchor.shape()))
            .with_shape(format!("positive {}", positive.shape()))
            .with_shape(format!("negative {}", negative.shape()))
            .with_shape(format!("weights [{}]", weights.len()))
    };

    for (name, batch) in [("positive", positive), ("negative", negative)] {
        if batch.shape() != shape {
            return Err(KernelError::shape_error(
                &format!("{} like the anchor batch", shape),
                &format!("{} for the {} batch", batch.shape(), name),
                Some("Inputs must have the same dimension"),
            ))
            .with_context(context);
        }
    }
    if weights.len() != shape.num() {
        return Err(KernelError::shape_error(
            &format!("{} sample weights", shape.num()),
            &weights.len().to_string(),
            Some("Supply one weight per triplet"),
        ))
        .with_context(context);
    }
    Ok(shape)
}

impl LossLayer for TripletLoss {
    fn name(&self) -> &'static str {
        "TripletLoss"
    }

    fn num_batches(&self) -> usize {
        TripletRole::ALL.len()
    }

    fn reshape_inputs(&mut self, inputs: &LossInputs<'_>) -> KernelResult<()> {
        let [anchor, positive, negative] = triplet_batches(inputs)?;
        self.reshape(anchor, positive, negative, inputs.weights)
    }

    fn forward_inputs(&mut self, inputs: &LossInputs<'_>) -> KernelResult<f32> {
        let [anchor, positive, negative] = triplet_batches(inputs)?;
        self.forward(anchor, positive, negative, inputs.weights)
    }

    fn backward_inputs(
        &self,
        upstream: f32,
        propagate_down: &[bool],
        grads: &mut [SampleBatch],
    ) -> KernelResult<()> {
        if propagate_down.len() != 3 || grads.len() != 3 {
            return Err(KernelError::InvalidInput(format!(
                "TripletLoss backward expects 3 flags and 3 gradient buffers, got {} and {}",
                propagate_down.len(),
                grads.len()
            )));
        }
        self.ensure_forwarded()?;
        let request = GradientRequest::from_flags([propagate_down[0], propagate_down[1], propagate_down[2]]);
        for role in TripletRole::ALL {
            if request.is_requested(role) {
                self.check_gradient_shape(role, &grads[role.index()])?;
            }
        }
        for role in TripletRole::ALL {
            if request.is_requested(role) {
                self.write_gradient(role, upstream, &mut grads[role.index()])?;
            }
        }
        Ok(())
    }

    fn emits_descent_direction(&self) -> bool {
        true
    }

    fn violation_mask(&self) -> Option<&[bool]> {
        TripletLoss::violation_mask(self)
    }
}

fn triplet_batches<'a>(inputs: &LossInputs<'a>) -> KernelResult<[&'a SampleBatch; 3]> {
    match inputs.batches {
        [anchor, positive, negative] => Ok([*anchor, *positive, *negative]),
        other => Err(KernelError::InvalidInput(format!(
            "TripletLoss takes anchor, positive and negative batches, got {} batches",
            other.len()
        ))),
    }
}
