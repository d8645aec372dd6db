//! Pairwise differences and squared Euclidean distances of a triplet batch

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{
    error::{KernelError, KernelResult},
    tensor::{simd, SampleBatch, Shape},
};

/// Which pair of inputs a difference buffer was taken between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairDifference {
    /// anchor − positive
    AnchorPositive,
    /// anchor − negative
    AnchorNegative,
    /// positive − negative
    PositiveNegative,
}

impl PairDifference {
    pub const ALL: [PairDifference; 3] = [
        PairDifference::AnchorPositive,
        PairDifference::AnchorNegative,
        PairDifference::PositiveNegative,
    ];
}

/// Owns the difference and distance buffers of one triplet layer.
///
/// Buffers are sized by [`DistanceStage::reshape`] and overwritten by every
/// call to [`DistanceStage::compute`].
#[derive(Debug, Clone)]
pub struct DistanceStage {
    shape: Shape<2>,
    diff_ap: SampleBatch,
    diff_an: SampleBatch,
    diff_pn: SampleBatch,
    dist_sq_ap: Vec<f32>,
    dist_sq_an: Vec<f32>,
}

impl DistanceStage {
    pub fn new(shape: Shape<2>) -> KernelResult<Self> {
        let zeros = SampleBatch::zeros(shape.num(), shape.channels())?;
        Ok(Self {
            shape,
            diff_ap: zeros.clone(),
            diff_an: zeros.clone(),
            diff_pn: zeros,
            dist_sq_ap: vec![0.0; shape.num()],
            dist_sq_an: vec![0.0; shape.num()],
        })
    }

    /// Resize the buffers for `shape`; a no-op when the shape is unchanged.
    pub fn reshape(&mut self, shape: Shape<2>) -> KernelResult<()> {
        if shape != self.shape {
            *self = Self::new(shape)?;
        }
        Ok(())
    }

    pub fn shape(&self) -> Shape<2> {
        self.shape
    }

    /// Fill every buffer from the three input batches.
    pub fn compute(
        &mut self,
        anchor: &SampleBatch,
        positive: &SampleBatch,
        negative: &SampleBatch,
        parallel: bool,
    ) -> KernelResult<()> {
        for (name, batch) in [("anchor", anchor), ("positive", positive), ("negative", negative)] {
            if batch.shape() != self.shape {
                return Err(KernelError::shape_error(
                    &self.shape.to_string(),
                    &format!("{} for the {} batch", batch.shape(), name),
                    Some("Reshape the layer before feeding batches of a new size"),
                ));
            }
        }

        let channels = self.shape.channels();
        difference(anchor.as_slice(), positive.as_slice(), self.diff_ap.as_slice_mut(), channels, parallel);
        difference(anchor.as_slice(), negative.as_slice(), self.diff_an.as_slice_mut(), channels, parallel);
        difference(positive.as_slice(), negative.as_slice(), self.diff_pn.as_slice_mut(), channels, parallel);

        squared_norms(self.diff_ap.as_slice(), &mut self.dist_sq_ap, channels, parallel);
        squared_norms(self.diff_an.as_slice(), &mut self.dist_sq_an, channels, parallel);

        Ok(())
    }

    pub fn difference(&self, pair: PairDifference) -> &SampleBatch {
        match pair {
            PairDifference::AnchorPositive => &self.diff_ap,
            PairDifference::AnchorNegative => &self.diff_an,
            PairDifference::PositiveNegative => &self.diff_pn,
        }
    }

    /// `|anchor[i] - positive[i]|²` per sample.
    pub fn dist_sq_ap(&self) -> &[f32] {
        &self.dist_sq_ap
    }

    /// `|anchor[i] - negative[i]|²` per sample.
    pub fn dist_sq_an(&self) -> &[f32] {
        &self.dist_sq_an
    }
}

#[cfg_attr(not(feature = "parallel"), allow(unused_variables))]
fn difference(lhs: &[f32], rhs: &[f32], out: &mut [f32], channels: usize, parallel: bool) {
    #[cfg(feature = "parallel")]
    {
        if parallel {
            out.par_chunks_mut(channels)
                .zip(lhs.par_chunks(channels).zip(rhs.par_chunks(channels)))
                .for_each(|(o, (l, r))| simd::sub(l, r, o));
            return;
        }
    }

    simd::sub(lhs, rhs, out);
}

#[cfg_attr(not(feature = "parallel"), allow(unused_variables))]
fn squared_norms(diff: &[f32], out: &mut [f32], channels: usize, parallel: bool) {
    #[cfg(feature = "parallel")]
    {
        if parallel {
            out.par_iter_mut()
                .zip(diff.par_chunks(channels))
                .for_each(|(d, row)| *d = simd::squared_norm(row));
            return;
        }
    }

    for (d, row) in out.iter_mut().zip(diff.chunks_exact(channels)) {
        *d = simd::squared_norm(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(rows: &[[f32; 2]]) -> SampleBatch {
        SampleBatch::from_rows(rows).unwrap()
    }

    #[test]
    fn test_differences_and_distances() {
        let anchor = batch(&[[0.0, 0.0], [1.0, 2.0]]);
        let positive = batch(&[[3.0, 4.0], [1.0, 1.0]]);
        let negative = batch(&[[1.0, 0.0], [-1.0, 2.0]]);

        let mut stage = DistanceStage::new(anchor.shape()).unwrap();
        stage.compute(&anchor, &positive, &negative, false).unwrap();

        assert_eq!(stage.difference(PairDifference::AnchorPositive).as_slice(), &[-3.0, -4.0, 0.0, 1.0]);
        assert_eq!(stage.difference(PairDifference::AnchorNegative).as_slice(), &[-1.0, 0.0, 2.0, 0.0]);
        assert_eq!(stage.difference(PairDifference::PositiveNegative).as_slice(), &[2.0, 4.0, 2.0, -1.0]);
        assert_eq!(stage.dist_sq_ap(), &[25.0, 1.0]);
        assert_eq!(stage.dist_sq_an(), &[1.0, 4.0]);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let rows: Vec<[f32; 3]> = (0..64)
            .map(|i| {
                let x = i as f32;
                [x * 0.25, -x * 0.5, (x % 7.0) - 3.0]
            })
            .collect();
        let anchor = SampleBatch::from_rows(&rows).unwrap();
        let positive = SampleBatch::from_rows(&rows.iter().map(|r| [r[1], r[2], r[0]]).collect::<Vec<_>>()).unwrap();
        let negative = SampleBatch::from_rows(&rows.iter().map(|r| [r[2], r[0], -r[1]]).collect::<Vec<_>>()).unwrap();

        let mut serial = DistanceStage::new(anchor.shape()).unwrap();
        serial.compute(&anchor, &positive, &negative, false).unwrap();
        let mut parallel = DistanceStage::new(anchor.shape()).unwrap();
        parallel.compute(&anchor, &positive, &negative, true).unwrap();

        for pair in PairDifference::ALL {
            assert_eq!(serial.difference(pair), parallel.difference(pair));
        }
        assert_eq!(serial.dist_sq_ap(), parallel.dist_sq_ap());
        assert_eq!(serial.dist_sq_an(), parallel.dist_sq_an());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let anchor = batch(&[[0.0, 0.0]]);
        let wide = SampleBatch::from_rows(&[[0.0, 0.0, 0.0]]).unwrap();

        let mut stage = DistanceStage::new(anchor.shape()).unwrap();
        let err = stage.compute(&anchor, &wide, &anchor, false).unwrap_err();
        assert!(matches!(err, KernelError::ShapeError(_)));
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_reshape_resizes_buffers() {
        let mut stage = DistanceStage::new(Shape::new([2, 2])).unwrap();
        stage.reshape(Shape::new([5, 3])).unwrap();
        assert_eq!(stage.shape(), Shape::new([5, 3]));
        assert_eq!(stage.dist_sq_ap().len(), 5);
        assert_eq!(stage.difference(PairDifference::PositiveNegative).shape(), Shape::new([5, 3]));
        assert!(stage.reshape(Shape::new([0, 3])).is_err());
    }
}
