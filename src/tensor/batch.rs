//! Dense row-major sample batches and per-sample weights

use std::slice::{ChunksExact, ChunksExactMut};

use crate::error::{KernelError, KernelResult};
use super::shape::Shape;

/// `num` rows of `channels` features, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    data: Vec<f32>,
    shape: Shape<2>,
}

impl SampleBatch {
    /// Create from a flat row-major buffer
    pub fn from_vec(data: Vec<f32>, shape: Shape<2>) -> KernelResult<Self> {
        if !shape.is_valid() {
            return Err(KernelError::shape_error(
                "at least one sample and one channel",
                &shape.to_string(),
                None,
            ));
        }
        if data.len() != shape.total_elements() {
            return Err(KernelError::shape_error(
                &format!("{} values for shape {}", shape.total_elements(), shape),
                &format!("{} values", data.len()),
                Some("Flatten the batch row-major: sample by sample, channel by channel"),
            ));
        }
        Ok(Self { data, shape })
    }

    /// Create from one slice per sample
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> KernelResult<Self> {
        let channels = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * channels);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != channels {
                return Err(KernelError::shape_error(
                    &format!("{} channels", channels),
                    &format!("{} channels in row {}", row.len(), i),
                    None,
                ));
            }
            data.extend_from_slice(row);
        }
        Self::from_vec(data, Shape::new([rows.len(), channels]))
    }

    pub fn zeros(num: usize, channels: usize) -> KernelResult<Self> {
        let shape = Shape::new_validated([num, channels])?;
        Ok(Self {
            data: vec![0.0; shape.total_elements()],
            shape,
        })
    }

    pub fn zeros_like(other: &SampleBatch) -> Self {
        Self {
            data: vec![0.0; other.data.len()],
            shape: other.shape,
        }
    }

    pub fn shape(&self) -> Shape<2> {
        self.shape
    }

    pub fn num(&self) -> usize {
        self.shape.num()
    }

    pub fn channels(&self) -> usize {
        self.shape.channels()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Features of sample `i`.
    ///
    /// # Panics
    /// If `i >= self.num()`.
    pub fn row(&self, i: usize) -> &[f32] {
        let c = self.channels();
        &self.data[i * c..(i + 1) * c]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let c = self.channels();
        &mut self.data[i * c..(i + 1) * c]
    }

    pub fn rows(&self) -> ChunksExact<'_, f32> {
        self.data.chunks_exact(self.shape.channels())
    }

    pub fn rows_mut(&mut self) -> ChunksExactMut<'_, f32> {
        let c = self.shape.channels();
        self.data.chunks_exact_mut(c)
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Non-negative per-sample weights supplied by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWeights(Vec<f32>);

impl SampleWeights {
    pub fn new(weights: Vec<f32>) -> KernelResult<Self> {
        if let Some((i, w)) = weights.iter().enumerate().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(KernelError::InvalidInput(format!(
                "sample weight {} must be finite and non-negative, got {}",
                i, w
            )));
        }
        Ok(Self(weights))
    }

    pub fn ones(num: usize) -> Self {
        Self(vec![1.0; num])
    }

    /// Every weight multiplied by `factor`.
    pub fn scaled(&self, factor: f32) -> KernelResult<Self> {
        Self::new(self.0.iter().map(|w| w * factor).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl TryFrom<Vec<f32>> for SampleWeights {
    type Error = KernelError;

    fn try_from(weights: Vec<f32>) -> KernelResult<Self> {
        Self::new(weights)
    }
}
