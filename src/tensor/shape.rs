//! Compile-time ranked shapes

use std::fmt::{self, Display};

use crate::error::{KernelError, KernelResult};

/// Shape with const generics for rank safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape<const DIMS: usize> {
    pub dims: [usize; DIMS],
}

impl<const DIMS: usize> Shape<DIMS> {
    pub fn new(dims: [usize; DIMS]) -> Self {
        Self { dims }
    }

    /// Like [`Shape::new`] but rejects empty dimensions.
    pub fn new_validated(dims: [usize; DIMS]) -> KernelResult<Self> {
        let shape = Self { dims };
        if !shape.is_valid() {
            return Err(KernelError::ShapeError(format!(
                "every dimension must be at least 1, got {}",
                shape
            )));
        }
        Ok(shape)
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_valid(&self) -> bool {
        self.dims.iter().all(|&d| d > 0)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }
}

/// Sample-major batch layout: `[num, channels]`.
impl Shape<2> {
    pub fn num(&self) -> usize { self.dims[0] }
    pub fn channels(&self) -> usize { self.dims[1] }
}

impl<const DIMS: usize> Display for Shape<DIMS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.dims.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", "))
    }
}
