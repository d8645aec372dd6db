//! Dense sample batches and the SIMD row kernels that operate on them
//!
//! Everything here is row-major `f32`: a batch is `num` samples of
//! `channels` features each.

pub mod batch;
pub mod shape;
pub mod simd;

pub use batch::{SampleBatch, SampleWeights};
pub use shape::Shape;
