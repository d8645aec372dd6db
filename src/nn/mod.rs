//! Neural network components

pub mod gradcheck;
pub mod losses;

pub use gradcheck::{GradientChecker, GradientReport};
pub use losses::*;
