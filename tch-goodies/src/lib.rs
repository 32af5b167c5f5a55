//! Tensor helpers for region-based detection.

mod common;
pub mod compound_tensor;
pub mod nms_match;
pub mod sampling;
pub mod tensor;

pub use compound_tensor::*;
pub use nms_match::*;
pub use sampling::*;
pub use tensor::*;
