//! Checked tensors of boxes and RoIs.

mod boxes;
mod roi;

pub use boxes::*;
pub use roi::*;
