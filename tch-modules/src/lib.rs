//! Neural network modules for region feature extraction.

mod common;
pub mod feature_level_mapper;
pub mod multi_level_roi_extractor;
pub mod roi_align;

pub use feature_level_mapper::*;
pub use multi_level_roi_extractor::*;
pub use roi_align::*;
