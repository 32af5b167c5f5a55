//! Positive and negative RoI samplers.

mod assign_result;
mod base;
mod bbox_head;
mod random_sampler;
mod sampling_result;
mod score_hlr_sampler;

pub use assign_result::*;
pub use base::*;
pub use bbox_head::*;
pub use random_sampler::*;
pub use sampling_result::*;
pub use score_hlr_sampler::*;
