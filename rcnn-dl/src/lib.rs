//! Building blocks of two-stage region-based detectors.

mod common;
pub mod bbox_coder;
pub mod config;
pub mod sampler;
