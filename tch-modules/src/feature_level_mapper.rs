use crate::common::*;

/// Added to the scale ratio before taking the logarithm so that zero-area
/// boxes do not produce `log2(0)`.
pub const LEVEL_EPSILON: f64 = 1e-6;

/// Maps RoIs to feature pyramid levels by their scale.
///
/// With `s = sqrt(w * h)` and `f` the finest scale, a RoI is assigned to
/// level `clamp(floor(log2(s / f + 1e-6)), 0, num_levels - 1)`. For four
/// levels this gives the half-open bands
///
/// - `s < 2f`: level 0
/// - `2f <= s < 4f`: level 1
/// - `4f <= s < 8f`: level 2
/// - `s >= 8f`: level 3
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureLevelMapper {
    finest_scale: f64,
    num_levels: usize,
}

impl FeatureLevelMapper {
    pub fn new(finest_scale: f64, num_levels: usize) -> Result<Self> {
        ensure!(finest_scale > 0.0, "finest_scale must be positive");
        ensure!(num_levels > 0, "num_levels must be positive");
        Ok(Self {
            finest_scale,
            num_levels,
        })
    }

    pub fn finest_scale(&self) -> f64 {
        self.finest_scale
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// The pyramid level of a single box.
    pub fn level_of<R>(&self, rect: &R) -> usize
    where
        R: Rect<Type = f64>,
    {
        let max_level = (self.num_levels - 1) as f64;
        let scale = (rect.w() * rect.h()).max(0.0).sqrt();
        let level = (scale / self.finest_scale + LEVEL_EPSILON).log2().floor();
        level.max(0.0).min(max_level) as usize
    }

    /// The pyramid levels of a RoI set as an int64 tensor of shape `[num_rois]`.
    pub fn map_levels(&self, rois: &RoiTensor) -> Tensor {
        let max_level = (self.num_levels - 1) as f64;
        let boxes = rois.boxes();
        let scale = (boxes.w() * boxes.h())
            .to_kind(Kind::Double)
            .clamp_min(0.0)
            .sqrt();
        (scale / self.finest_scale + LEVEL_EPSILON)
            .log2()
            .floor()
            .clamp(0.0, max_level)
            .to_kind(Kind::Int64)
    }
}

impl Default for FeatureLevelMapper {
    fn default() -> Self {
        Self {
            finest_scale: 56.0,
            num_levels: 4,
        }
    }
}
