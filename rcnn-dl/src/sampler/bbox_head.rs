use crate::{bbox_coder::DeltaXywhCoder, common::*};

/// The classification and box regression head consulted by samplers.
pub trait BboxHead {
    /// The number of foreground classes. The background class takes the
    /// last score column.
    fn num_classes(&self) -> usize;

    /// Score pooled RoI features.
    ///
    /// Returns `[num_rois, num_classes + 1]` class logits and box deltas in
    /// either `[num_rois, num_classes * 4]` or class-agnostic
    /// `[num_rois, 4]` layout.
    fn score_and_regress(&self, roi_feats: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Apply `[num_rois, 4]` deltas to RoI boxes.
    fn decode(&self, boxes: &BoxTensor, deltas: &Tensor) -> Result<BoxTensor> {
        DeltaXywhCoder::default().decode(boxes, deltas, None)
    }
}
