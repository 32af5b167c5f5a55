use super::AssignResult;
use crate::common::*;

/// The positive and negative candidates chosen by a sampler.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct SamplingResult {
    /// Indexes of positive candidates.
    pos_inds: Tensor,
    /// Indexes of negative candidates.
    neg_inds: Tensor,
    /// Boxes of positive candidates.
    pos_bboxes: BoxTensor,
    /// Boxes of negative candidates.
    neg_bboxes: BoxTensor,
    /// Whether each positive candidate is a ground truth box added as a proposal.
    pos_is_gt: Tensor,
    /// The 0-based ground truth index of each positive candidate.
    pos_assigned_gt_inds: Tensor,
    /// The matched ground truth box of each positive candidate.
    pos_gt_bboxes: BoxTensor,
    /// The class label of each positive candidate, if the assignment has labels.
    pos_gt_labels: Option<Tensor>,
    /// Per-negative classification loss weights, aligned with `neg_inds`.
    neg_label_weights: Option<Tensor>,
}

impl SamplingResult {
    /// Gather the views of a sampling decision.
    ///
    /// `bboxes` and `gt_flags` cover every candidate, including ground truth
    /// boxes prepended as proposals.
    pub fn new(
        pos_inds: Tensor,
        neg_inds: Tensor,
        bboxes: &BoxTensor,
        gt_bboxes: &BoxTensor,
        assign_result: &AssignResult,
        gt_flags: &Tensor,
        neg_label_weights: Option<Tensor>,
    ) -> Result<Self> {
        ensure!(
            bboxes.num_boxes() == assign_result.num_preds(),
            "expect {} candidate boxes, but get {}",
            assign_result.num_preds(),
            bboxes.num_boxes()
        );
        if let Some(weights) = &neg_label_weights {
            ensure!(
                weights.size() == neg_inds.size(),
                "neg_label_weights and neg_inds should have the same shape"
            );
        }

        let pos_bboxes = bboxes.index_select(&pos_inds);
        let neg_bboxes = bboxes.index_select(&neg_inds);
        let pos_is_gt = gt_flags.index_select(0, &pos_inds);
        let pos_assigned_gt_inds = assign_result.gt_inds().index_select(0, &pos_inds) - 1;

        let pos_gt_bboxes = if gt_bboxes.num_boxes() == 0 {
            ensure!(
                pos_inds.size()[0] == 0,
                "positive candidates exist without ground truth"
            );
            BoxTensor::empty(bboxes.device())
        } else {
            gt_bboxes.index_select(&pos_assigned_gt_inds)
        };

        let pos_gt_labels = assign_result
            .labels()
            .as_ref()
            .map(|labels| labels.index_select(0, &pos_inds));

        Ok(Self {
            pos_inds,
            neg_inds,
            pos_bboxes,
            neg_bboxes,
            pos_is_gt,
            pos_assigned_gt_inds,
            pos_gt_bboxes,
            pos_gt_labels,
            neg_label_weights,
        })
    }

    pub fn num_pos(&self) -> i64 {
        self.pos_inds.size()[0]
    }

    pub fn num_neg(&self) -> i64 {
        self.neg_inds.size()[0]
    }

    /// Positive boxes followed by negative boxes.
    pub fn bboxes(&self) -> BoxTensor {
        BoxTensor::cat(&[&self.pos_bboxes, &self.neg_bboxes])
    }
}
