use super::{AssignResult, SamplingResult};
use crate::common::*;

/// Chooses positive and negative candidates for training the box head.
pub trait Sampler {
    /// Sample candidates of one image.
    ///
    /// `bboxes` holds the `[num_preds, 4]` candidates and `feats` the feature
    /// pyramid of this image, with a batch size of 1 on every level. Ground
    /// truth boxes may be prepended to the candidates, in which case
    /// `assign_result` is updated in place.
    fn sample<R>(
        &self,
        rng: &mut R,
        assign_result: &mut AssignResult,
        bboxes: &BoxTensor,
        gt_bboxes: &BoxTensor,
        gt_labels: Option<&Tensor>,
        feats: &[Tensor],
    ) -> Result<SamplingResult>
    where
        R: Rng + ?Sized;
}

/// Sample counts and proposal options shared by samplers.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerBase {
    /// The total number of samples.
    pub num: usize,
    /// The fraction of positives in `num`.
    pub pos_fraction: R64,
    /// Upper bound of the negative to positive ratio.
    pub neg_pos_ub: Option<R64>,
    /// Prepend ground truth boxes to the candidates.
    pub add_gt_as_proposals: bool,
}

impl SamplerBase {
    pub fn new(num: usize, pos_fraction: R64) -> Self {
        Self {
            num,
            pos_fraction,
            neg_pos_ub: None,
            add_gt_as_proposals: true,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.pos_fraction.raw()),
            "pos_fraction must be in range [0, 1]"
        );
        if let Some(neg_pos_ub) = self.neg_pos_ub {
            ensure!(neg_pos_ub >= 0.0, "neg_pos_ub must be non-negative");
        }
        Ok(())
    }

    /// The cap on the number of positives.
    pub fn num_expected_pos(&self) -> usize {
        (self.num as f64 * self.pos_fraction.raw()).floor() as usize
    }

    /// The number of negatives to draw given the positives actually drawn.
    pub fn num_expected_neg(&self, num_sampled_pos: usize) -> usize {
        let num_expected = self.num.saturating_sub(num_sampled_pos);
        match self.neg_pos_ub {
            Some(neg_pos_ub) => {
                let upper_bound = (neg_pos_ub.raw() * num_sampled_pos.max(1) as f64) as usize;
                num_expected.min(upper_bound)
            }
            None => num_expected,
        }
    }

    /// Optionally prepend ground truth boxes to the candidates.
    ///
    /// Returns the candidate boxes and their `[num_preds]` bool flags telling
    /// whether a candidate is a ground truth box.
    pub fn prepare_candidates(
        &self,
        assign_result: &mut AssignResult,
        bboxes: &BoxTensor,
        gt_bboxes: &BoxTensor,
        gt_labels: Option<&Tensor>,
    ) -> Result<(BoxTensor, Tensor)> {
        let device = bboxes.device();
        let gt_flags = Tensor::zeros(&[bboxes.num_boxes()], (Kind::Bool, device));

        if !self.add_gt_as_proposals || gt_bboxes.num_boxes() == 0 {
            return Ok((bboxes.shallow_clone(), gt_flags));
        }

        ensure!(
            gt_bboxes.num_boxes() == assign_result.num_gts() as i64,
            "expect {} ground truth boxes, but get {}",
            assign_result.num_gts(),
            gt_bboxes.num_boxes()
        );
        assign_result.add_gt_(gt_labels)?;

        let gt_bboxes = gt_bboxes
            .to_device(device)
            .boxes()
            .to_kind(bboxes.boxes().kind());
        let bboxes: BoxTensor = Tensor::cat(&[&gt_bboxes, bboxes.boxes()], 0).try_into()?;
        let gt_ones = Tensor::ones(&[gt_bboxes.size()[0]], (Kind::Bool, device));
        let gt_flags = Tensor::cat(&[gt_ones, gt_flags], 0);
        Ok((bboxes, gt_flags))
    }

    /// Uniformly pick at most `num_expected` positives.
    pub fn sample_pos<R>(
        &self,
        rng: &mut R,
        assign_result: &AssignResult,
        num_expected: usize,
    ) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        sample_at_most(rng, &assign_result.positive_indexes(), num_expected)
    }

    /// Uniformly pick at most `num_expected` negatives.
    pub fn sample_neg<R>(
        &self,
        rng: &mut R,
        assign_result: &AssignResult,
        num_expected: usize,
    ) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        sample_at_most(rng, &assign_result.negative_indexes(), num_expected)
    }
}

fn sample_at_most<R>(rng: &mut R, gallery: &Tensor, num_expected: usize) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let len = gallery.size()[0] as usize;
    if len <= num_expected {
        Ok(gallery.shallow_clone())
    } else {
        tch_goodies::random_choice(rng, gallery, num_expected)
    }
}
