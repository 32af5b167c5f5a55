use super::{AssignResult, Sampler, SamplerBase, SamplingResult};
use crate::common::*;

/// Random sampler initializer.
#[derive(Debug, Clone)]
pub struct RandomSamplerInit {
    pub base: SamplerBase,
}

impl RandomSamplerInit {
    pub fn new(num: usize, pos_fraction: R64) -> Self {
        Self {
            base: SamplerBase::new(num, pos_fraction),
        }
    }

    pub fn build(self) -> Result<RandomSampler> {
        let Self { base } = self;
        base.validate()?;
        Ok(RandomSampler { base })
    }
}

/// Draws positives and negatives uniformly at random.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    base: SamplerBase,
}

impl RandomSampler {
    pub fn base(&self) -> &SamplerBase {
        &self.base
    }
}

impl Sampler for RandomSampler {
    fn sample<R>(
        &self,
        rng: &mut R,
        assign_result: &mut AssignResult,
        bboxes: &BoxTensor,
        gt_bboxes: &BoxTensor,
        gt_labels: Option<&Tensor>,
        _feats: &[Tensor],
    ) -> Result<SamplingResult>
    where
        R: Rng + ?Sized,
    {
        let base = &self.base;
        let (bboxes, gt_flags) =
            base.prepare_candidates(assign_result, bboxes, gt_bboxes, gt_labels)?;

        let pos_inds = base.sample_pos(rng, assign_result, base.num_expected_pos())?;
        let num_pos = pos_inds.size()[0] as usize;
        let num_expected_neg = base.num_expected_neg(num_pos);
        let neg_inds = base.sample_neg(rng, assign_result, num_expected_neg)?;
        debug!(
            "sampled {} positives and {} negatives out of {} candidates",
            num_pos,
            neg_inds.size()[0],
            bboxes.num_boxes()
        );

        SamplingResult::new(
            pos_inds,
            neg_inds,
            &bboxes,
            gt_bboxes,
            assign_result,
            &gt_flags,
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_boxes(num: usize) -> BoxTensor {
        let values: Vec<f32> = (0..num)
            .flat_map(|index| {
                let x = (index % 10) as f32 * 20.0;
                let y = (index / 10) as f32 * 20.0;
                [x, y, x + 16.0, y + 16.0]
            })
            .collect();
        Tensor::of_slice(&values)
            .view([num as i64, 4])
            .try_into()
            .unwrap()
    }

    #[test]
    fn sample_counts_follow_fraction() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(9);
        let sampler = RandomSamplerInit {
            base: SamplerBase {
                add_gt_as_proposals: false,
                ..SamplerBase::new(16, r64(0.25))
            },
        }
        .build()?;

        let gt_inds: Vec<i64> = (0..50).map(|i| if i < 10 { 1 } else { 0 }).collect();
        let mut assign_result = AssignResult::new(1, Tensor::of_slice(&gt_inds), None, None)?;
        let gt_bboxes = grid_boxes(1);

        let result = sampler.sample(
            &mut rng,
            &mut assign_result,
            &grid_boxes(50),
            &gt_bboxes,
            None,
            &[],
        )?;
        assert_eq!(result.num_pos(), 4);
        assert_eq!(result.num_neg(), 12);
        assert!(result.neg_label_weights().is_none());
        assert!(result
            .neg_inds()
            .f_to_i64_vec()?
            .iter()
            .all(|&index| index >= 10));
        assert_eq!(result.pos_gt_bboxes().num_boxes(), 4);
        assert_eq!(result.pos_assigned_gt_inds().f_to_i64_vec()?, vec![0; 4]);
        assert_eq!(result.bboxes().num_boxes(), 16);
        Ok(())
    }

    #[test]
    fn gt_proposals_become_positives() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let sampler = RandomSamplerInit::new(8, r64(0.5)).build()?;
        let mut assign_result = AssignResult::new(
            2,
            Tensor::zeros(&[6], tch::kind::INT64_CPU),
            None,
            Some(Tensor::full(&[6], -1i64, tch::kind::INT64_CPU)),
        )?;
        let gt_bboxes = grid_boxes(2);
        let gt_labels = Tensor::of_slice(&[3i64, 7]);

        let result = sampler.sample(
            &mut rng,
            &mut assign_result,
            &grid_boxes(6),
            &gt_bboxes,
            Some(&gt_labels),
            &[],
        )?;
        assert_eq!(result.num_pos(), 2);
        assert_eq!(result.num_neg(), 6);
        assert_eq!(
            result.pos_is_gt().to_kind(Kind::Int64).f_to_i64_vec()?,
            vec![1, 1]
        );
        let mut labels = result
            .pos_gt_labels()
            .as_ref()
            .unwrap()
            .f_to_i64_vec()?;
        labels.sort_unstable();
        assert_eq!(labels, vec![3, 7]);
        Ok(())
    }

    #[test]
    fn no_ground_truth_gives_empty_targets() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let sampler = RandomSamplerInit::new(4, r64(0.5)).build()?;
        let mut assign_result =
            AssignResult::new(0, Tensor::zeros(&[3], tch::kind::INT64_CPU), None, None)?;
        let result = sampler.sample(
            &mut rng,
            &mut assign_result,
            &grid_boxes(3),
            &BoxTensor::empty(Device::Cpu),
            None,
            &[],
        )?;
        assert_eq!(result.num_pos(), 0);
        assert_eq!(result.num_neg(), 3);
        assert_eq!(result.pos_gt_bboxes().boxes().size(), vec![0, 4]);
        Ok(())
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        assert!(RandomSamplerInit::new(4, r64(1.5)).build().is_err());
    }
}
