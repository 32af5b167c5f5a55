use crate::common::*;

/// The assignment of candidate boxes to ground truth boxes.
#[derive(Debug, Getters, CopyGetters)]
pub struct AssignResult {
    /// The number of ground truth boxes.
    #[getset(get_copy = "pub")]
    num_gts: usize,
    /// The `[num_preds]` int64 ground truth index of each candidate.
    ///
    /// The value is `0` for negatives, `-1` for ignored candidates and the
    /// 1-based index of the matched ground truth otherwise.
    #[getset(get = "pub")]
    gt_inds: Tensor,
    /// The `[num_preds]` IoU with the matched ground truth.
    #[getset(get = "pub")]
    max_overlaps: Option<Tensor>,
    /// The `[num_preds]` int64 class label of each candidate.
    #[getset(get = "pub")]
    labels: Option<Tensor>,
}

impl AssignResult {
    pub fn new(
        num_gts: usize,
        gt_inds: Tensor,
        max_overlaps: Option<Tensor>,
        labels: Option<Tensor>,
    ) -> Result<Self> {
        let num_preds = gt_inds
            .size1()
            .map_err(|_| format_err!("gt_inds should be a 1d tensor"))?;
        ensure!(
            gt_inds.kind() == Kind::Int64,
            "gt_inds must be of Int64 kind, but get {:?}",
            gt_inds.kind()
        );
        if let Some(max_overlaps) = &max_overlaps {
            ensure!(
                max_overlaps.size() == [num_preds],
                "max_overlaps should have {} elements",
                num_preds
            );
        }
        if let Some(labels) = &labels {
            ensure!(
                labels.size() == [num_preds],
                "labels should have {} elements",
                num_preds
            );
        }
        if num_preds > 0 {
            let max_ind = i64::from(gt_inds.max());
            ensure!(
                max_ind <= num_gts as i64,
                "gt_inds refers to ground truth {}, but there are only {}",
                max_ind,
                num_gts
            );
        }

        Ok(Self {
            num_gts,
            gt_inds,
            max_overlaps,
            labels: labels.map(|labels| labels.to_kind(Kind::Int64)),
        })
    }

    /// The number of candidate boxes.
    pub fn num_preds(&self) -> i64 {
        self.gt_inds.size()[0]
    }

    pub fn device(&self) -> Device {
        self.gt_inds.device()
    }

    /// Indexes of candidates matched to a ground truth.
    pub fn positive_indexes(&self) -> Tensor {
        self.gt_inds.gt(0).nonzero().view([-1])
    }

    /// Indexes of background candidates.
    pub fn negative_indexes(&self) -> Tensor {
        self.gt_inds.eq(0).nonzero().view([-1])
    }

    /// Prepend every ground truth as a candidate matching itself.
    ///
    /// Self-matches have overlap 1. Labels are taken from `gt_labels` when
    /// this result tracks labels.
    pub fn add_gt_(&mut self, gt_labels: Option<&Tensor>) -> Result<()> {
        let num_gts = self.num_gts as i64;
        let device = self.device();

        let self_inds = Tensor::arange_start(1, num_gts + 1, (Kind::Int64, device));
        self.gt_inds = Tensor::cat(&[&self_inds, &self.gt_inds], 0);

        if let Some(max_overlaps) = &self.max_overlaps {
            let ones = Tensor::ones(&[num_gts], (max_overlaps.kind(), device));
            self.max_overlaps = Some(Tensor::cat(&[&ones, max_overlaps], 0));
        }

        if let Some(labels) = &self.labels {
            let gt_labels = gt_labels.ok_or_else(|| {
                format_err!("gt_labels is required when the assign result carries labels")
            })?;
            ensure!(
                gt_labels.size() == [num_gts],
                "expect {} gt_labels, but get {:?}",
                num_gts,
                gt_labels.size()
            );
            let gt_labels = gt_labels.to_kind(Kind::Int64).to_device(device);
            self.labels = Some(Tensor::cat(&[&gt_labels, labels], 0));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_gt_prepends_self_matches() -> Result<()> {
        let mut result = AssignResult::new(
            2,
            Tensor::of_slice(&[0i64, 2, -1, 1]),
            Some(Tensor::of_slice(&[0.1f32, 0.7, 0.4, 0.6])),
            Some(Tensor::of_slice(&[-1i64, 3, -1, 5])),
        )?;
        result.add_gt_(Some(&Tensor::of_slice(&[5i64, 3])))?;

        assert_eq!(result.num_preds(), 6);
        assert_eq!(result.gt_inds().f_to_i64_vec()?, vec![1, 2, 0, 2, -1, 1]);
        assert_eq!(
            result.max_overlaps().as_ref().unwrap().f_to_f32_vec()?,
            vec![1.0, 1.0, 0.1, 0.7, 0.4, 0.6]
        );
        assert_eq!(
            result.labels().as_ref().unwrap().f_to_i64_vec()?,
            vec![5, 3, -1, 3, -1, 5]
        );
        Ok(())
    }

    #[test]
    fn ignored_candidates_are_neither_positive_nor_negative() -> Result<()> {
        let result = AssignResult::new(1, Tensor::of_slice(&[0i64, 1, -1, 0]), None, None)?;
        assert_eq!(result.positive_indexes().f_to_i64_vec()?, vec![1]);
        assert_eq!(result.negative_indexes().f_to_i64_vec()?, vec![0, 3]);
        Ok(())
    }

    #[test]
    fn invalid_records_are_rejected() {
        assert!(AssignResult::new(1, Tensor::of_slice(&[0i64, 2]), None, None).is_err());
        assert!(AssignResult::new(1, Tensor::of_slice(&[0f32, 1.0]), None, None).is_err());
        assert!(AssignResult::new(
            1,
            Tensor::of_slice(&[0i64, 1]),
            Some(Tensor::of_slice(&[0.5f32])),
            None
        )
        .is_err());
    }

    #[test]
    fn labels_require_gt_labels() -> Result<()> {
        let mut result = AssignResult::new(
            1,
            Tensor::of_slice(&[0i64, 1]),
            None,
            Some(Tensor::of_slice(&[-1i64, 2])),
        )?;
        assert!(result.add_gt_(None).is_err());
        Ok(())
    }
}
