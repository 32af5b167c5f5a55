use super::{AssignResult, BboxHead, Sampler, SamplerBase, SamplingResult};
use crate::common::*;
use tch_modules::MultiLevelRoiExtractor;

/// The offset of in-cluster importance.
///
/// A negative ranked `r` in its NMS cluster receives importance
/// `offset - r + score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceBase {
    /// The size of the cluster. Leaders of large clusters rank first.
    ClusterSize,
    /// The number of valid negatives. Cluster leaders interleave across
    /// clusters by score.
    NumValid,
}

impl ImportanceBase {
    fn offset(&self, cluster_size: usize, num_valid: usize) -> f32 {
        match self {
            Self::ClusterSize => cluster_size as f32,
            Self::NumValid => num_valid as f32,
        }
    }
}

impl Default for ImportanceBase {
    fn default() -> Self {
        Self::ClusterSize
    }
}

/// Score-based hard negative sampler initializer.
#[derive(Debug, Clone)]
pub struct ScoreHlrSamplerInit {
    pub base: SamplerBase,
    /// The power of the weight mapping.
    pub k: R64,
    /// The shift of the weight mapping.
    pub bias: R64,
    /// Negatives with max foreground score above this value are valid.
    pub score_thr: R64,
    /// The IoU threshold of NMS grouping.
    pub iou_threshold: R64,
    pub importance_base: ImportanceBase,
}

impl ScoreHlrSamplerInit {
    pub fn new(num: usize, pos_fraction: R64) -> Self {
        Self {
            base: SamplerBase::new(num, pos_fraction),
            k: r64(0.5),
            bias: r64(0.0),
            score_thr: r64(0.05),
            iou_threshold: r64(0.5),
            importance_base: ImportanceBase::default(),
        }
    }

    pub fn build<'a, H>(
        self,
        extractor: &'a MultiLevelRoiExtractor,
        head: &'a H,
    ) -> Result<ScoreHlrSampler<'a, H>>
    where
        H: BboxHead,
    {
        let Self {
            base,
            k,
            bias,
            score_thr,
            iou_threshold,
            importance_base,
        } = self;

        base.validate()?;
        ensure!(k >= 0.0, "k must be non-negative");
        ensure!((0.0..=1.0).contains(&bias.raw()), "bias must be in range [0, 1]");
        ensure!(
            (0.0..=1.0).contains(&score_thr.raw()),
            "score_thr must be in range [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&iou_threshold.raw()),
            "iou_threshold must be in range [0, 1]"
        );
        ensure!(head.num_classes() > 0, "the box head has no foreground class");

        Ok(ScoreHlrSampler {
            base,
            k,
            bias,
            score_thr,
            iou_threshold,
            importance_base,
            extractor,
            head,
        })
    }
}

/// Importance-based sample reweighting of negatives.
///
/// Negatives are scored by the box head. Confidently wrong negatives are
/// grouped by the overlap of their predicted boxes and ranked by in-cluster
/// importance. The top ranked ones are drawn and their classification loss
/// weights decay with rank, normalized so that the weighted loss sum equals
/// the plain loss sum of the drawn negatives.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct ScoreHlrSampler<'a, H> {
    base: SamplerBase,
    k: R64,
    bias: R64,
    score_thr: R64,
    iou_threshold: R64,
    importance_base: ImportanceBase,
    #[derivative(Debug = "ignore")]
    extractor: &'a MultiLevelRoiExtractor,
    #[derivative(Debug = "ignore")]
    head: &'a H,
}

impl<'a, H> ScoreHlrSampler<'a, H>
where
    H: BboxHead,
{
    pub fn base(&self) -> &SamplerBase {
        &self.base
    }

    /// Draw at most `num_expected` negatives.
    ///
    /// `feats` is the feature pyramid of this image alone, so every level
    /// must have a batch size of 1. Returns the negative indexes and their
    /// loss weights in the same order.
    pub fn sample_neg<R>(
        &self,
        rng: &mut R,
        assign_result: &AssignResult,
        num_expected: usize,
        bboxes: &BoxTensor,
        feats: &[Tensor],
    ) -> Result<(Tensor, Tensor)>
    where
        R: Rng + ?Sized,
    {
        tch::no_grad(|| {
            for (level, feat) in feats.iter().enumerate() {
                ensure!(
                    feat.size().first() == Some(&1),
                    "expect the features of a single image, but level {} has shape {:?}",
                    level,
                    feat.size()
                );
            }

            let device = bboxes.device();
            let neg_inds = assign_result.negative_indexes();
            let num_neg = neg_inds.size()[0] as usize;
            let num_expected = num_expected.min(num_neg);

            if num_expected == 0 {
                return Ok((
                    Tensor::zeros(&[0], (Kind::Int64, device)),
                    Tensor::zeros(&[0], (Kind::Float, device)),
                ));
            }

            let neg_bboxes = bboxes.index_select(&neg_inds);
            let rois = RoiTensor::from_boxes(&[&neg_bboxes]);
            let roi_feats = self.extractor.f_forward(feats, &rois, None)?;
            let (cls_score, bbox_pred) = self.head.score_and_regress(&roi_feats)?;

            let num_classes = self.head.num_classes() as i64;
            ensure!(
                cls_score.size() == [num_neg as i64, num_classes + 1],
                "expect [{}, {}] class scores, but get {:?}",
                num_neg,
                num_classes + 1,
                cls_score.size()
            );

            // every negative is scored against the background label
            let ori_loss = -cls_score
                .log_softmax(-1, Kind::Float)
                .select(1, num_classes);
            let (max_score, argmax_score) = cls_score
                .softmax(-1, Kind::Float)
                .narrow(1, 0, num_classes)
                .max_dim(1, false);

            let max_score = max_score.f_to_f32_vec()?;
            let score_thr = self.score_thr.raw() as f32;
            let (valid, invalid): (Vec<usize>, Vec<usize>) =
                (0..num_neg).partition(|&index| max_score[index] > score_thr);
            let num_valid = valid.len();
            let num_hlr = num_valid.min(num_expected);
            let num_rand = num_expected - num_hlr;

            debug!(
                "{} negatives, {} valid, draw {} hard and {} random",
                num_neg, num_valid, num_hlr, num_rand
            );

            if num_valid == 0 {
                let select = tch_goodies::random_indexes(rng, num_neg, num_expected)?;
                let select = Tensor::of_slice(&select).to_device(device);
                return Ok((
                    neg_inds.index_select(0, &select),
                    Tensor::ones(&[num_expected as i64], (Kind::Float, device)),
                ));
            }

            // group valid negatives by the boxes predicted for their top class
            let valid_tensor = Tensor::of_slice(&to_i64(&valid)).to_device(device);
            let valid_scores: Vec<f32> = valid.iter().map(|&index| max_score[index]).collect();
            let deltas = top_class_deltas(&bbox_pred, &argmax_score, num_classes)?
                .index_select(0, &valid_tensor);
            let pred_bboxes = self
                .head
                .decode(&neg_bboxes.index_select(&valid_tensor), &deltas)?;
            let groups = tch_goodies::nms_match(
                &pred_bboxes,
                &Tensor::of_slice(&valid_scores),
                self.iou_threshold.raw(),
            )?;

            let importance = importance(&groups, &valid_scores, self.importance_base);
            let hard = rank_descending(&importance)
                .into_iter()
                .take(num_hlr)
                .map(|rank| valid[rank]);
            let random: Vec<_> = tch_goodies::random_indexes(rng, invalid.len(), num_rand)?
                .into_iter()
                .map(|index| invalid[index as usize])
                .collect();
            let select: Vec<usize> = hard.chain(random).collect();

            let mut weights = rank_weights(
                num_hlr,
                num_rand,
                num_expected.max(num_valid),
                self.k.raw(),
                self.bias.raw(),
            );
            let ori_loss = ori_loss.f_to_f32_vec()?;
            let selected_loss: Vec<f64> = select
                .iter()
                .map(|&index| ori_loss[index] as f64)
                .collect();
            if !normalize_weights(&mut weights, &selected_loss) {
                warn!("skip negative weight normalization due to a degenerate weighted loss");
            }

            let select = Tensor::of_slice(&to_i64(&select)).to_device(device);
            let weights: Vec<f32> = weights.into_iter().map(|weight| weight as f32).collect();
            Ok((
                neg_inds.index_select(0, &select),
                Tensor::of_slice(&weights).to_device(device),
            ))
        })
    }
}

impl<'a, H> Sampler for ScoreHlrSampler<'a, H>
where
    H: BboxHead,
{
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
        R: Rng + ?Sized,
    {
        let base = &self.base;
        let (bboxes, gt_flags) =
            base.prepare_candidates(assign_result, bboxes, gt_bboxes, gt_labels)?;

        let pos_inds = base.sample_pos(rng, assign_result, base.num_expected_pos())?;
        let num_pos = pos_inds.size()[0] as usize;
        let num_expected_neg = base.num_expected_neg(num_pos);
        let (neg_inds, neg_label_weights) =
            self.sample_neg(rng, assign_result, num_expected_neg, &bboxes, feats)?;

        SamplingResult::new(
            pos_inds,
            neg_inds,
            &bboxes,
            gt_bboxes,
            assign_result,
            &gt_flags,
            Some(neg_label_weights),
        )
    }
}

/// Pick the `[num_rois, 4]` deltas of each RoI's top class.
fn top_class_deltas(bbox_pred: &Tensor, argmax: &Tensor, num_classes: i64) -> Result<Tensor> {
    let (num_rois, num_cols) = bbox_pred.size2()?;
    ensure!(
        argmax.size() == [num_rois],
        "expect [{}] top class indexes, but get {:?}",
        num_rois,
        argmax.size()
    );
    if num_cols == 4 {
        return Ok(bbox_pred.shallow_clone());
    }
    ensure!(
        num_cols == num_classes * 4,
        "expect box deltas with 4 or {} columns, but get {}",
        num_classes * 4,
        num_cols
    );
    let index = argmax.view([num_rois, 1, 1]).expand(&[num_rois, 1, 4], false);
    Ok(bbox_pred
        .view([num_rois, num_classes, 4])
        .gather(1, &index, false)
        .view([num_rois, 4]))
}

/// The in-cluster importance of each box.
///
/// Each group lists box indexes in descending score order, as
/// [nms_match](tch_goodies::nms_match) returns.
fn importance(groups: &[Vec<i64>], scores: &[f32], base: ImportanceBase) -> Vec<f32> {
    let mut importance = vec![0.0; scores.len()];
    for group in groups {
        let offset = base.offset(group.len(), scores.len());
        for (rank, &index) in group.iter().enumerate() {
            let index = index as usize;
            importance[index] = offset - rank as f32 + scores[index];
        }
    }
    importance
}

/// Indexes sorted by descending value. Ties keep index order.
fn rank_descending(values: &[f32]) -> Vec<usize> {
    (0..values.len())
        .sorted_by(|&lhs, &rhs| {
            values[rhs]
                .partial_cmp(&values[lhs])
                .unwrap_or(Ordering::Equal)
        })
        .collect()
}

/// Weights of `num_hlr` ranked negatives followed by `num_rand` random ones.
///
/// Rank `r` maps to `(up_bound - r) / up_bound` and random picks take the
/// smallest ranked weight. Each weight `w` then becomes
/// `(bias + (1 - bias) * w) ^ k`.
fn rank_weights(num_hlr: usize, num_rand: usize, up_bound: usize, k: f64, bias: f64) -> Vec<f64> {
    debug_assert!(num_hlr > 0 && up_bound >= num_hlr);
    let up_bound = up_bound as f64;
    let ranked = (0..num_hlr).map(|rank| (up_bound - rank as f64) / up_bound);
    let min_weight = (up_bound - (num_hlr - 1) as f64) / up_bound;
    ranked
        .chain(iter::repeat(min_weight).take(num_rand))
        .map(|weight| (bias + (1.0 - bias) * weight).powf(k))
        .collect()
}

/// Scale weights so that `sum(w * loss) == sum(loss)`.
///
/// Returns false and leaves weights untouched if the weighted sum is zero or
/// the ratio is not finite.
fn normalize_weights(weights: &mut [f64], losses: &[f64]) -> bool {
    debug_assert_eq!(weights.len(), losses.len());
    let loss_sum: f64 = losses.iter().sum();
    let weighted_sum: f64 = izip!(&*weights, losses)
        .map(|(weight, loss)| weight * loss)
        .sum();
    let ratio = loss_sum / weighted_sum;
    if weighted_sum == 0.0 || !ratio.is_finite() {
        return false;
    }
    weights.iter_mut().for_each(|weight| *weight *= ratio);
    true
}

fn to_i64(indexes: &[usize]) -> Vec<i64> {
    indexes.iter().map(|&index| index as i64).collect()
}
