use crate::{common::*, compound_tensor::BoxTensor, tensor::TensorExt};

/// Group boxes by overlap with greedy non-maximum suppression.
///
/// Boxes are visited in descending score order. A box that is not yet
/// suppressed opens a new group and becomes its representative. Every
/// later box whose IoU with the representative reaches `iou_threshold`
/// joins that group and is suppressed.
///
/// Each returned group lists box indexes, representative first, followed by
/// members in descending score order. Every box appears in exactly one group.
pub fn nms_match(boxes: &BoxTensor, scores: &Tensor, iou_threshold: f64) -> Result<Vec<Vec<i64>>> {
    tch::no_grad(|| {
        let num_boxes = boxes.num_boxes();
        let num_scores = scores
            .size1()
            .map_err(|_| format_err!("scores should be a 1d tensor"))?;
        ensure!(
            num_boxes == num_scores,
            "boxes and scores should have same number of elements in dimension 0"
        );
        ensure!(
            (0.0..=1.0).contains(&iou_threshold),
            "iou_threshold must be in range [0, 1]"
        );

        let rects = boxes.f_to_xyxy_vec()?;
        let scores = scores.f_to_f32_vec()?;
        let groups = nms_match_rects(&rects, &scores, iou_threshold as f32);
        trace!("{} boxes form {} groups", num_boxes, groups.len());
        Ok(groups)
    })
}

/// Host-side version of [nms_match] on plain boxes.
pub fn nms_match_rects<R>(rects: &[R], scores: &[f32], iou_threshold: f32) -> Vec<Vec<i64>>
where
    R: Rect<Type = f32>,
{
    debug_assert_eq!(rects.len(), scores.len());

    let order: Vec<usize> = (0..scores.len())
        .sorted_by(|&lhs, &rhs| {
            scores[rhs]
                .partial_cmp(&scores[lhs])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .collect();
    let mut suppressed = vec![false; rects.len()];
    let mut groups = vec![];

    for (pos, &li) in order.iter().enumerate() {
        if suppressed[li] {
            continue;
        }
        let mut group = vec![li as i64];
        let lhs = &rects[li];

        for &ri in &order[(pos + 1)..] {
            if suppressed[ri] {
                continue;
            }
            let iou = lhs.iou_with(&rects[ri], 0.0);
            if iou >= iou_threshold {
                suppressed[ri] = true;
                group.push(ri as i64);
            }
        }

        groups.push(group);
    }

    groups
}
