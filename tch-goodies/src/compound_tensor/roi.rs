use super::boxes::{is_float_kind, BoxTensor};
use crate::common::*;

/// Checked tensor of RoIs in `[num_rois, 5]` layout.
///
/// Each row is `[batch_index, x1, y1, x2, y2]`. The batch index is stored as
/// a float so that the whole RoI set lives in one tensor.
#[derive(Debug, TensorLike, Getters)]
pub struct RoiTensor {
    #[get = "pub"]
    pub(crate) rois: Tensor,
}

impl RoiTensor {
    pub fn empty(device: Device) -> Self {
        Self {
            rois: Tensor::zeros(&[0, 5], (Kind::Float, device)),
        }
    }

    /// Build RoIs from per-image box sets. Boxes of the `i`-th set are tagged
    /// with batch index `i`.
    pub fn from_boxes<B>(boxes_list: &[B]) -> Self
    where
        B: Borrow<BoxTensor>,
    {
        let rois: Vec<_> = boxes_list
            .iter()
            .enumerate()
            .map(|(batch_index, boxes)| {
                let boxes = boxes.borrow().boxes();
                let num_boxes = boxes.size()[0];
                let batch_col = Tensor::full(
                    &[num_boxes, 1],
                    batch_index as f64,
                    (boxes.kind(), boxes.device()),
                );
                Tensor::cat(&[batch_col, boxes.shallow_clone()], 1)
            })
            .collect();

        match rois.is_empty() {
            true => Self::empty(Device::Cpu),
            false => Self {
                rois: Tensor::cat(&rois, 0),
            },
        }
    }

    pub fn num_rois(&self) -> i64 {
        self.rois.size()[0]
    }

    pub fn device(&self) -> Device {
        self.rois.device()
    }

    pub fn batch_indexes(&self) -> Tensor {
        self.rois.select(1, 0).to_kind(Kind::Int64)
    }

    pub fn boxes(&self) -> BoxTensor {
        BoxTensor {
            boxes: self.rois.i((.., 1..5)),
        }
    }

    pub fn index_select(&self, indexes: &Tensor) -> Self {
        Self {
            rois: self.rois.index_select(0, indexes),
        }
    }

    /// Rescale every RoI box around its center, keeping batch indexes.
    pub fn rescale(&self, factor: f64) -> Self {
        let batch_col = self.rois.i((.., 0..1));
        let boxes = self.boxes().rescale(factor);
        Self {
            rois: Tensor::cat(&[&batch_col, boxes.boxes()], 1),
        }
    }

    /// Multiply each row by a `[num_rois]` 0/1 mask.
    pub fn masked(&self, mask: &Tensor) -> Self {
        Self {
            rois: &self.rois * mask.to_kind(self.rois.kind()).unsqueeze(-1),
        }
    }
}

impl TryFrom<Tensor> for RoiTensor {
    type Error = Error;

    fn try_from(rois: Tensor) -> Result<Self, Self::Error> {
        let (_, num_cols) = rois.size2()?;
        ensure!(num_cols == 5, "expect a [_, 5] RoI tensor, but get [_, {}]", num_cols);
        ensure!(
            is_float_kind(rois.kind()),
            "RoI tensor must be of floating point kind, but get {:?}",
            rois.kind()
        );
        Ok(Self { rois })
    }
}

impl TryFrom<&Tensor> for RoiTensor {
    type Error = Error;

    fn try_from(rois: &Tensor) -> Result<Self, Self::Error> {
        rois.shallow_clone().try_into()
    }
}

impl From<RoiTensor> for Tensor {
    fn from(from: RoiTensor) -> Self {
        from.rois
    }
}

impl From<&[Roi<f32>]> for RoiTensor {
    fn from(from: &[Roi<f32>]) -> Self {
        let values: Vec<f32> = from.iter().flat_map(|roi| roi.to_row()).collect();
        let rois = Tensor::of_slice(&values).view([from.len() as i64, 5]);
        Self { rois }
    }
}
