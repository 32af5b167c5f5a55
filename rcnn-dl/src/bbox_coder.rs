//! The (dx, dy, dw, dh) box delta coder.

use crate::common::*;

/// Encodes boxes as center offsets and log-scale size ratios relative to
/// reference boxes, normalized by `means` and `stds`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaXywhCoder {
    pub means: [f64; 4],
    pub stds: [f64; 4],
    /// The bound of `|dw|` and `|dh|` after denormalization.
    pub max_ratio: f64,
}

impl DeltaXywhCoder {
    pub fn new(means: [f64; 4], stds: [f64; 4]) -> Self {
        Self {
            means,
            stds,
            ..Default::default()
        }
    }

    /// Compute deltas that transform `boxes` into `targets`.
    pub fn encode(&self, boxes: &BoxTensor, targets: &BoxTensor) -> Result<Tensor> {
        ensure!(
            boxes.num_boxes() == targets.num_boxes(),
            "boxes and targets should have same number of elements in dimension 0"
        );
        let pw = boxes.w();
        let ph = boxes.h();
        let px = boxes.x1() + &pw * 0.5;
        let py = boxes.y1() + &ph * 0.5;
        let gw = targets.w();
        let gh = targets.h();
        let gx = targets.x1() + &gw * 0.5;
        let gy = targets.y1() + &gh * 0.5;

        let dx = (gx - px) / &pw;
        let dy = (gy - py) / &ph;
        let dw = (gw / pw).log();
        let dh = (gh / ph).log();

        let deltas = Tensor::stack(&[dx, dy, dw, dh], 1);
        let means = Tensor::of_slice(&self.means)
            .to_kind(deltas.kind())
            .to_device(deltas.device());
        let stds = Tensor::of_slice(&self.stds)
            .to_kind(deltas.kind())
            .to_device(deltas.device());
        Ok((deltas - means) / stds)
    }

    /// Apply `[num_boxes, 4]` deltas to `boxes`.
    ///
    /// If `max_shape` is given in `[height, width]`, decoded boxes are clipped
    /// to the image.
    pub fn decode(
        &self,
        boxes: &BoxTensor,
        deltas: &Tensor,
        max_shape: Option<[f64; 2]>,
    ) -> Result<BoxTensor> {
        let (num_deltas, num_cols) = deltas.size2()?;
        ensure!(
            num_cols == 4,
            "expect [_, 4] deltas, but get [_, {}]",
            num_cols
        );
        ensure!(
            num_deltas == boxes.num_boxes(),
            "boxes and deltas should have same number of elements in dimension 0"
        );

        let kind = boxes.boxes().kind();
        let device = boxes.device();
        let means = Tensor::of_slice(&self.means).to_kind(kind).to_device(device);
        let stds = Tensor::of_slice(&self.stds).to_kind(kind).to_device(device);
        let deltas = deltas.to_kind(kind) * stds + means;

        let dx = deltas.select(1, 0);
        let dy = deltas.select(1, 1);
        let dw = deltas.select(1, 2).clamp(-self.max_ratio, self.max_ratio);
        let dh = deltas.select(1, 3).clamp(-self.max_ratio, self.max_ratio);

        let pw = boxes.w();
        let ph = boxes.h();
        let px = boxes.x1() + &pw * 0.5;
        let py = boxes.y1() + &ph * 0.5;

        let gw = &pw * dw.exp();
        let gh = &ph * dh.exp();
        let gx = px + pw * dx;
        let gy = py + ph * dy;

        let mut x1 = &gx - &gw * 0.5;
        let mut y1 = &gy - &gh * 0.5;
        let mut x2 = gx + gw * 0.5;
        let mut y2 = gy + gh * 0.5;

        if let Some([height, width]) = max_shape {
            x1 = x1.clamp(0.0, width);
            y1 = y1.clamp(0.0, height);
            x2 = x2.clamp(0.0, width);
            y2 = y2.clamp(0.0, height);
        }

        Tensor::stack(&[x1, y1, x2, y2], 1).try_into()
    }
}

impl Default for DeltaXywhCoder {
    fn default() -> Self {
        Self {
            means: [0.0; 4],
            stds: [1.0; 4],
            max_ratio: (1000.0f64 / 16.0).ln(),
        }
    }
}
