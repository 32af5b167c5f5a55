use crate::common::*;

/// RoIAlign initializer.
#[derive(Debug, Clone)]
pub struct RoiAlignInit {
    /// The pooled output size in `[height, width]`.
    pub output_size: [usize; 2],
    /// The ratio of feature map size to input image size, i.e. `1 / stride`.
    pub spatial_scale: f64,
    /// The number of sampling points per output bin along each axis.
    pub sampling_ratio: usize,
    /// Shift box coordinates by half a pixel so that pixel centers sit on
    /// integer coordinates.
    pub aligned: bool,
}

impl RoiAlignInit {
    pub fn new(output_size: [usize; 2], spatial_scale: f64) -> Self {
        Self {
            output_size,
            spatial_scale,
            sampling_ratio: 2,
            aligned: true,
        }
    }

    pub fn build(self) -> Result<RoiAlign> {
        let Self {
            output_size: [output_h, output_w],
            spatial_scale,
            sampling_ratio,
            aligned,
        } = self;

        ensure!(
            output_h > 0 && output_w > 0,
            "output_size must be positive"
        );
        ensure!(spatial_scale > 0.0, "spatial_scale must be positive");
        ensure!(sampling_ratio > 0, "sampling_ratio must be positive");

        Ok(RoiAlign {
            output_h: output_h as i64,
            output_w: output_w as i64,
            spatial_scale,
            sampling_ratio: sampling_ratio as i64,
            aligned,
        })
    }
}

/// Bilinear-sampled average pooling of RoIs over a feature map.
#[derive(Debug, Clone)]
pub struct RoiAlign {
    output_h: i64,
    output_w: i64,
    spatial_scale: f64,
    sampling_ratio: i64,
    aligned: bool,
}

impl RoiAlign {
    pub fn output_size(&self) -> [i64; 2] {
        [self.output_h, self.output_w]
    }

    pub fn spatial_scale(&self) -> f64 {
        self.spatial_scale
    }

    /// Pool `rois` from a `[batch, channels, height, width]` feature map.
    ///
    /// Returns a `[num_rois, channels, output_h, output_w]` tensor whose
    /// row `i` is pooled from RoI `i`.
    pub fn f_forward(&self, input: &Tensor, rois: &RoiTensor) -> Result<Tensor> {
        let Self {
            output_h,
            output_w,
            spatial_scale,
            sampling_ratio,
            aligned,
        } = *self;

        let (batch_size, channels, height, width) = input.size4()?;
        let num_rois = rois.num_rois();
        let kind = input.kind();
        let device = input.device();

        if num_rois == 0 {
            return Ok(Tensor::zeros(
                &[0, channels, output_h, output_w],
                (kind, device),
            ));
        }

        let rois = rois.to_device(device);
        let boxes = rois.boxes();
        let offset = if aligned { 0.5 } else { 0.0 };
        let x1 = boxes.x1().to_kind(kind) * spatial_scale - offset;
        let y1 = boxes.y1().to_kind(kind) * spatial_scale - offset;
        let (roi_w, roi_h) = {
            let roi_w = boxes.w().to_kind(kind) * spatial_scale;
            let roi_h = boxes.h().to_kind(kind) * spatial_scale;
            if aligned {
                (roi_w, roi_h)
            } else {
                // legacy mode forces boxes to be at least 1x1
                (roi_w.clamp_min(1.0), roi_h.clamp_min(1.0))
            }
        };

        // sampling point coordinates in feature pixels, [num_rois, grid_{w,h}]
        let grid_w = output_w * sampling_ratio;
        let grid_h = output_h * sampling_ratio;
        let xs = sample_coords(&x1, &roi_w, output_w, grid_w, sampling_ratio, kind, device);
        let ys = sample_coords(&y1, &roi_h, output_h, grid_h, sampling_ratio, kind, device);

        // samples beyond one pixel outside the map contribute zero
        let valid_x = xs.ge(-1.0).logical_and(&xs.le(width as f64));
        let valid_y = ys.ge(-1.0).logical_and(&ys.le(height as f64));
        let valid = valid_y
            .unsqueeze(2)
            .logical_and(&valid_x.unsqueeze(1))
            .to_kind(kind)
            .unsqueeze(1);

        // normalize to [-1, 1] with align_corners = false
        let grid = {
            let gx = (xs * 2.0 + 1.0) / width as f64 - 1.0;
            let gy = (ys * 2.0 + 1.0) / height as f64 - 1.0;
            let shape = [num_rois, grid_h, grid_w];
            Tensor::stack(
                &[
                    gx.unsqueeze(1).expand(&shape, false),
                    gy.unsqueeze(2).expand(&shape, false),
                ],
                3,
            )
        };

        // sample each image once with the grids of all its RoIs stacked
        // along the height axis
        let batch_groups = rois
            .batch_indexes()
            .f_to_i64_vec()?
            .into_iter()
            .enumerate()
            .map(|(roi_index, batch_index)| (batch_index, roi_index as i64))
            .into_group_map();
        let (positions, samples): (Vec<_>, Vec<_>) = batch_groups
            .into_iter()
            .map(|(batch_index, roi_indexes)| -> Result<_> {
                ensure!(
                    (0..batch_size).contains(&batch_index),
                    "RoI batch index {} is out of range for a batch of size {}",
                    batch_index,
                    batch_size
                );
                let num_image_rois = roi_indexes.len() as i64;
                let positions = Tensor::of_slice(&roi_indexes).to_device(device);
                let image_grid = grid.index_select(0, &positions).view([
                    1,
                    num_image_rois * grid_h,
                    grid_w,
                    2,
                ]);

                // bilinear interpolation, border padding clamps samples in [-1, 0)
                let sampled = input
                    .narrow(0, batch_index, 1)
                    .f_grid_sampler(&image_grid, 0, 1, false)?
                    .view([channels, num_image_rois, grid_h, grid_w])
                    .permute(&[1, 0, 2, 3]);
                Ok((positions, sampled))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();

        // restore the input RoI order
        let order = Tensor::cat(&positions, 0).argsort(0, false);
        let sampled = Tensor::cat(&samples, 0).index_select(0, &order) * valid;
        let pooled = sampled.f_avg_pool2d(
            &[sampling_ratio, sampling_ratio],
            &[sampling_ratio, sampling_ratio],
            &[0, 0],
            false,
            true,
            None::<i64>,
        )?;

        Ok(pooled)
    }

    pub fn forward(&self, input: &Tensor, rois: &RoiTensor) -> Tensor {
        self.f_forward(input, rois).unwrap()
    }
}

/// Sample positions along one axis. Output bin `p` holds the points
/// `start + (p + (i + 0.5) / ratio) * bin_size` for `i` in `0..ratio`.
fn sample_coords(
    start: &Tensor,
    length: &Tensor,
    num_bins: i64,
    num_samples: i64,
    sampling_ratio: i64,
    kind: Kind,
    device: Device,
) -> Tensor {
    let steps = (Tensor::arange(num_samples, (kind, device)) + 0.5) / sampling_ratio as f64;
    let bin_size = length / num_bins as f64;
    start.unsqueeze(1) + steps.unsqueeze(0) * bin_size.unsqueeze(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use bbox::{Roi, XYXY};

    fn rois_of(rows: &[(usize, [f32; 4])]) -> RoiTensor {
        let rois: Vec<_> = rows
            .iter()
            .map(|&(batch_index, xyxy)| Roi::new(batch_index, XYXY::from_xyxy(xyxy)))
            .collect();
        RoiTensor::from(rois.as_slice())
    }

    #[test]
    fn constant_map_pools_constant() -> Result<()> {
        let layer = RoiAlignInit::new([7, 7], 0.25).build()?;
        let input = Tensor::full(&[1, 3, 16, 16], 3.0, tch::kind::FLOAT_CPU);
        let rois = rois_of(&[(0, [8.0, 8.0, 40.0, 56.0])]);
        let output = layer.f_forward(&input, &rois)?;
        assert_eq!(output.size(), vec![1, 3, 7, 7]);
        assert_abs_diff_eq!(f64::from((output - 3.0).abs().max()), 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn horizontal_ramp_pools_bin_centers() -> Result<()> {
        // the feature value equals its column index
        let layer = RoiAlignInit::new([1, 2], 1.0).build()?;
        let input = Tensor::arange(16, tch::kind::FLOAT_CPU)
            .view([1, 1, 1, 16])
            .expand(&[1, 1, 16, 16], false)
            .contiguous();
        let rois = rois_of(&[(0, [4.5, 4.0, 8.5, 8.0])]);
        let output: Vec<f32> = Vec::from(&layer.f_forward(&input, &rois)?.view([-1]));
        assert_abs_diff_eq!(output[0], 5.0, epsilon = 1e-4);
        assert_abs_diff_eq!(output[1], 7.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn rois_pick_their_batch_image() -> Result<()> {
        let layer = RoiAlignInit::new([2, 2], 1.0).build()?;
        let input = Tensor::cat(
            &[
                Tensor::full(&[1, 2, 8, 8], 1.0, tch::kind::FLOAT_CPU),
                Tensor::full(&[1, 2, 8, 8], 5.0, tch::kind::FLOAT_CPU),
            ],
            0,
        );
        let rois = rois_of(&[(1, [1.0, 1.0, 5.0, 5.0]), (0, [2.0, 2.0, 6.0, 6.0])]);
        let output = layer.f_forward(&input, &rois)?;
        assert_abs_diff_eq!(f64::from(output.get(0).mean(Kind::Float)), 5.0, epsilon = 1e-5);
        assert_abs_diff_eq!(f64::from(output.get(1).mean(Kind::Float)), 1.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn interleaved_batches_keep_roi_order() -> Result<()> {
        let layer = RoiAlignInit::new([3, 3], 0.5).build()?;
        let input = Tensor::rand(&[3, 2, 16, 16], tch::kind::FLOAT_CPU);
        let rows: [(usize, [f32; 4]); 5] = [
            (2, [3.0, 4.0, 20.0, 18.0]),
            (0, [0.0, 0.0, 31.0, 31.0]),
            (2, [10.0, 2.0, 14.0, 30.0]),
            (1, [5.0, 5.0, 9.0, 9.0]),
            (0, [8.0, 12.0, 24.0, 16.0]),
        ];
        let output = layer.f_forward(&input, &rois_of(&rows))?;
        assert_eq!(output.size(), vec![5, 2, 3, 3]);

        for (index, &row) in rows.iter().enumerate() {
            let single = layer.f_forward(&input, &rois_of(&[row]))?;
            let diff = (output.get(index as i64) - single.get(0)).abs().max();
            assert_abs_diff_eq!(f64::from(diff), 0.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn many_rois_on_a_large_map() -> Result<()> {
        let layer = RoiAlignInit::new([7, 7], 0.25).build()?;
        let input = Tensor::rand(&[1, 16, 200, 304], tch::kind::FLOAT_CPU);
        let rows: Vec<_> = (0..2000)
            .map(|index| {
                let x = (index % 50) as f32 * 24.0;
                let y = (index / 50) as f32 * 20.0;
                (0usize, [x, y, x + 32.0, y + 48.0])
            })
            .collect();
        let output = layer.f_forward(&input, &rois_of(&rows))?;
        assert_eq!(output.size(), vec![2000, 16, 7, 7]);

        for &index in &[0, 777, 1999] {
            let single = layer.f_forward(&input, &rois_of(&rows[index..=index]))?;
            let diff = (output.get(index as i64) - single.get(0)).abs().max();
            assert_abs_diff_eq!(f64::from(diff), 0.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn out_of_range_batch_index_is_rejected() -> Result<()> {
        let layer = RoiAlignInit::new([2, 2], 1.0).build()?;
        let input = Tensor::ones(&[1, 1, 8, 8], tch::kind::FLOAT_CPU);
        let rois = rois_of(&[(1, [0.0, 0.0, 4.0, 4.0])]);
        assert!(layer.f_forward(&input, &rois).is_err());
        Ok(())
    }

    #[test]
    fn far_outside_samples_are_zero() -> Result<()> {
        let layer = RoiAlignInit::new([2, 2], 1.0).build()?;
        let input = Tensor::ones(&[1, 1, 8, 8], tch::kind::FLOAT_CPU);
        let rois = rois_of(&[(0, [100.0, 100.0, 120.0, 120.0])]);
        let output = layer.f_forward(&input, &rois)?;
        assert_eq!(f64::from(output.abs().sum(Kind::Float)), 0.0);
        Ok(())
    }

    #[test]
    fn no_rois_yield_empty_output() -> Result<()> {
        let layer = RoiAlignInit::new([7, 7], 0.25).build()?;
        let input = Tensor::rand(&[2, 4, 16, 16], tch::kind::FLOAT_CPU);
        let output = layer.f_forward(&input, &RoiTensor::empty(Device::Cpu))?;
        assert_eq!(output.size(), vec![0, 4, 7, 7]);
        Ok(())
    }

    #[test]
    fn invalid_init_is_rejected() {
        let mut init = RoiAlignInit::new([7, 7], 0.25);
        init.sampling_ratio = 0;
        assert!(init.build().is_err());
        assert!(RoiAlignInit::new([0, 7], 0.25).build().is_err());
    }
}
