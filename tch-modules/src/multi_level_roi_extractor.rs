use crate::{
    common::*,
    feature_level_mapper::FeatureLevelMapper,
    roi_align::{RoiAlign, RoiAlignInit},
};

/// Multi-level RoI extractor initializer.
#[derive(Debug, Clone)]
pub struct MultiLevelRoiExtractorInit {
    /// The number of channels of every input feature map.
    pub out_channels: usize,
    /// The pooled output size in `[height, width]`.
    pub output_size: [usize; 2],
    /// The strides of input feature maps, finest first.
    pub featmap_strides: Vec<usize>,
    /// The RoI scale threshold of the finest level.
    pub finest_scale: f64,
    /// The number of sampling points per output bin along each axis.
    pub sampling_ratio: usize,
    /// Pixel-aligned RoIAlign.
    pub aligned: bool,
    /// Avoid data-dependent indexing so the forward pass traces to a static
    /// graph.
    pub static_graph: bool,
    /// Output channels of an optional 1x1 convolution applied after pooling.
    pub post_conv_channels: Option<usize>,
}

impl MultiLevelRoiExtractorInit {
    pub fn new(out_channels: usize, featmap_strides: Vec<usize>) -> Self {
        Self {
            out_channels,
            output_size: [7, 7],
            featmap_strides,
            finest_scale: 56.0,
            sampling_ratio: 2,
            aligned: true,
            static_graph: false,
            post_conv_channels: None,
        }
    }

    pub fn build<'p, P>(self, path: P) -> Result<MultiLevelRoiExtractor>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            out_channels,
            output_size,
            featmap_strides,
            finest_scale,
            sampling_ratio,
            aligned,
            static_graph,
            post_conv_channels,
        } = self;

        ensure!(out_channels > 0, "out_channels must be positive");
        ensure!(
            !featmap_strides.is_empty(),
            "featmap_strides must not be empty"
        );
        ensure!(
            featmap_strides.iter().all(|&stride| stride > 0),
            "featmap_strides must be positive"
        );
        ensure!(
            featmap_strides
                .iter()
                .tuple_windows()
                .all(|(lhs, rhs)| lhs < rhs),
            "featmap_strides must be strictly increasing, but get {:?}",
            featmap_strides
        );

        let roi_layers: Vec<_> = featmap_strides
            .iter()
            .map(|&stride| {
                RoiAlignInit {
                    output_size,
                    spatial_scale: 1.0 / stride as f64,
                    sampling_ratio,
                    aligned,
                }
                .build()
            })
            .try_collect()?;
        let level_mapper = FeatureLevelMapper::new(finest_scale, featmap_strides.len())?;

        let post_conv = post_conv_channels
            .map(|post_channels| -> Result<_> {
                ensure!(post_channels > 0, "post_conv_channels must be positive");
                Ok(nn::conv2d(
                    path / "post_conv",
                    out_channels as i64,
                    post_channels as i64,
                    1,
                    Default::default(),
                ))
            })
            .transpose()?;

        Ok(MultiLevelRoiExtractor {
            out_channels: out_channels as i64,
            roi_layers,
            level_mapper,
            static_graph,
            post_conv,
        })
    }
}

/// Extracts fixed-size RoI features from a feature pyramid.
///
/// Each RoI is pooled from the single level chosen by its scale. The output
/// row order always equals the input RoI order.
///
/// When a level receives no RoI, a zero-weighted read of that level and of
/// every parameter of the extractor is added to the output. The value is
/// unchanged, but every forward pass touches the same set of tensors. Data
/// parallel training relies on this: a worker whose graph skips a parameter
/// never reports its gradient and the gradient all-reduce waits forever.
#[derive(Debug)]
pub struct MultiLevelRoiExtractor {
    out_channels: i64,
    roi_layers: Vec<RoiAlign>,
    level_mapper: FeatureLevelMapper,
    static_graph: bool,
    post_conv: Option<nn::Conv2D>,
}

impl MultiLevelRoiExtractor {
    /// The number of pyramid levels consumed from the input.
    pub fn num_inputs(&self) -> usize {
        self.roi_layers.len()
    }

    /// The number of channels of the extracted features.
    pub fn out_channels(&self) -> i64 {
        match &self.post_conv {
            Some(conv) => conv.ws.size()[0],
            None => self.out_channels,
        }
    }

    pub fn output_size(&self) -> [i64; 2] {
        self.roi_layers[0].output_size()
    }

    pub fn level_mapper(&self) -> &FeatureLevelMapper {
        &self.level_mapper
    }

    pub fn roi_layers(&self) -> &[RoiAlign] {
        &self.roi_layers
    }

    /// The learnable parameters of the extractor.
    pub fn parameters(&self) -> Vec<Tensor> {
        match &self.post_conv {
            Some(nn::Conv2D { ws, bs, .. }) => iter::once(ws.shallow_clone())
                .chain(bs.as_ref().map(Tensor::shallow_clone))
                .collect(),
            None => vec![],
        }
    }

    /// Pool a `[num_rois, channels, h, w]` feature patch for every RoI.
    ///
    /// Only the first [num_inputs](Self::num_inputs) maps of `feats` are used.
    /// If `roi_scale_factor` is set, RoI boxes are rescaled around their
    /// centers after level assignment.
    pub fn f_forward<T>(
        &self,
        feats: &[T],
        rois: &RoiTensor,
        roi_scale_factor: Option<f64>,
    ) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let num_levels = self.num_inputs();
        ensure!(
            feats.len() >= num_levels,
            "expect at least {} feature maps, but get {}",
            num_levels,
            feats.len()
        );
        let feats: Vec<&Tensor> = feats[..num_levels].iter().map(|feat| feat.borrow()).collect();
        for feat in &feats {
            let (_, channels, _, _) = feat.size4()?;
            ensure!(
                channels == self.out_channels,
                "expect {} feature channels, but get {}",
                self.out_channels,
                channels
            );
        }
        if let Some(factor) = roi_scale_factor {
            ensure!(factor > 0.0, "roi_scale_factor must be positive");
        }

        let roi_feats = self.pool_levels(&feats, rois, roi_scale_factor)?;

        let roi_feats = match &self.post_conv {
            Some(conv) => roi_feats.apply(conv),
            None => roi_feats,
        };
        Ok(roi_feats)
    }

    pub fn forward<T>(&self, feats: &[T], rois: &RoiTensor, roi_scale_factor: Option<f64>) -> Tensor
    where
        T: Borrow<Tensor>,
    {
        self.f_forward(feats, rois, roi_scale_factor).unwrap()
    }

    fn pool_levels(
        &self,
        feats: &[&Tensor],
        rois: &RoiTensor,
        roi_scale_factor: Option<f64>,
    ) -> Result<Tensor> {
        let num_levels = feats.len();
        let num_rois = rois.num_rois();
        let [output_h, output_w] = self.output_size();
        let kind = feats[0].kind();
        let device = feats[0].device();
        let rois = rois.to_device(device);

        if num_levels == 1 {
            let rois = match roi_scale_factor {
                Some(factor) => rois.rescale(factor),
                None => rois,
            };
            return self.roi_layers[0].f_forward(feats[0], &rois);
        }

        let mut roi_feats = if self.static_graph {
            // derive the buffer from the RoIs so its shape is traced, not constant
            rois.rois()
                .i((.., 0..1))
                .detach()
                .expand(&[num_rois, self.out_channels * output_h * output_w], false)
                .reshape(&[num_rois, self.out_channels, output_h, output_w])
                .to_kind(kind)
                * 0.0
        } else {
            Tensor::zeros(
                &[num_rois, self.out_channels, output_h, output_w],
                (kind, device),
            )
        };

        let target_levels = self.level_mapper.map_levels(&rois);
        let rois = match roi_scale_factor {
            Some(factor) => rois.rescale(factor),
            None => rois,
        };

        for (level, (feat, roi_layer)) in izip!(feats, &self.roi_layers).enumerate() {
            let mask = target_levels.eq(level as i64);

            if self.static_graph {
                let mask = mask.to_kind(kind);
                let level_feats = roi_layer.f_forward(feat, &rois.masked(&mask))?
                    * mask.view([-1, 1, 1, 1]);
                roi_feats = roi_feats + level_feats;
                continue;
            }

            let indexes = mask.nonzero().view([-1]);
            let num_level_rois = indexes.size()[0];
            trace!("level {} receives {} RoIs", level, num_level_rois);

            if num_level_rois > 0 {
                let level_feats = roi_layer.f_forward(feat, &rois.index_select(&indexes))?;
                roi_feats = roi_feats.f_index_copy(0, &indexes, &level_feats)?;
            } else {
                let touch = Tensor::sum_tensors(
                    self.parameters()
                        .iter()
                        .map(|param| param.zero_touch_first())
                        .chain(iter::once(feat.zero_touch())),
                );
                roi_feats = roi_feats + touch.to_kind(kind);
            }
        }

        Ok(roi_feats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use bbox::{Roi, XYXY};
    use rand::prelude::*;

    const STRIDES: [usize; 4] = [4, 8, 16, 32];
    const CHANNELS: i64 = 8;

    fn pyramid(image_size: i64) -> Vec<Tensor> {
        STRIDES
            .iter()
            .map(|&stride| {
                let size = image_size / stride as i64;
                Tensor::randn(&[2, CHANNELS, size, size], tch::kind::FLOAT_CPU)
            })
            .collect()
    }

    fn random_rois(rng: &mut StdRng, num: usize, image_size: f32) -> RoiTensor {
        let rois: Vec<_> = (0..num)
            .map(|_| {
                let w = rng.gen_range(4.0..image_size * 0.9);
                let h = rng.gen_range(4.0..image_size * 0.9);
                let x1 = rng.gen_range(0.0..(image_size - w));
                let y1 = rng.gen_range(0.0..(image_size - h));
                let batch_index = rng.gen_range(0..2);
                Roi::new(batch_index, XYXY::from_xyxy([x1, y1, x1 + w, y1 + h]))
            })
            .collect();
        RoiTensor::from(rois.as_slice())
    }

    fn extractor(vs: &nn::VarStore, static_graph: bool) -> Result<MultiLevelRoiExtractor> {
        MultiLevelRoiExtractorInit {
            static_graph,
            ..MultiLevelRoiExtractorInit::new(CHANNELS as usize, STRIDES.to_vec())
        }
        .build(&vs.root())
    }

    fn max_abs_diff(lhs: &Tensor, rhs: &Tensor) -> f64 {
        f64::from((lhs - rhs).abs().max())
    }

    #[test]
    fn rows_follow_their_assigned_level() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor = extractor(&vs, false)?;
        let feats = pyramid(512);
        let rois = random_rois(&mut rng, 40, 512.0);

        let output = extractor.f_forward(&feats, &rois, None)?;
        assert_eq!(output.size(), vec![40, CHANNELS, 7, 7]);

        let levels = extractor.level_mapper().map_levels(&rois).f_to_i64_vec()?;
        for (index, &level) in levels.iter().enumerate() {
            let index = index as i64;
            let single = rois.index_select(&Tensor::of_slice(&[index]));
            let expect = extractor.roi_layers()[level as usize]
                .f_forward(&feats[level as usize], &single)?;
            assert_abs_diff_eq!(
                max_abs_diff(&output.narrow(0, index, 1), &expect),
                0.0,
                epsilon = 1e-5
            );
        }
        Ok(())
    }

    #[test]
    fn permuting_rois_permutes_rows() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor = extractor(&vs, false)?;
        let feats = pyramid(512);
        let rois = random_rois(&mut rng, 32, 512.0);

        let mut perm: Vec<i64> = (0..32).collect();
        perm.shuffle(&mut rng);
        let perm = Tensor::of_slice(&perm);

        let output = extractor.f_forward(&feats, &rois, None)?;
        let permuted = extractor.f_forward(&feats, &rois.index_select(&perm), None)?;
        assert_abs_diff_eq!(
            max_abs_diff(&output.index_select(0, &perm), &permuted),
            0.0,
            epsilon = 1e-6
        );
        Ok(())
    }

    #[test]
    fn static_graph_matches_dynamic_indexing() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(17);
        let vs = nn::VarStore::new(Device::Cpu);
        let dynamic = extractor(&vs, false)?;
        let fixed = extractor(&vs, true)?;
        let feats = pyramid(512);
        let rois = random_rois(&mut rng, 24, 512.0);

        let lhs = dynamic.f_forward(&feats, &rois, None)?;
        let rhs = fixed.f_forward(&feats, &rois, None)?;
        assert_abs_diff_eq!(max_abs_diff(&lhs, &rhs), 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn single_level_without_rois_is_empty() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor =
            MultiLevelRoiExtractorInit::new(CHANNELS as usize, vec![16]).build(&vs.root())?;
        let feats = vec![Tensor::randn(&[1, CHANNELS, 8, 8], tch::kind::FLOAT_CPU)];
        let output = extractor.f_forward(&feats, &RoiTensor::empty(Device::Cpu), None)?;
        assert_eq!(output.size(), vec![0, CHANNELS, 7, 7]);
        Ok(())
    }

    #[test]
    fn empty_levels_stay_in_the_graph() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor = MultiLevelRoiExtractorInit {
            post_conv_channels: Some(4),
            ..MultiLevelRoiExtractorInit::new(CHANNELS as usize, STRIDES.to_vec())
        }
        .build(&vs.root())?;
        let feats: Vec<_> = pyramid(256)
            .into_iter()
            .map(|feat| feat.set_requires_grad(true))
            .collect();

        // every RoI is small, so levels 1 to 3 stay empty
        let rois = RoiTensor::from(
            &[
                Roi::new(0, XYXY::from_xyxy([10f32, 10.0, 40.0, 40.0])),
                Roi::new(1, XYXY::from_xyxy([60f32, 20.0, 90.0, 70.0])),
            ][..],
        );
        let output = extractor.f_forward(&feats, &rois, None)?;
        assert_eq!(output.size(), vec![2, 4, 7, 7]);
        output.sum(Kind::Float).backward();

        for feat in &feats[1..] {
            let grad = feat.grad();
            assert!(grad.defined());
            assert_eq!(f64::from(grad.abs().sum(Kind::Float)), 0.0);
        }
        assert!(feats[0].grad().defined());
        assert!(extractor.parameters().iter().all(|param| param.grad().defined()));
        Ok(())
    }

    #[test]
    fn rescale_applies_after_level_assignment() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor = extractor(&vs, false)?;
        let feats = pyramid(512);

        // scale 100 maps to level 0, while the enlarged box would map to level 2
        let rois = RoiTensor::from(&[Roi::new(0, XYXY::from_xyxy([200f32, 200.0, 300.0, 300.0]))][..]);
        let output = extractor.f_forward(&feats, &rois, Some(3.0))?;
        let expect = extractor.roi_layers()[0].f_forward(&feats[0], &rois.rescale(3.0))?;
        assert_abs_diff_eq!(max_abs_diff(&output, &expect), 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn invalid_strides_are_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(MultiLevelRoiExtractorInit::new(8, vec![8, 4])
            .build(&vs.root())
            .is_err());
        assert!(MultiLevelRoiExtractorInit::new(8, vec![])
            .build(&vs.root())
            .is_err());
    }

    #[test]
    fn channel_mismatch_is_an_error() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let extractor = extractor(&vs, false)?;
        let feats: Vec<_> = pyramid(256)
            .into_iter()
            .map(|feat| feat.narrow(1, 0, 4))
            .collect();
        let rois = RoiTensor::from(&[Roi::new(0, XYXY::from_xyxy([0f32, 0.0, 8.0, 8.0]))][..]);
        assert!(extractor.f_forward(&feats, &rois, None).is_err());
        Ok(())
    }
}
