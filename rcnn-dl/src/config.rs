//! RoI head configuration format.

use crate::{
    common::*,
    sampler::{ImportanceBase, RandomSamplerInit, SamplerBase, ScoreHlrSamplerInit},
};
use tch_modules::MultiLevelRoiExtractorInit;

/// The RoI head configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub roi_extractor: RoiExtractorConfig,
    pub sampler: SamplerConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        Ok(config)
    }
}

/// Multi-level RoI extractor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoiExtractorConfig {
    /// The number of channels of input feature maps.
    pub out_channels: usize,
    /// The pooled output size in `[height, width]`.
    #[serde(default = "default_output_size")]
    pub output_size: [usize; 2],
    /// The strides of input feature maps, finest first.
    pub featmap_strides: Vec<usize>,
    #[serde(default = "default_finest_scale")]
    pub finest_scale: R64,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: usize,
    #[serde(default = "default_true")]
    pub aligned: bool,
    #[serde(default)]
    pub static_graph: bool,
    /// Output channels of the 1x1 convolution after pooling.
    pub post_conv: Option<usize>,
}

impl RoiExtractorConfig {
    pub fn extractor_init(&self) -> MultiLevelRoiExtractorInit {
        let Self {
            out_channels,
            output_size,
            ref featmap_strides,
            finest_scale,
            sampling_ratio,
            aligned,
            static_graph,
            post_conv,
        } = *self;

        MultiLevelRoiExtractorInit {
            out_channels,
            output_size,
            featmap_strides: featmap_strides.clone(),
            finest_scale: finest_scale.raw(),
            sampling_ratio,
            aligned,
            static_graph,
            post_conv_channels: post_conv,
        }
    }
}

/// RoI sampler options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SamplerConfig {
    Random(RandomSamplerConfig),
    ScoreHlr(ScoreHlrSamplerConfig),
}

impl SamplerConfig {
    /// The random sampler built from the shared sample counts.
    pub fn random_sampler_init(&self) -> RandomSamplerInit {
        let base = match self {
            Self::Random(config) => config.sampler_base(),
            Self::ScoreHlr(config) => config.sampler_base(),
        };
        RandomSamplerInit { base }
    }

    /// The score-based sampler options, or `None` for the random sampler.
    pub fn score_hlr_sampler_init(&self) -> Option<ScoreHlrSamplerInit> {
        match self {
            Self::Random(_) => None,
            Self::ScoreHlr(config) => Some(config.sampler_init()),
        }
    }
}

/// Random sampler options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomSamplerConfig {
    pub num: usize,
    pub pos_fraction: R64,
    /// Upper bound of the negative to positive ratio. A negative value
    /// disables the bound.
    #[serde(default = "default_neg_pos_ub")]
    pub neg_pos_ub: R64,
    #[serde(default = "default_true")]
    pub add_gt_as_proposals: bool,
}

impl RandomSamplerConfig {
    fn sampler_base(&self) -> SamplerBase {
        sampler_base(
            self.num,
            self.pos_fraction,
            self.neg_pos_ub,
            self.add_gt_as_proposals,
        )
    }
}

/// Score-based hard negative sampler options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreHlrSamplerConfig {
    pub num: usize,
    pub pos_fraction: R64,
    #[serde(default = "default_neg_pos_ub")]
    pub neg_pos_ub: R64,
    #[serde(default = "default_true")]
    pub add_gt_as_proposals: bool,
    #[serde(default = "default_k")]
    pub k: R64,
    #[serde(default = "default_bias")]
    pub bias: R64,
    #[serde(default = "default_score_thr")]
    pub score_thr: R64,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: R64,
    #[serde(default)]
    pub importance_base: ImportanceBase,
}

impl ScoreHlrSamplerConfig {
    fn sampler_base(&self) -> SamplerBase {
        sampler_base(
            self.num,
            self.pos_fraction,
            self.neg_pos_ub,
            self.add_gt_as_proposals,
        )
    }

    fn sampler_init(&self) -> ScoreHlrSamplerInit {
        let Self {
            k,
            bias,
            score_thr,
            iou_threshold,
            importance_base,
            ..
        } = *self;

        ScoreHlrSamplerInit {
            base: self.sampler_base(),
            k,
            bias,
            score_thr,
            iou_threshold,
            importance_base,
        }
    }
}

fn sampler_base(
    num: usize,
    pos_fraction: R64,
    neg_pos_ub: R64,
    add_gt_as_proposals: bool,
) -> SamplerBase {
    SamplerBase {
        num,
        pos_fraction,
        neg_pos_ub: (neg_pos_ub >= 0.0).then(|| neg_pos_ub),
        add_gt_as_proposals,
    }
}

fn default_output_size() -> [usize; 2] {
    [7, 7]
}

fn default_finest_scale() -> R64 {
    r64(56.0)
}

fn default_sampling_ratio() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_k() -> R64 {
    r64(0.5)
}

fn default_bias() -> R64 {
    r64(0.0)
}

fn default_score_thr() -> R64 {
    r64(0.05)
}

fn default_iou_threshold() -> R64 {
    r64(0.5)
}

fn default_neg_pos_ub() -> R64 {
    r64(-1.0)
}
