//! EfficientNet-B0 laid out with torchvision parameter names so trained
//! checkpoints map onto it key for key (`features.N...`, `classifier.1...`).

use tch::nn::{self, ModuleT};
use tch::Tensor;

pub const FEATURE_DIM: i64 = 1280;
pub const HEAD_DROPOUT: f64 = 0.2;

const STEM_CHANNELS: i64 = 32;
const BN_EPS: f64 = 1e-5;

/// Where the classification layer lives inside `classifier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLayout {
    /// `classifier = Sequential(Dropout, Linear)`; weights under `classifier.1`.
    Indexed,
    /// `classifier = Linear`; weights directly under `classifier`.
    Flat,
}

impl HeadLayout {
    /// Picks the layout whose weight key the checkpoint carries.
    pub fn detect<'a>(keys: impl Iterator<Item = &'a str>) -> Option<Self> {
        let mut layout = None;
        for key in keys {
            match key {
                "classifier.1.weight" => return Some(HeadLayout::Indexed),
                "classifier.weight" => layout = Some(HeadLayout::Flat),
                _ => {}
            }
        }
        layout
    }
}

#[derive(Debug, Clone, Copy)]
struct StageConfig {
    expand_ratio: i64,
    kernel: i64,
    stride: i64,
    input_channels: i64,
    out_channels: i64,
    num_layers: usize,
}

const fn stage(
    expand_ratio: i64,
    kernel: i64,
    stride: i64,
    input_channels: i64,
    out_channels: i64,
    num_layers: usize,
) -> StageConfig {
    StageConfig {
        expand_ratio,
        kernel,
        stride,
        input_channels,
        out_channels,
        num_layers,
    }
}

const B0_STAGES: [StageConfig; 7] = [
    stage(1, 3, 1, 32, 16, 1),
    stage(6, 3, 2, 16, 24, 2),
    stage(6, 5, 2, 24, 40, 2),
    stage(6, 3, 2, 40, 80, 3),
    stage(6, 5, 1, 80, 112, 3),
    stage(6, 5, 2, 112, 192, 4),
    stage(6, 3, 1, 192, 320, 1),
];

fn make_divisible(value: i64, divisor: i64) -> i64 {
    let rounded = ((value + divisor / 2) / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * value as f64 {
        rounded + divisor
    } else {
        rounded
    }
}

#[derive(Debug)]
struct ConvNormAct {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
    activation: bool,
}

impl ConvNormAct {
    fn new(
        p: nn::Path,
        c_in: i64,
        c_out: i64,
        kernel: i64,
        stride: i64,
        groups: i64,
        activation: bool,
    ) -> Self {
        let conv_config = nn::ConvConfig {
            stride,
            padding: (kernel - 1) / 2,
            groups,
            bias: false,
            ..Default::default()
        };
        let bn_config = nn::BatchNormConfig {
            eps: BN_EPS,
            ..Default::default()
        };
        Self {
            conv: nn::conv2d(&p / 0, c_in, c_out, kernel, conv_config),
            bn: nn::batch_norm2d(&p / 1, c_out, bn_config),
            activation,
        }
    }
}

impl ModuleT for ConvNormAct {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = xs.apply(&self.conv).apply_t(&self.bn, train);
        if self.activation { ys.silu() } else { ys }
    }
}

#[derive(Debug)]
struct SqueezeExcitation {
    fc1: nn::Conv2D,
    fc2: nn::Conv2D,
}

impl SqueezeExcitation {
    fn new(p: nn::Path, channels: i64, squeeze: i64) -> Self {
        Self {
            fc1: nn::conv2d(&p / "fc1", channels, squeeze, 1, Default::default()),
            fc2: nn::conv2d(&p / "fc2", squeeze, channels, 1, Default::default()),
        }
    }
}

impl ModuleT for SqueezeExcitation {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let scale = xs
            .adaptive_avg_pool2d([1, 1])
            .apply(&self.fc1)
            .silu()
            .apply(&self.fc2)
            .sigmoid();
        xs * scale
    }
}

#[derive(Debug)]
struct MbConv {
    expand: Option<ConvNormAct>,
    depthwise: ConvNormAct,
    se: SqueezeExcitation,
    project: ConvNormAct,
    residual: bool,
}

impl MbConv {
    fn new(p: nn::Path, cfg: &StageConfig, c_in: i64, stride: i64) -> Self {
        let block = &p / "block";
        let expanded = make_divisible(c_in * cfg.expand_ratio, 8);
        let mut index = 0;
        let mut next = || {
            let path = &block / index;
            index += 1;
            path
        };

        let expand = (expanded != c_in)
            .then(|| ConvNormAct::new(next(), c_in, expanded, 1, 1, 1, true));
        let depthwise =
            ConvNormAct::new(next(), expanded, expanded, cfg.kernel, stride, expanded, true);
        let se = SqueezeExcitation::new(next(), expanded, (c_in / 4).max(1));
        let project = ConvNormAct::new(next(), expanded, cfg.out_channels, 1, 1, 1, false);

        Self {
            expand,
            depthwise,
            se,
            project,
            residual: stride == 1 && c_in == cfg.out_channels,
        }
    }
}

impl ModuleT for MbConv {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let ys = match &self.expand {
            Some(expand) => xs.apply_t(expand, train),
            None => xs.shallow_clone(),
        };
        let ys = ys
            .apply_t(&self.depthwise, train)
            .apply_t(&self.se, train)
            .apply_t(&self.project, train);
        if self.residual { ys + xs } else { ys }
    }
}

#[derive(Debug)]
pub struct EfficientNet {
    stem: ConvNormAct,
    blocks: Vec<MbConv>,
    top: ConvNormAct,
    head: nn::Linear,
    head_layout: HeadLayout,
}

impl EfficientNet {
    /// Builds EfficientNet-B0 with fresh random weights and a
    /// `FEATURE_DIM -> num_classes` head.
    pub fn b0(p: &nn::Path, num_classes: i64, head_layout: HeadLayout) -> Self {
        let features = p / "features";
        let stem = ConvNormAct::new(&features / 0, 3, STEM_CHANNELS, 3, 2, 1, true);

        let mut blocks = Vec::new();
        for (i, cfg) in B0_STAGES.iter().enumerate() {
            let stage_path = &features / (i + 1);
            for layer in 0..cfg.num_layers {
                let (c_in, stride) = if layer == 0 {
                    (cfg.input_channels, cfg.stride)
                } else {
                    (cfg.out_channels, 1)
                };
                blocks.push(MbConv::new(&stage_path / layer, cfg, c_in, stride));
            }
        }

        let last_channels = B0_STAGES[B0_STAGES.len() - 1].out_channels;
        let top = ConvNormAct::new(
            &features / (B0_STAGES.len() + 1),
            last_channels,
            FEATURE_DIM,
            1,
            1,
            1,
            true,
        );

        let head_path = match head_layout {
            HeadLayout::Indexed => p / "classifier" / 1,
            HeadLayout::Flat => p / "classifier",
        };
        let head = nn::linear(head_path, FEATURE_DIM, num_classes, Default::default());

        Self {
            stem,
            blocks,
            top,
            head,
            head_layout,
        }
    }

    pub fn head_layout(&self) -> HeadLayout {
        self.head_layout
    }
}

impl ModuleT for EfficientNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut ys = xs.apply_t(&self.stem, train);
        for block in &self.blocks {
            ys = ys.apply_t(block, train);
        }
        let pooled = ys
            .apply_t(&self.top, train)
            .adaptive_avg_pool2d([1, 1])
            .flatten(1, -1);
        let pooled = match self.head_layout {
            HeadLayout::Indexed => pooled.dropout(HEAD_DROPOUT, train),
            HeadLayout::Flat => pooled,
        };
        pooled.apply(&self.head)
    }
}
