//! Backbones for classification and metric learning.
//!
//! A [`Backbone`] maps an image batch to either class logits or an
//! ℓ2-normalized embedding. Which one it produces is visible through
//! [`Backbone::embedding_size`], and that is the only thing the training
//! loop inspects to pick its task.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use tracing::{debug, info};
use vision_core::Error;

/// A network usable by the training loop
pub trait Backbone<B: Backend>: Module<B> {
    /// `[N, 3, H, W]` images to `[N, K]` logits or embeddings
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Positive for metric backbones, `None` for classifiers
    fn embedding_size(&self) -> Option<usize> {
        None
    }
}

/// Scales every row of `x` to unit ℓ2 norm
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norm
}

/// Configuration of [`VisionNet`]
#[derive(Config, Debug)]
pub struct VisionNetConfig {
    /// Number of classes; the logit width of classifiers
    pub num_classes: usize,

    /// Filters of the first conv block, doubled per block
    #[config(default = "32")]
    pub base_filters: usize,

    /// Embedding width of metric backbones, 0 for classifiers
    #[config(default = "0")]
    pub embedding_size: usize,

    #[config(default = "0.3")]
    pub dropout: f64,

    #[config(default = "3")]
    pub in_channels: usize,
}

impl VisionNetConfig {
    /// Resolves a `Models.backbone` name.
    ///
    /// `embedding_size` overrides the embedding width of metric backbones and
    /// is rejected for classifiers.
    pub fn from_backbone_name(
        name: &str,
        num_classes: usize,
        embedding_size: Option<usize>,
    ) -> vision_core::Result<Self> {
        if num_classes == 0 {
            return Err(Error::Config("label vocabulary is empty".into()));
        }
        let config = VisionNetConfig::new(num_classes);
        let config = match name {
            "cnn" => config,
            "cnn_lite" => config.with_base_filters(16),
            "cnn_metric" => config.with_embedding_size(embedding_size.unwrap_or(128)),
            other => {
                return Err(Error::Config(format!(
                    "unknown backbone '{other}' (expected cnn, cnn_lite or cnn_metric)"
                )))
            }
        };

        if config.embedding_size == 0 && embedding_size.is_some() {
            return Err(Error::Config(format!(
                "Models.embedding_size is only valid for metric backbones, not '{name}'"
            )));
        }
        if embedding_size == Some(0) {
            return Err(Error::Config("Models.embedding_size must be > 0".into()));
        }
        Ok(config)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> VisionNet<B> {
        let widths = [self.base_filters, self.base_filters * 2, self.base_filters * 4];
        let mut blocks = Vec::with_capacity(widths.len());
        let mut channels = self.in_channels;
        for width in widths {
            blocks.push(ConvBlock::new(channels, width, device));
            channels = width;
        }

        let hidden = channels * 2;
        let out = if self.embedding_size > 0 {
            self.embedding_size
        } else {
            self.num_classes
        };

        VisionNet {
            blocks,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(channels, hidden).init(device),
            relu: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(hidden, out).init(device),
            embedding_size: self.embedding_size,
        }
    }
}

/// Conv 3x3 -> ReLU -> MaxPool 2x2
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    relu: Relu,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(self.relu.forward(self.conv.forward(x)))
    }
}

/// Small convolutional network with a classification or embedding head
#[derive(Module, Debug)]
pub struct VisionNet<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    global_pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
    relu: Relu,
    dropout: Dropout,
    head: Linear<B>,
    embedding_size: usize,
}

impl<B: Backend> Backbone<B> for VisionNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }

        let [batch, channels, _, _] = x.dims();
        let x = self.global_pool.forward(x).reshape([batch, channels]);
        let x = self.dropout.forward(self.relu.forward(self.fc.forward(x)));
        let x = self.head.forward(x);

        if self.embedding_size > 0 {
            l2_normalize(x)
        } else {
            x
        }
    }

    fn embedding_size(&self) -> Option<usize> {
        (self.embedding_size > 0).then_some(self.embedding_size)
    }
}

/// One-shot diagnostic of a borrowed model: parameter count and structure
pub fn log_model_summary<B: Backend, M: Module<B> + std::fmt::Display>(model: &M) {
    info!("Model has {} parameters", model.num_params());
    debug!("Model structure:\n{model}");
}
