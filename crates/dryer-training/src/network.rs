//! Burn modules for the numeric and image-fusion regressors.
//!
//! Layout:
//! - image branch: conv stages (conv, activation, optional batch norm, max pool),
//!   flatten, dense projection
//! - numeric branch: dense projection, optional layer norm and dropout
//! - trunk: configured hidden dense layers
//! - head: linear layer, no activation

use burn::{
    module::{Ignored, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, LayerNorm,
        LayerNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation, backend::Backend, Tensor},
};
use dryer_core::{Activation, ArchitectureKind, ArchitectureSignature, ImageShape, WeightInit};
use tracing::warn;

/// Width of the numeric branch and of the image projection.
pub const BRANCH_WIDTH: usize = 64;

pub fn initializer(init: WeightInit) -> Initializer {
    match init {
        WeightInit::GlorotUniform => Initializer::XavierUniform { gain: 1.0 },
        WeightInit::HeNormal => Initializer::KaimingNormal {
            gain: 2f64.sqrt(),
            fan_out_only: false,
        },
        WeightInit::HeUniform => Initializer::KaimingUniform {
            gain: 2f64.sqrt(),
            fan_out_only: false,
        },
        WeightInit::RandomNormal => Initializer::Normal {
            mean: 0.0,
            std: 0.05,
        },
    }
}

fn activate<B: Backend, const D: usize>(kind: Activation, x: Tensor<B, D>) -> Tensor<B, D> {
    match kind {
        Activation::Relu => activation::relu(x),
        Activation::Sigmoid => activation::sigmoid(x),
        Activation::Tanh => activation::tanh(x),
        Activation::Linear => x,
    }
}

/// Linear layer, activation, then optional layer norm and dropout.
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub linear: Linear<B>,
    pub norm: Option<LayerNorm<B>>,
    pub dropout: Option<Dropout>,
    activation: Ignored<Activation>,
}

impl<B: Backend> DenseBlock<B> {
    pub fn new(
        d_input: usize,
        d_output: usize,
        signature: &ArchitectureSignature,
        device: &B::Device,
    ) -> Self {
        let linear = LinearConfig::new(d_input, d_output)
            .with_initializer(initializer(signature.weight_init))
            .init(device);
        let norm = signature
            .batch_norm
            .then(|| LayerNormConfig::new(d_output).init(device));
        let dropout = signature
            .dropout
            .map(|prob| DropoutConfig::new(prob).init());

        Self {
            linear,
            norm,
            dropout,
            activation: Ignored(signature.activation),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = activate(self.activation.0, self.linear.forward(x));
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        }
    }

    pub fn width(&self) -> usize {
        self.linear.weight.val().dims()[1]
    }
}

/// Convolution, activation, optional batch norm, optional max pool.
#[derive(Module, Debug)]
pub struct ConvStage<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Option<BatchNorm<B, 2>>,
    pub pool: Option<MaxPool2d>,
    activation: Ignored<Activation>,
}

impl<B: Backend> ConvStage<B> {
    pub fn new(
        in_channels: usize,
        filters: usize,
        pool: Option<[usize; 2]>,
        signature: &ArchitectureSignature,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, filters], signature.kernel_size)
            .with_padding(PaddingConfig2d::Same)
            .with_initializer(initializer(signature.weight_init))
            .init(device);
        let norm = signature
            .batch_norm
            .then(|| BatchNormConfig::new(filters).init(device));
        let pool = pool.map(|size| MaxPool2dConfig::new(size).with_strides(size).init());

        Self {
            conv,
            norm,
            pool,
            activation: Ignored(signature.activation),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = activate(self.activation.0, self.conv.forward(x));
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }

    pub fn filters(&self) -> usize {
        self.conv.weight.val().dims()[0]
    }
}

/// Conv stages followed by flattening and a dense projection.
#[derive(Module, Debug)]
pub struct ImageBranch<B: Backend> {
    pub stages: Vec<ConvStage<B>>,
    pub projection: DenseBlock<B>,
}

impl<B: Backend> ImageBranch<B> {
    pub fn new(image_shape: ImageShape, signature: &ArchitectureSignature, device: &B::Device) -> Self {
        let mut filters = signature.conv_filters.clone();
        for _ in 0..signature.additional_conv_stages {
            filters.extend(signature.conv_filters.iter().copied());
        }

        let [pool_h, pool_w] = signature.pool_size;
        let (mut height, mut width) = (image_shape.height, image_shape.width);
        let mut in_channels = image_shape.channels();
        let mut stages = Vec::with_capacity(filters.len());

        for (index, &count) in filters.iter().enumerate() {
            let pool = if height >= pool_h && width >= pool_w {
                height /= pool_h;
                width /= pool_w;
                Some([pool_h, pool_w])
            } else {
                warn!(
                    stage = index,
                    height, width, "feature map smaller than the pool window, stage keeps its size"
                );
                None
            };
            stages.push(ConvStage::new(in_channels, count, pool, signature, device));
            in_channels = count;
        }

        let flat = in_channels * height * width;
        let projection = DenseBlock::new(flat, BRANCH_WIDTH, signature, device);
        Self { stages, projection }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .stages
            .iter()
            .fold(images, |x, stage| stage.forward(x));
        let [batch, channels, height, width] = x.dims();
        self.projection
            .forward(x.reshape([batch, channels * height * width]))
    }
}

#[derive(Module, Debug)]
pub struct NumericBackbone<B: Backend> {
    pub numeric: DenseBlock<B>,
}

#[derive(Module, Debug)]
pub struct FusionBackbone<B: Backend> {
    pub image: ImageBranch<B>,
    pub numeric: DenseBlock<B>,
}

/// Input branches, one variant per architecture kind.
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Numeric(NumericBackbone<B>),
    ImageFusion(FusionBackbone<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>, numeric: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Backbone::Numeric(backbone) => backbone.numeric.forward(numeric),
            Backbone::ImageFusion(backbone) => {
                let image = backbone.image.forward(images);
                let numeric = backbone.numeric.forward(numeric);
                Tensor::cat(vec![image, numeric], 1)
            }
        }
    }

    pub fn output_width(&self) -> usize {
        match self {
            Backbone::Numeric(backbone) => backbone.numeric.width(),
            Backbone::ImageFusion(backbone) => {
                backbone.image.projection.width() + backbone.numeric.width()
            }
        }
    }

    /// Conv stages in forward order; empty for numeric networks.
    pub fn conv_stages(&self) -> &[ConvStage<B>] {
        match self {
            Backbone::Numeric(_) => &[],
            Backbone::ImageFusion(backbone) => &backbone.image.stages,
        }
    }
}

/// Multi-output regressor mapping (images, numeric features) to process targets.
#[derive(Module, Debug)]
pub struct DryerRegressor<B: Backend> {
    pub backbone: Backbone<B>,
    pub trunk: Vec<DenseBlock<B>>,
    pub head: Linear<B>,
}

impl<B: Backend> DryerRegressor<B> {
    pub fn new(
        image_shape: ImageShape,
        numeric_dim: usize,
        output_dim: usize,
        signature: &ArchitectureSignature,
        device: &B::Device,
    ) -> Self {
        let numeric = DenseBlock::new(numeric_dim, BRANCH_WIDTH, signature, device);
        let backbone = match signature.kind {
            ArchitectureKind::Numeric => Backbone::Numeric(NumericBackbone { numeric }),
            ArchitectureKind::ImageFusion => Backbone::ImageFusion(FusionBackbone {
                image: ImageBranch::new(image_shape, signature, device),
                numeric,
            }),
        };

        let mut width = backbone.output_width();
        let mut trunk = Vec::with_capacity(signature.hidden_units.len());
        for &units in &signature.hidden_units {
            trunk.push(DenseBlock::new(width, units, signature, device));
            width = units;
        }

        let head = LinearConfig::new(width, output_dim)
            .with_initializer(initializer(signature.weight_init))
            .init(device);

        Self {
            backbone,
            trunk,
            head,
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>, numeric: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.backbone.forward(images, numeric);
        let x = self.trunk.iter().fold(x, |x, block| block.forward(x));
        self.head.forward(x)
    }

    pub fn kind(&self) -> ArchitectureKind {
        match self.backbone {
            Backbone::Numeric(_) => ArchitectureKind::Numeric,
            Backbone::ImageFusion(_) => ArchitectureKind::ImageFusion,
        }
    }

    pub fn conv_stage(&self, index: usize) -> Option<&ConvStage<B>> {
        self.backbone.conv_stages().get(index)
    }

    pub fn output_dim(&self) -> usize {
        self.head.weight.val().dims()[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use dryer_core::ModelConfig;

    type TestBackend = NdArray;

    fn signature(kind: ArchitectureKind) -> ArchitectureSignature {
        ModelConfig {
            architecture: kind,
            cnn_filters: "4,8".to_string(),
            hidden_layers: "16".to_string(),
            ..Default::default()
        }
        .architecture_signature()
    }

    #[test]
    fn test_numeric_forward_shape() {
        let device = Default::default();
        let model = DryerRegressor::<TestBackend>::new(
            ImageShape::new(32, 192),
            11,
            11,
            &signature(ArchitectureKind::Numeric),
            &device,
        );
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 192], &device);
        let numeric = Tensor::<TestBackend, 2>::ones([2, 11], &device);
        assert_eq!(model.forward(images, numeric).dims(), [2, 11]);
        assert_eq!(model.kind(), ArchitectureKind::Numeric);
        assert!(model.conv_stage(0).is_none());
    }

    #[test]
    fn test_fusion_forward_shape() {
        let device = Default::default();
        let model = DryerRegressor::<TestBackend>::new(
            ImageShape::new(32, 192),
            11,
            11,
            &signature(ArchitectureKind::ImageFusion),
            &device,
        );
        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 32, 192], &device);
        let numeric = Tensor::<TestBackend, 2>::ones([3, 11], &device);
        assert_eq!(model.forward(images, numeric).dims(), [3, 11]);
        assert_eq!(model.backbone.conv_stages().len(), 2);
        assert_eq!(model.backbone.output_width(), 2 * BRANCH_WIDTH);
    }

    #[test]
    fn test_additional_stages_repeat_filter_list() {
        let device = Default::default();
        let mut sig = signature(ArchitectureKind::ImageFusion);
        sig.additional_conv_stages = 2;
        let branch = ImageBranch::<TestBackend>::new(ImageShape::new(32, 192), &sig, &device);
        let filters: Vec<_> = branch.stages.iter().map(|s| s.filters()).collect();
        assert_eq!(filters.len(), sig.conv_filters.len() * (1 + 2));
        assert_eq!(filters, vec![4, 8, 4, 8, 4, 8]);
    }

    #[test]
    fn test_tiny_images_skip_pooling() {
        let device = Default::default();
        let mut sig = signature(ArchitectureKind::ImageFusion);
        sig.additional_conv_stages = 6;
        let model = DryerRegressor::<TestBackend>::new(ImageShape::new(8, 48), 11, 11, &sig, &device);
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 8, 48], &device);
        let numeric = Tensor::<TestBackend, 2>::zeros([1, 11], &device);
        assert_eq!(model.forward(images, numeric).dims(), [1, 11]);
        assert!(model.backbone.conv_stages().iter().any(|s| s.pool.is_none()));
    }
}
