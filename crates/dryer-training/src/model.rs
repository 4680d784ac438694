//! Trained-model wrapper and the architecture builder entry point.

use std::fmt;
use std::sync::Arc;

use burn::{module::Module, tensor::backend::AutodiffBackend};
use dryer_core::{
    ArchitectureKind, Error, ImageShape, LossKind, MetricKind, ModelConfig, OptimizerKind, Result,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::network::{Backbone, DryerRegressor};

/// Lifecycle of one model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelState {
    /// Configuration only, no network yet
    Unvalidated,
    /// Architecture instantiated, weights untrained
    Validated,
    Trained,
    FineTuned,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::Unvalidated => write!(f, "unvalidated"),
            ModelState::Validated => write!(f, "validated"),
            ModelState::Trained => write!(f, "trained"),
            ModelState::FineTuned => write!(f, "fine-tuned"),
        }
    }
}

/// Optimizer, loss and metrics bound to a model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileSpec {
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub weight_decay: Option<f64>,
    pub loss: LossKind,
    pub metrics: Vec<MetricKind>,
}

impl CompileSpec {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            optimizer: config.optimizer,
            learning_rate: config.learning_rate,
            weight_decay: config.weight_decay(),
            loss: config.loss,
            metrics: config.metric_kinds(),
        }
    }
}

/// Handle to one convolutional stage of a fusion network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerHandle {
    /// Position in forward order
    pub index: usize,
    pub name: String,
    pub filters: usize,
}

/// The conv stages a fine-tuning pass may freeze or release, tagged at build time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FineTunableGroup {
    layers: Vec<LayerHandle>,
}

impl FineTunableGroup {
    fn from_network<B: AutodiffBackend>(network: &DryerRegressor<B>) -> Self {
        let layers = network
            .backbone
            .conv_stages()
            .iter()
            .enumerate()
            .map(|(index, stage)| LayerHandle {
                index,
                name: format!("conv_{index}"),
                filters: stage.filters(),
            })
            .collect();
        Self { layers }
    }

    pub fn layers(&self) -> &[LayerHandle] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// One row of a model summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    pub name: String,
    pub output_width: usize,
    pub params: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub kind: ArchitectureKind,
    pub layers: Vec<LayerSummary>,
    pub total_params: usize,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Architecture: {}", self.kind)?;
        writeln!(f, "{:<20} {:>8} {:>10}", "layer", "width", "params")?;
        for layer in &self.layers {
            writeln!(
                f,
                "{:<20} {:>8} {:>10}",
                layer.name, layer.output_width, layer.params
            )?;
        }
        write!(f, "Total params: {}", self.total_params)
    }
}

/// A built network together with the configuration that produced it.
#[derive(Debug, Clone)]
pub struct TrainedModel<B: AutodiffBackend> {
    name: String,
    product_type: String,
    config: Arc<ModelConfig>,
    compile: CompileSpec,
    network: DryerRegressor<B>,
    fine_tunable: FineTunableGroup,
    image_shape: ImageShape,
    numeric_dim: usize,
    output_dim: usize,
    state: ModelState,
    device: B::Device,
}

/// Instantiates the architecture selected by `kind`.
///
/// Never fails: malformed hyperparameters were already replaced by their
/// defaults when the signature was resolved.
pub fn build<B: AutodiffBackend>(
    kind: ArchitectureKind,
    image_shape: ImageShape,
    numeric_dim: usize,
    output_dim: usize,
    config: Arc<ModelConfig>,
    device: &B::Device,
) -> TrainedModel<B> {
    let mut signature = config.architecture_signature();
    signature.kind = kind;
    let network = DryerRegressor::new(image_shape, numeric_dim, output_dim, &signature, device);
    let fine_tunable = FineTunableGroup::from_network(&network);
    info!(
        kind = %kind,
        params = network.num_params(),
        conv_stages = fine_tunable.len(),
        "built network"
    );

    TrainedModel {
        name: config.label.clone(),
        product_type: String::new(),
        compile: CompileSpec::from_config(&config),
        config,
        network,
        fine_tunable,
        image_shape,
        numeric_dim,
        output_dim,
        state: ModelState::Validated,
        device: device.clone(),
    }
}

impl<B: AutodiffBackend> TrainedModel<B> {
    pub fn with_identity(mut self, name: impl Into<String>, product_type: impl Into<String>) -> Self {
        self.name = name.into();
        self.product_type = product_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn product_type(&self) -> &str {
        &self.product_type
    }

    pub fn config(&self) -> &Arc<ModelConfig> {
        &self.config
    }

    pub fn compile_spec(&self) -> &CompileSpec {
        &self.compile
    }

    pub fn kind(&self) -> ArchitectureKind {
        self.network.kind()
    }

    pub fn network(&self) -> &DryerRegressor<B> {
        &self.network
    }

    pub fn fine_tunable(&self) -> &FineTunableGroup {
        &self.fine_tunable
    }

    pub fn image_shape(&self) -> ImageShape {
        self.image_shape
    }

    pub fn numeric_dim(&self) -> usize {
        self.numeric_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn is_validated(&self) -> bool {
        self.state != ModelState::Unvalidated
    }

    /// Swaps in a revised configuration.
    ///
    /// Only training-affecting fields may change once the network exists.
    pub fn update_config(&mut self, next: ModelConfig) -> Result<()> {
        if next.architecture_signature() != self.config.architecture_signature() {
            return Err(Error::ModelState(format!(
                "model '{}' is validated; architecture fields can no longer change",
                self.name
            )));
        }
        debug!(from = self.config.version, to = next.version, "config revised");
        self.compile = CompileSpec::from_config(&next);
        self.config = Arc::new(next);
        Ok(())
    }

    /// Same architecture, freshly initialized weights.
    pub fn fresh_network(&self) -> DryerRegressor<B> {
        let mut signature = self.config.architecture_signature();
        signature.kind = self.kind();
        DryerRegressor::new(
            self.image_shape,
            self.numeric_dim,
            self.output_dim,
            &signature,
            &self.device,
        )
    }

    pub(crate) fn replace_network(&mut self, network: DryerRegressor<B>, state: ModelState) {
        self.network = network;
        self.state = state;
    }

    pub fn summary(&self) -> ModelSummary {
        let mut layers = Vec::new();
        let mut push = |name: String, output_width: usize, params: usize| {
            layers.push(LayerSummary {
                name,
                output_width,
                params,
            })
        };

        match &self.network.backbone {
            Backbone::Numeric(backbone) => {
                push(
                    "numeric_branch".to_string(),
                    backbone.numeric.width(),
                    backbone.numeric.num_params(),
                );
            }
            Backbone::ImageFusion(backbone) => {
                for (index, stage) in backbone.image.stages.iter().enumerate() {
                    push(format!("conv_{index}"), stage.filters(), stage.num_params());
                }
                push(
                    "image_projection".to_string(),
                    backbone.image.projection.width(),
                    backbone.image.projection.num_params(),
                );
                push(
                    "numeric_branch".to_string(),
                    backbone.numeric.width(),
                    backbone.numeric.num_params(),
                );
            }
        }
        for (index, block) in self.network.trunk.iter().enumerate() {
            push(format!("dense_{index}"), block.width(), block.num_params());
        }
        push(
            "head".to_string(),
            self.network.output_dim(),
            self.network.head.num_params(),
        );

        ModelSummary {
            kind: self.kind(),
            layers,
            total_params: self.network.num_params(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        name: String,
        product_type: String,
        config: Arc<ModelConfig>,
        network: DryerRegressor<B>,
        image_shape: ImageShape,
        numeric_dim: usize,
        output_dim: usize,
        state: ModelState,
        device: B::Device,
    ) -> Self {
        let fine_tunable = FineTunableGroup::from_network(&network);
        Self {
            name,
            product_type,
            compile: CompileSpec::from_config(&config),
            config,
            network,
            fine_tunable,
            image_shape,
            numeric_dim,
            output_dim,
            state,
            device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use dryer_core::{FEATURE_DIM, OUTPUT_DIM};

    type TestBackend = Autodiff<NdArray>;

    fn fusion_config() -> Arc<ModelConfig> {
        Arc::new(ModelConfig {
            architecture: ArchitectureKind::ImageFusion,
            cnn_filters: "4,8".to_string(),
            hidden_layers: "16,8".to_string(),
            ..Default::default()
        })
    }

    fn build_fusion() -> TrainedModel<TestBackend> {
        build(
            ArchitectureKind::ImageFusion,
            ImageShape::new(32, 192),
            FEATURE_DIM,
            OUTPUT_DIM,
            fusion_config(),
            &Default::default(),
        )
    }

    #[test]
    fn test_build_is_structurally_idempotent() {
        let a = build_fusion();
        let b = build_fusion();

        let shapes = |m: &TrainedModel<TestBackend>| {
            m.summary()
                .layers
                .iter()
                .map(|l| (l.name.clone(), l.output_width, l.params))
                .collect::<Vec<_>>()
        };
        assert_eq!(shapes(&a), shapes(&b));
        assert_eq!(a.fine_tunable(), b.fine_tunable());

        let wa = a.network().head.weight.val().into_data();
        let wb = b.network().head.weight.val().into_data();
        assert_ne!(wa, wb);
    }

    #[test]
    fn test_fine_tunable_group_tags_conv_stages() {
        let model = build_fusion();
        let names: Vec<_> = model
            .fine_tunable()
            .layers()
            .iter()
            .map(|l| (l.name.as_str(), l.filters))
            .collect();
        assert_eq!(names, vec![("conv_0", 4), ("conv_1", 8)]);
        assert_eq!(model.state(), ModelState::Validated);
    }

    #[test]
    fn test_numeric_build_has_no_fine_tunable_layers() {
        let model: TrainedModel<TestBackend> = build(
            ArchitectureKind::Numeric,
            ImageShape::new(32, 192),
            FEATURE_DIM,
            OUTPUT_DIM,
            Arc::new(ModelConfig::default()),
            &Default::default(),
        );
        assert!(model.fine_tunable().is_empty());
        let summary = model.summary();
        assert_eq!(summary.layers.first().map(|l| l.name.as_str()), Some("numeric_branch"));
        assert_eq!(summary.layers.last().map(|l| l.output_width), Some(OUTPUT_DIM));
        assert_eq!(
            summary.layers.iter().map(|l| l.params).sum::<usize>(),
            summary.total_params
        );
    }

    #[test]
    fn test_update_config_guards_architecture() {
        let mut model = build_fusion();
        let more_epochs = model.config().revise(|c| c.n_epochs = 50);
        model.update_config(more_epochs).unwrap();
        assert_eq!(model.config().n_epochs, 50);

        let wider = model.config().revise(|c| c.cnn_filters = "16,32".to_string());
        assert!(matches!(model.update_config(wider), Err(Error::ModelState(_))));
        assert_eq!(model.config().cnn_filters, "4,8");
    }
}
