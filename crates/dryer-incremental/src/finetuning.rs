//! Continual fine-tuning with selective conv-stage freezing.
//!
//! With fine-tuning enabled on an image-fusion network, every conv stage is
//! frozen and then the last `fine_tuning_layers` stages are made trainable
//! again. Freezing covers a stage's convolution only; its batch norm keeps
//! learning. Frozen stages still pass gradients through to the dense layers
//! downstream, so `fine_tuning_layers = 0` trains the dense part and the
//! conv-stage norms.
//! Exactly one epoch runs over the supplied batch with a fresh optimizer.

use std::fmt;

use burn::tensor::backend::AutodiffBackend;
use dryer_core::{ArchitectureKind, EpochReport, Error, Result};
use dryer_features::ExtractedExample;
use dryer_training::{update_one_epoch, LayerHandle, TrainedModel};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How strictly the layer-freezing request is honored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FineTuneMode {
    /// Degrade to a plain update when freezing cannot be applied, with a warning
    #[default]
    Auto,
    /// Fail with `ModelState` when freezing cannot be applied as configured
    RequireLayerFreezing,
}

/// Which conv stages stay fixed during one update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainabilityPlan {
    pub frozen: Vec<LayerHandle>,
    pub trainable: Vec<LayerHandle>,
}

impl TrainabilityPlan {
    /// Everything trainable.
    pub fn all_trainable(layers: &[LayerHandle]) -> Self {
        Self {
            frozen: Vec::new(),
            trainable: layers.to_vec(),
        }
    }

    /// Freezes all but the last `unfrozen` layers.
    pub fn keep_last(layers: &[LayerHandle], unfrozen: usize) -> Self {
        let split = layers.len().saturating_sub(unfrozen);
        Self {
            frozen: layers[..split].to_vec(),
            trainable: layers[split..].to_vec(),
        }
    }
}

impl fmt::Display for TrainabilityPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |layers: &[LayerHandle]| {
            layers
                .iter()
                .map(|l| l.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "frozen [{}], trainable [{}]",
            names(&self.frozen),
            names(&self.trainable)
        )
    }
}

#[derive(Debug, Clone)]
pub struct FineTuneReport {
    pub epoch: EpochReport,
    pub plan: TrainabilityPlan,
    pub examples_used: usize,
    /// Fine-tuning was requested but switched off for this architecture
    pub fine_tuning_disabled: bool,
}

/// Decides the trainability plan, revising the model config when fine-tuning
/// has to be switched off.
pub fn plan_trainability<B: AutodiffBackend>(
    model: &mut TrainedModel<B>,
    mode: FineTuneMode,
) -> Result<(TrainabilityPlan, bool)> {
    let layers = model.fine_tunable().layers().to_vec();
    let config = model.config().clone();

    if !config.fine_tuning {
        return Ok((TrainabilityPlan::all_trainable(&layers), false));
    }

    if model.kind() != ArchitectureKind::ImageFusion || layers.is_empty() {
        if mode == FineTuneMode::RequireLayerFreezing {
            return Err(Error::ModelState(format!(
                "{} architecture has no convolutional layers to freeze",
                model.kind()
            )));
        }
        warn!(
            architecture = %model.kind(),
            "no convolutional layers to freeze, disabling fine-tuning and running a plain update"
        );
        model.update_config(config.revise(|c| {
            c.fine_tuning = false;
            c.fine_tuning_layers = 0;
        }))?;
        return Ok((TrainabilityPlan::all_trainable(&layers), true));
    }

    let mut unfrozen = config.fine_tuning_layers;
    if unfrozen > layers.len() {
        if mode == FineTuneMode::RequireLayerFreezing {
            return Err(Error::ModelState(format!(
                "fine_tuning_layers = {unfrozen} but the network has only {} conv stages",
                layers.len()
            )));
        }
        warn!(
            requested = unfrozen,
            available = layers.len(),
            "fine_tuning_layers exceeds the conv stage count, unfreezing all of them"
        );
        unfrozen = layers.len();
    }
    Ok((TrainabilityPlan::keep_last(&layers, unfrozen), false))
}

/// Runs one fine-tuning epoch over `examples`.
pub fn fine_tune<B: AutodiffBackend>(
    model: &mut TrainedModel<B>,
    examples: &[ExtractedExample],
    mode: FineTuneMode,
) -> Result<FineTuneReport> {
    if examples.is_empty() {
        return Err(Error::InsufficientData(
            "fine-tuning needs at least one new example".to_string(),
        ));
    }
    let shape = model.image_shape();
    if model.kind() == ArchitectureKind::ImageFusion {
        if let Some(example) = examples
            .iter()
            .find(|e| (e.image.height, e.image.width) != (shape.height, shape.width))
        {
            return Err(Error::ModelState(format!(
                "model '{}' takes {}x{} images but the batch holds {}x{}",
                model.name(),
                shape.height,
                shape.width,
                example.image.height,
                example.image.width
            )));
        }
    }

    let (plan, fine_tuning_disabled) = plan_trainability(model, mode)?;
    info!(
        model = model.name(),
        examples = examples.len(),
        "fine-tuning one epoch, {plan}"
    );

    let refs: Vec<&ExtractedExample> = examples.iter().collect();
    let epoch = update_one_epoch(model, &refs, plan.frozen.clone())?;

    Ok(FineTuneReport {
        epoch,
        plan,
        examples_used: examples.len(),
        fine_tuning_disabled,
    })
}
