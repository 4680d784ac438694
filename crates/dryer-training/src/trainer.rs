//! The training engine: epoch loop, full training and the single-epoch
//! update used for continual fine-tuning.

use burn::{
    nn::loss::{HuberLossConfig, MseLoss, Reduction},
    optim::{
        decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig,
    },
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Tensor},
};
use dryer_core::{
    ArchitectureKind, EpochReport, LossKind, MetricKind, OptimizerKind, Result, TrainingHistory,
};
use dryer_features::{ExtractedExample, FeatureExtractor, TrainingSet};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactInfo, ArtifactStore};
use crate::batch::{batch_examples, gather_examples, SkippedSet};
use crate::model::{CompileSpec, LayerHandle, ModelState, TrainedModel};
use crate::network::DryerRegressor;

/// How one call to [`fit`] runs.
#[derive(Debug, Clone)]
pub struct FitPlan {
    pub epochs: usize,
    pub batch_size: usize,
    /// Seed for per-epoch shuffling
    pub shuffle_seed: u64,
    /// Restore the lowest-loss epoch snapshot at the end
    pub keep_best: bool,
    /// Conv stages whose parameters stay fixed
    pub frozen: Vec<LayerHandle>,
}

impl FitPlan {
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        Self {
            epochs,
            batch_size,
            shuffle_seed: 42,
            keep_best: false,
            frozen: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = seed;
        self
    }

    pub fn with_best_checkpoint(mut self, keep_best: bool) -> Self {
        self.keep_best = keep_best;
        self
    }

    pub fn with_frozen(mut self, frozen: Vec<LayerHandle>) -> Self {
        self.frozen = frozen;
        self
    }
}

/// Result of a full training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifact: ArtifactInfo,
    pub examples_used: usize,
    pub skipped: Vec<SkippedSet>,
    pub history: TrainingHistory,
}

pub fn regression_loss<B: Backend>(
    kind: LossKind,
    output: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    match kind {
        LossKind::Mse => MseLoss::new().forward(output, targets, Reduction::Mean),
        LossKind::Mae => (output - targets).abs().mean(),
        LossKind::Huber => HuberLossConfig::new(1.0)
            .init()
            .forward(output, targets, Reduction::Mean),
    }
}

/// Trains `network` on `examples` with the optimizer named in `compile`.
///
/// A fresh optimizer state is created on every call.
pub fn fit<B: AutodiffBackend>(
    network: DryerRegressor<B>,
    examples: &[&ExtractedExample],
    compile: &CompileSpec,
    plan: &FitPlan,
    device: &B::Device,
) -> Result<(DryerRegressor<B>, TrainingHistory)> {
    let decay = compile
        .weight_decay
        .map(|penalty| WeightDecayConfig::new(penalty as f32));

    match compile.optimizer {
        OptimizerKind::Adam => {
            let mut optimizer = AdamConfig::new()
                .with_weight_decay(decay)
                .init::<B, DryerRegressor<B>>();
            run_epochs(network, &mut optimizer, examples, compile, plan, device)
        }
        OptimizerKind::Sgd => {
            let mut optimizer = SgdConfig::new()
                .with_weight_decay(decay)
                .init::<B, DryerRegressor<B>>();
            run_epochs(network, &mut optimizer, examples, compile, plan, device)
        }
        OptimizerKind::RmsProp => {
            let mut optimizer = RmsPropConfig::new()
                .with_weight_decay(decay)
                .init::<B, DryerRegressor<B>>();
            run_epochs(network, &mut optimizer, examples, compile, plan, device)
        }
    }
}

fn run_epochs<B, O>(
    mut network: DryerRegressor<B>,
    optimizer: &mut O,
    examples: &[&ExtractedExample],
    compile: &CompileSpec,
    plan: &FitPlan,
    device: &B::Device,
) -> Result<(DryerRegressor<B>, TrainingHistory)>
where
    B: AutodiffBackend,
    O: Optimizer<DryerRegressor<B>, B>,
{
    let batch_size = plan.batch_size.max(1);
    let mut rng = ChaCha8Rng::seed_from_u64(plan.shuffle_seed);
    let mut indices: Vec<usize> = (0..examples.len()).collect();
    let mut history = TrainingHistory::new();
    let mut best: Option<(f64, DryerRegressor<B>)> = None;

    for epoch in 1..=plan.epochs {
        indices.shuffle(&mut rng);

        let mut loss_sum = 0.0;
        let mut abs_sum = 0.0;
        let mut sq_sum = 0.0;
        let mut seen = 0usize;

        for chunk in indices.chunks(batch_size) {
            let items: Vec<&ExtractedExample> = chunk.iter().map(|&i| examples[i]).collect();
            let batch = batch_examples::<B>(&items, device);
            let rows = items.len() as f64;

            let output = network.forward(batch.images, batch.numeric);
            let error = output.clone().detach() - batch.targets.clone();
            abs_sum += error.clone().abs().mean().into_scalar().elem::<f64>() * rows;
            sq_sum += error.powf_scalar(2.0).mean().into_scalar().elem::<f64>() * rows;

            let loss = regression_loss(compile.loss, output, batch.targets);
            loss_sum += loss.clone().into_scalar().elem::<f64>() * rows;
            seen += items.len();

            let mut grads = loss.backward();
            for handle in &plan.frozen {
                if let Some(stage) = network.conv_stage(handle.index) {
                    // Only the convolution is frozen; the stage's batch norm keeps learning.
                    let _ = GradientsParams::from_module(&mut grads, &stage.conv);
                }
            }
            let grads = GradientsParams::from_grads(grads, &network);
            network = optimizer.step(compile.learning_rate, network, grads);
        }

        let denom = seen.max(1) as f64;
        let loss = loss_sum / denom;
        let metrics = compile
            .metrics
            .iter()
            .map(|kind| {
                let value = match kind {
                    MetricKind::Mae => abs_sum / denom,
                    MetricKind::Mse => sq_sum / denom,
                    MetricKind::Rmse => (sq_sum / denom).sqrt(),
                };
                (*kind, value)
            })
            .collect();
        let report = EpochReport {
            epoch,
            loss,
            metrics,
        };
        info!("{report}");

        if !loss.is_finite() {
            warn!(epoch, "non-finite training loss");
        } else if plan.keep_best && best.as_ref().map_or(true, |(b, _)| loss < *b) {
            debug!(epoch, loss, "new best snapshot");
            best = Some((loss, network.clone()));
        }
        history.push(report);
    }

    if let Some((loss, snapshot)) = best {
        info!(loss, "restoring lowest-loss snapshot");
        network = snapshot;
    }
    Ok((network, history))
}

/// Trains `model` on every set of `product_type` and persists a new version.
pub fn train<'a, B: AutodiffBackend>(
    model: &mut TrainedModel<B>,
    sets: impl IntoIterator<Item = &'a TrainingSet>,
    product_type: &str,
    extractor: &FeatureExtractor,
    store: &ArtifactStore,
) -> Result<TrainingOutcome> {
    if model.config().fine_tuning && model.kind() != ArchitectureKind::ImageFusion {
        warn!(
            architecture = %model.kind(),
            "fine-tuning only applies to image-fusion networks, disabling it"
        );
        let revised = model.config().revise(|c| {
            c.fine_tuning = false;
            c.fine_tuning_layers = 0;
        });
        model.update_config(revised)?;
    }

    let config = model.config().clone();
    let gathered = gather_examples(sets, product_type, extractor, config.use_augmentation)?;
    let plan = FitPlan::new(config.n_epochs, config.batch_size)
        .with_seed(config.cv_seed)
        .with_best_checkpoint(config.use_checkpoints);

    info!(
        model = model.name(),
        product = product_type,
        examples = gathered.len(),
        epochs = plan.epochs,
        batch_size = plan.batch_size,
        "starting training"
    );
    let (network, history) = fit(
        model.network().clone(),
        &gathered.refs(),
        model.compile_spec(),
        &plan,
        model.device(),
    )?;
    model.replace_network(network, ModelState::Trained);

    let final_loss = if plan.keep_best {
        history.best_epoch().map(|e| e.loss)
    } else {
        history.final_loss()
    };
    let artifact = store.save(model, gathered.len(), final_loss)?;

    Ok(TrainingOutcome {
        artifact,
        examples_used: gathered.len(),
        skipped: gathered.skipped,
        history,
    })
}

/// One epoch over `examples` with `frozen` stages held fixed.
///
/// The optimizer is rebuilt from the model's current compile spec.
pub fn update_one_epoch<B: AutodiffBackend>(
    model: &mut TrainedModel<B>,
    examples: &[&ExtractedExample],
    frozen: Vec<LayerHandle>,
) -> Result<EpochReport> {
    let plan = FitPlan::new(1, model.config().batch_size)
        .with_seed(model.config().cv_seed)
        .with_frozen(frozen);
    let (network, mut history) = fit(
        model.network().clone(),
        examples,
        model.compile_spec(),
        &plan,
        model.device(),
    )?;
    model.replace_network(network, ModelState::FineTuned);
    history.epochs.pop().ok_or_else(|| {
        dryer_core::Error::InsufficientData("fine-tuning ran no epoch".to_string())
    })
}
