//! Architecture builder, training engine and inference service.
//!
//! This crate provides:
//! - The two network families (numeric regressor, image+numeric fusion)
//! - Full training with a lowest-loss checkpoint and versioned artifacts
//! - Seeded k-fold cross-validation on fresh networks
//! - Read-only evaluation and single-record prediction

pub mod artifacts;
pub mod backend;
pub mod batch;
pub mod evaluator;
pub mod kfold;
pub mod model;
pub mod network;
pub mod trainer;

pub use artifacts::{ArtifactInfo, ArtifactMetadata, ArtifactStore};
pub use backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
pub use batch::{gather_examples, GatheredExamples, SkippedSet};
pub use evaluator::{evaluate, predict, EvaluationReport, Prediction};
pub use kfold::{cross_validate, CrossValidationReport, Fold, KFold};
pub use model::{
    build, CompileSpec, FineTunableGroup, LayerHandle, ModelState, ModelSummary, TrainedModel,
};
pub use network::DryerRegressor;
pub use trainer::{fit, train, update_one_epoch, FitPlan, TrainingOutcome};

pub mod prelude {
    pub use super::artifacts::ArtifactStore;
    pub use super::evaluator::{evaluate, predict};
    pub use super::kfold::cross_validate;
    pub use super::model::{build, ModelState, TrainedModel};
    pub use super::trainer::train;
}
