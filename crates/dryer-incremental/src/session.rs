//! The model lifecycle controller.
//!
//! A session owns one configuration and, once validated, one model. Every
//! engine call goes through here so the lifecycle state stays consistent.

use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use dryer_core::{
    Error, ImagePair, ModelConfig, ProductionRecord, Result, ValidationEntry, FEATURE_DIM,
    OUTPUT_DIM,
};
use dryer_features::{FeatureExtractor, TrainingSetRegistry};
use dryer_training::{
    build, cross_validate, evaluate, predict, train, ArtifactInfo, ArtifactStore,
    CrossValidationReport, EvaluationReport, ModelState, ModelSummary, Prediction, TrainedModel,
    TrainingOutcome,
};
use tracing::{info, warn};

use crate::finetuning::{FineTuneMode, FineTuneReport};
use crate::production::ProductionBuffer;

pub struct ModelSession<B: AutodiffBackend> {
    config: Arc<ModelConfig>,
    model: Option<TrainedModel<B>>,
    store: ArtifactStore,
    extractor: FeatureExtractor,
    device: B::Device,
    /// Examples and final loss of the last weight update, for the artifact sidecar
    last_update: (usize, Option<f64>),
}

impl<B: AutodiffBackend> ModelSession<B> {
    pub fn new(config: ModelConfig, store: ArtifactStore, device: B::Device) -> Self {
        Self {
            config: Arc::new(config),
            model: None,
            store,
            extractor: FeatureExtractor::new(),
            device,
            last_update: (0, None),
        }
    }

    pub fn with_extractor(mut self, extractor: FeatureExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &Arc<ModelConfig> {
        &self.config
    }

    pub fn model(&self) -> Option<&TrainedModel<B>> {
        self.model.as_ref()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn state(&self) -> ModelState {
        self.model
            .as_ref()
            .map_or(ModelState::Unvalidated, |m| m.state())
    }

    /// Replaces the configuration.
    ///
    /// Before validation anything may change; afterwards only fields that
    /// leave the architecture untouched.
    pub fn set_config(&mut self, next: ModelConfig) -> Result<()> {
        let next = next.sanitized();
        if let Some(model) = self.model.as_mut() {
            model.update_config(next)?;
            self.config = model.config().clone();
        } else {
            self.config = Arc::new(next);
        }
        Ok(())
    }

    /// Builds the network for `product_type` from the current config.
    pub fn validate(&mut self, name: &str, product_type: &str) -> Result<&TrainedModel<B>> {
        if let Some(model) = &self.model {
            return Err(Error::ModelState(format!(
                "model '{}' is already validated; reset the session first",
                model.name()
            )));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::ModelState("a model needs a name".to_string()));
        }
        if product_type.trim().is_empty() {
            return Err(Error::ModelState("a model needs a product type".to_string()));
        }

        self.config = Arc::new(self.config.sanitized());
        let model = build::<B>(
            self.config.architecture,
            self.extractor.image_shape(),
            FEATURE_DIM,
            OUTPUT_DIM,
            self.config.clone(),
            &self.device,
        )
        .with_identity(name, product_type.trim());
        info!(model = name, product = product_type, "model validated");
        Ok(self.model.insert(model))
    }

    /// Drops the current model; the config is kept.
    pub fn reset(&mut self) {
        if let Some(model) = self.model.take() {
            info!(model = model.name(), "session reset");
        }
        self.last_update = (0, None);
    }

    /// Loads a persisted version and makes it the session's model.
    ///
    /// The extractor switches to the image side the artifact was trained
    /// with, so later features always match the network's input shape.
    pub fn load(&mut self, artifact: &ArtifactInfo) -> Result<&TrainedModel<B>> {
        let model = self.store.load::<B>(artifact, &self.device)?;
        let shape = model.image_shape();
        if shape != self.extractor.image_shape() {
            let adapted = self.extractor.clone().with_image_side(shape.height as u32);
            if adapted.image_shape() != shape {
                return Err(Error::ModelState(format!(
                    "artifact '{}' expects {}x{} image inputs, which no image side produces",
                    artifact.name(),
                    shape.height,
                    shape.width
                )));
            }
            warn!(
                artifact = artifact.name(),
                side = shape.height,
                configured = self.extractor.image_shape().height,
                "using the image side the model was trained with"
            );
            self.extractor = adapted;
        }
        self.config = model.config().clone();
        self.last_update = (
            artifact.metadata.examples_used,
            artifact.metadata.final_loss,
        );
        Ok(self.model.insert(model))
    }

    /// Loads the newest version of `product_type` unless a model is present.
    fn ensure_model(&mut self, product_type: &str) -> Result<()> {
        if self.model.is_some() {
            return Ok(());
        }
        let artifact = self.store.latest(product_type)?.ok_or_else(|| {
            Error::NotFound(format!("no trained model for product type '{product_type}'"))
        })?;
        self.load(&artifact)?;
        Ok(())
    }

    pub fn train(&mut self, sets: &TrainingSetRegistry) -> Result<TrainingOutcome> {
        let model = self.model.as_mut().ok_or_else(not_validated)?;
        let product = model.product_type().to_string();
        let outcome = train(
            model,
            sets.for_product(&product),
            &product,
            &self.extractor,
            &self.store,
        )?;
        self.config = model.config().clone();
        self.last_update = (outcome.examples_used, outcome.artifact.metadata.final_loss);
        Ok(outcome)
    }

    pub fn cross_validate(&self, sets: &TrainingSetRegistry) -> Result<CrossValidationReport> {
        let model = self.model.as_ref().ok_or_else(not_validated)?;
        let product = model.product_type();
        cross_validate(model, sets.for_product(product), product, &self.extractor)
    }

    /// One fine-tuning epoch over the buffered production examples.
    ///
    /// The result is kept in memory; call [`Self::save`] to persist it.
    pub fn fine_tune(
        &mut self,
        buffer: &mut ProductionBuffer,
        mode: FineTuneMode,
    ) -> Result<FineTuneReport> {
        let model = self.model.as_mut().ok_or_else(not_validated)?;
        if model.state() == ModelState::Validated {
            warn!(model = model.name(), "fine-tuning a model that was never trained");
        }
        let report = buffer.fine_tune(model, mode)?;
        self.config = model.config().clone();
        self.last_update = (report.examples_used, Some(report.epoch.loss));
        Ok(report)
    }

    pub fn evaluate(
        &mut self,
        product_type: &str,
        entries: &[ValidationEntry],
    ) -> Result<EvaluationReport> {
        self.ensure_model(product_type)?;
        let model = self.model.as_ref().ok_or_else(not_validated)?;
        evaluate(model, entries, &self.extractor)
    }

    pub fn predict(
        &mut self,
        product_type: &str,
        record: &ProductionRecord,
        images: &ImagePair,
    ) -> Result<Prediction> {
        self.ensure_model(product_type)?;
        let model = self.model.as_ref().ok_or_else(not_validated)?;
        predict(model, record, images, &self.extractor)
    }

    /// Persists the current model as a new version.
    pub fn save(&self) -> Result<ArtifactInfo> {
        let model = self.model.as_ref().ok_or_else(not_validated)?;
        if model.state() == ModelState::Validated {
            return Err(Error::ModelState(format!(
                "model '{}' has not been trained yet",
                model.name()
            )));
        }
        let (examples_used, final_loss) = self.last_update;
        self.store.save(model, examples_used, final_loss)
    }

    pub fn summary(&self) -> Result<ModelSummary> {
        self.model
            .as_ref()
            .map(|m| m.summary())
            .ok_or_else(not_validated)
    }
}

fn not_validated() -> Error {
    Error::ModelState("no validated model in this session".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use dryer_core::ArchitectureKind;
    use dryer_features::fixtures;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn session(dir: &TempDir) -> ModelSession<TestBackend> {
        let config = ModelConfig {
            n_epochs: 2,
            batch_size: 4,
            hidden_layers: "8".to_string(),
            cnn_filters: "4".to_string(),
            ..ModelConfig::new("session")
        };
        ModelSession::new(
            config,
            ArtifactStore::new(dir.path().join("models")),
            Default::default(),
        )
    }

    #[test]
    fn test_validate_once() -> Result<()> {
        let dir = TempDir::new()?;
        let mut session = session(&dir);
        assert_eq!(session.state(), ModelState::Unvalidated);
        assert!(matches!(session.validate("  ", "Ail"), Err(Error::ModelState(_))));

        session.validate("m1", "Ail")?;
        assert_eq!(session.state(), ModelState::Validated);
        assert!(matches!(session.validate("m2", "Ail"), Err(Error::ModelState(_))));

        session.reset();
        assert_eq!(session.state(), ModelState::Unvalidated);
        session.validate("m2", "Ail")?;
        Ok(())
    }

    #[test]
    fn test_architecture_frozen_after_validation() -> Result<()> {
        let dir = TempDir::new()?;
        let mut session = session(&dir);

        let fusion = session
            .config()
            .revise(|c| c.architecture = ArchitectureKind::ImageFusion);
        session.set_config(fusion)?;
        session.validate("m1", "Ail")?;

        let epochs = session.config().revise(|c| c.n_epochs = 5);
        session.set_config(epochs)?;
        assert_eq!(session.config().n_epochs, 5);

        let wider = session.config().revise(|c| c.hidden_layers = "32,32".to_string());
        assert!(matches!(session.set_config(wider), Err(Error::ModelState(_))));
        assert_eq!(session.config().hidden_layers, "8");
        Ok(())
    }

    #[test]
    fn test_set_config_sanitizes() -> Result<()> {
        let dir = TempDir::new()?;
        let mut session = session(&dir);
        let broken = session.config().revise(|c| c.batch_size = 0);
        session.set_config(broken)?;
        assert!(session.config().batch_size > 0);
        Ok(())
    }

    #[test]
    fn test_calls_before_validation() -> Result<()> {
        let dir = TempDir::new()?;
        let mut session = session(&dir);
        let registry = TrainingSetRegistry::new();

        assert!(matches!(session.train(&registry), Err(Error::ModelState(_))));
        assert!(matches!(session.summary(), Err(Error::ModelState(_))));
        assert!(matches!(session.save(), Err(Error::ModelState(_))));
        assert!(matches!(session.evaluate("Ail", &[]), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_predict_loads_latest_version() -> Result<()> {
        let dir = TempDir::new()?;
        let registry: TrainingSetRegistry = fixtures::training_sets(dir.path(), "Ail", 4)?
            .into_iter()
            .collect();

        let mut trainer = session(&dir);
        trainer.validate("m1", "Ail")?;
        let outcome = trainer.train(&registry)?;

        let mut operator = session(&dir);
        let images = fixtures::image_pair(dir.path(), "live")?;
        let prediction = operator.predict("Ail", &fixtures::record(3), &images)?;
        assert!(prediction.observed.is_some());
        assert_eq!(operator.state(), ModelState::Trained);
        assert_eq!(
            operator.model().map(|m| m.name().to_string()),
            Some("m1".to_string())
        );
        let latest = operator.store().latest("Ail")?.map(|a| a.metadata.name);
        assert_eq!(latest, Some(outcome.artifact.metadata.name));
        Ok(())
    }

    #[test]
    fn test_load_adopts_trained_image_side() -> Result<()> {
        let dir = TempDir::new()?;
        let registry: TrainingSetRegistry = fixtures::training_sets(dir.path(), "Ail", 4)?
            .into_iter()
            .collect();
        let fusion = |mut s: ModelSession<TestBackend>| {
            let config = s.config().revise(|c| c.architecture = ArchitectureKind::ImageFusion);
            s.set_config(config).map(|_| s)
        };

        let mut trainer =
            fusion(session(&dir).with_extractor(FeatureExtractor::new().with_image_side(16)))?;
        trainer.validate("small", "Ail")?;
        trainer.train(&registry)?;

        let mut operator = fusion(session(&dir))?;
        assert_eq!(operator.extractor().image_shape().height, 32);
        let images = fixtures::image_pair(dir.path(), "live")?;
        let prediction = operator.predict("Ail", &fixtures::record(3), &images)?;

        assert_eq!(prediction.predicted.as_slice().len(), OUTPUT_DIM);
        assert_eq!(
            operator.extractor().image_shape(),
            dryer_core::ImageShape::new(16, 96)
        );
        Ok(())
    }
}
