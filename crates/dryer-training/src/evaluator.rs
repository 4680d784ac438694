//! Read-only evaluation and live prediction.

use std::fmt;

use burn::{module::AutodiffModule, tensor::backend::AutodiffBackend};
use dryer_core::{
    CoercionLog, Error, ImagePair, PredictedTargetVector, ProductionRecord, RegressionMetrics,
    Result, TargetVector, ValidationEntry,
};
use dryer_features::{ExtractedExample, FeatureExtractor};
use tracing::{info, warn};

use crate::batch::{images_tensor, vectors_tensor};
use crate::model::TrainedModel;
use crate::network::DryerRegressor;

/// Rows fed through the network per forward pass.
const PREDICT_CHUNK: usize = 64;

/// Runs the inference view of `network` over `examples`, row-major output.
pub fn predict_rows<B: AutodiffBackend>(
    network: &DryerRegressor<B>,
    examples: &[&ExtractedExample],
    device: &B::Device,
) -> Vec<f32> {
    let network = network.clone().valid();
    let mut rows = Vec::with_capacity(examples.len() * network.output_dim());
    for chunk in examples.chunks(PREDICT_CHUNK) {
        let images: Vec<_> = chunk.iter().map(|e| &e.image).collect();
        let features: Vec<_> = chunk.iter().map(|e| &e.features).collect();
        let output = network.forward(
            images_tensor::<B::InnerBackend>(&images, device),
            vectors_tensor::<B::InnerBackend>(&features, device),
        );
        rows.extend(output.into_data().iter::<f32>());
    }
    rows
}

#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub metrics: RegressionMetrics,
    /// Entries scored, zero-filled ones included
    pub samples: usize,
    /// Entries whose image set was replaced with zeros
    pub zero_filled: usize,
    /// Entries dropped for lacking setpoint or actual readings
    pub skipped_incomplete: usize,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} over {} samples ({} zero-filled, {} skipped)",
            self.metrics, self.samples, self.zero_filled, self.skipped_incomplete
        )
    }
}

/// Scores `model` against an external validation set.
///
/// Unreadable image sets are zero-filled; entries without usable readings are
/// skipped. The model is never modified.
pub fn evaluate<B: AutodiffBackend>(
    model: &TrainedModel<B>,
    entries: &[ValidationEntry],
    extractor: &FeatureExtractor,
) -> Result<EvaluationReport> {
    let mut examples = Vec::with_capacity(entries.len());
    let mut skipped_incomplete = 0;
    for (index, entry) in entries.iter().enumerate() {
        match extractor.extract_lenient(&entry.record, &entry.images) {
            Ok(example) => examples.push(example),
            Err(err @ Error::IncompleteRecord(_)) => {
                warn!(entry = index, error = %err, "skipping validation entry");
                skipped_incomplete += 1;
            }
            Err(err) => return Err(err),
        }
    }
    if examples.is_empty() {
        return Err(Error::InsufficientData(format!(
            "none of the {} validation entries is usable",
            entries.len()
        )));
    }

    let refs: Vec<&ExtractedExample> = examples.iter().collect();
    let predictions = predict_rows(model.network(), &refs, model.device());
    let targets: Vec<f32> = examples
        .iter()
        .flat_map(|e| e.target.as_slice().iter().copied())
        .collect();
    let metrics = RegressionMetrics::compute(&predictions, &targets, model.output_dim())?;

    let report = EvaluationReport {
        metrics,
        samples: examples.len(),
        zero_filled: examples.iter().filter(|e| e.zero_filled).count(),
        skipped_incomplete,
    };
    info!(model = model.name(), "evaluation: {report}");
    Ok(report)
}

/// A single live prediction.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub predicted: PredictedTargetVector,
    /// Actual readings logged with the record, when present
    pub observed: Option<TargetVector>,
    /// MSE over zone and inlet-air temperatures against `observed`
    pub temperature_mse: Option<f64>,
    pub coercions: CoercionLog,
}

/// Predicts the actual readings for one record and its image pair.
pub fn predict<B: AutodiffBackend>(
    model: &TrainedModel<B>,
    record: &ProductionRecord,
    images: &ImagePair,
    extractor: &FeatureExtractor,
) -> Result<Prediction> {
    let input = extractor.extract_inputs(record, images)?;
    let network = model.network().clone().valid();
    let output = network.forward(
        images_tensor::<B::InnerBackend>(&[&input.image], model.device()),
        vectors_tensor::<B::InnerBackend>(&[&input.features], model.device()),
    );
    let values: Vec<f32> = output.into_data().iter::<f32>().collect();
    let predicted = PredictedTargetVector::from_slice(&values).ok_or_else(|| {
        Error::Model(format!(
            "network produced {} outputs, expected {}",
            values.len(),
            model.output_dim()
        ))
    })?;

    let temperature_mse = input.observed.as_ref().map(|observed| {
        let predicted = predicted.temperatures();
        let observed = observed.temperatures();
        predicted
            .iter()
            .zip(observed)
            .map(|(p, o)| f64::from(p - o).powi(2))
            .sum::<f64>()
            / predicted.len() as f64
    });
    if let Some(mse) = temperature_mse {
        info!(mse, "prediction vs logged temperatures");
    }

    Ok(Prediction {
        predicted,
        observed: input.observed,
        temperature_mse,
        coercions: input.coercions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::build;
    use burn::backend::{Autodiff, NdArray};
    use dryer_core::{ArchitectureKind, ModelConfig, FEATURE_DIM, OUTPUT_DIM};
    use dryer_features::fixtures;
    use std::sync::Arc;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn model(kind: ArchitectureKind) -> TrainedModel<TestBackend> {
        let config = ModelConfig {
            architecture: kind,
            cnn_filters: "4".to_string(),
            hidden_layers: "8".to_string(),
            ..Default::default()
        };
        build::<TestBackend>(
            kind,
            FeatureExtractor::new().image_shape(),
            FEATURE_DIM,
            OUTPUT_DIM,
            Arc::new(config),
            &Default::default(),
        )
    }

    #[test]
    fn test_evaluate_is_read_only() -> Result<()> {
        let dir = TempDir::new()?;
        let entries = fixtures::validation_entries(dir.path(), 3)?;
        let model = model(ArchitectureKind::ImageFusion);
        let before = model.network().head.weight.val().into_data();

        let report = evaluate(&model, &entries, &FeatureExtractor::new())?;
        assert_eq!(report.samples, 3);
        assert_eq!(report.zero_filled, 0);
        assert!(report.metrics.mse.is_finite());
        assert_eq!(model.network().head.weight.val().into_data(), before);
        Ok(())
    }

    #[test]
    fn test_evaluate_skips_incomplete_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let mut entries = fixtures::validation_entries(dir.path(), 3)?;
        entries[1].record = fixtures::record_with_zones(5);

        let report = evaluate(&model(ArchitectureKind::Numeric), &entries, &FeatureExtractor::new())?;
        assert_eq!(report.samples, 2);
        assert_eq!(report.skipped_incomplete, 1);
        Ok(())
    }

    #[test]
    fn test_evaluate_without_usable_entries() {
        let result = evaluate(&model(ArchitectureKind::Numeric), &[], &FeatureExtractor::new());
        assert!(matches!(result, Err(Error::InsufficientData(_))));
    }

    #[test]
    fn test_predict_reports_observed_temperatures() -> Result<()> {
        let dir = TempDir::new()?;
        let images = fixtures::image_pair(dir.path(), "live")?;
        let record = fixtures::record(2);
        let model = model(ArchitectureKind::ImageFusion);

        let prediction = predict(&model, &record, &images, &FeatureExtractor::new())?;
        assert_eq!(prediction.predicted.as_slice().len(), OUTPUT_DIM);
        assert!(prediction.observed.is_some());
        assert!(prediction.temperature_mse.is_some_and(f64::is_finite));
        Ok(())
    }

    #[test]
    fn test_predict_rejects_missing_image() -> Result<()> {
        let dir = TempDir::new()?;
        let mut images = fixtures::image_pair(dir.path(), "live")?;
        images.observed[0] = dir.path().join("missing.png");

        let result = predict(
            &model(ArchitectureKind::Numeric),
            &fixtures::record(0),
            &images,
            &FeatureExtractor::new(),
        );
        assert!(matches!(result, Err(Error::ImageLoad { .. })));
        Ok(())
    }
}
