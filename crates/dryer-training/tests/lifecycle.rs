//! End-to-end training, cross-validation and evaluation on synthetic data.

use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};
use dryer_core::{ArchitectureKind, Error, ModelConfig, Result, FEATURE_DIM, OUTPUT_DIM};
use dryer_features::{fixtures, FeatureExtractor, TrainingSet};
use dryer_training::{
    build, cross_validate, evaluate, train, ArtifactStore, KFold, ModelState, TrainedModel,
};
use tempfile::TempDir;

type TestBackend = Autodiff<NdArray>;

fn config(kind: ArchitectureKind) -> ModelConfig {
    ModelConfig {
        architecture: kind,
        n_epochs: 2,
        batch_size: 4,
        hidden_layers: "16".to_string(),
        cnn_filters: "4".to_string(),
        ..ModelConfig::new("lifecycle")
    }
}

fn model(kind: ArchitectureKind, product: &str) -> TrainedModel<TestBackend> {
    build::<TestBackend>(
        kind,
        FeatureExtractor::new().image_shape(),
        FEATURE_DIM,
        OUTPUT_DIM,
        Arc::new(config(kind)),
        &Default::default(),
    )
    .with_identity("lifecycle", product)
}

#[test]
fn numeric_model_trains_and_persists_one_version() -> Result<()> {
    let dir = TempDir::new()?;
    let store = ArtifactStore::new(dir.path().join("models"));
    let sets = fixtures::training_sets(dir.path(), "Ail", 10)?;
    let mut model = model(ArchitectureKind::Numeric, "Ail");

    let outcome = train(&mut model, &sets, "Ail", &FeatureExtractor::new(), &store)?;

    assert_eq!(outcome.examples_used, 10);
    assert!(outcome.skipped.is_empty());
    assert_eq!(model.state(), ModelState::Trained);
    let versions = store.list_versions("Ail")?;
    assert_eq!(versions.len(), 1);
    assert!(versions[0].name().starts_with("Ail_"));
    assert_eq!(versions[0].metadata.examples_used, 10);
    Ok(())
}

#[test]
fn short_zone_record_is_left_out_of_training() -> Result<()> {
    let dir = TempDir::new()?;
    let store = ArtifactStore::new(dir.path().join("models"));
    let mut sets = fixtures::training_sets(dir.path(), "Ail", 4)?;
    sets.push(TrainingSet::new(
        "five_zones",
        "Ail",
        fixtures::record_with_zones(5),
        fixtures::image_pair(dir.path(), "five")?,
    ));
    // Another product never counts as a candidate.
    sets.extend(fixtures::training_sets(dir.path(), "Oignon", 2)?);
    let mut model = model(ArchitectureKind::Numeric, "Ail");

    let outcome = train(&mut model, &sets, "Ail", &FeatureExtractor::new(), &store)?;

    assert_eq!(outcome.examples_used, 4);
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].name, "five_zones");
    Ok(())
}

#[test]
fn training_without_matching_sets_fails() -> Result<()> {
    let dir = TempDir::new()?;
    let store = ArtifactStore::new(dir.path().join("models"));
    let sets = fixtures::training_sets(dir.path(), "Oignon", 3)?;
    let mut model = model(ArchitectureKind::Numeric, "Ail");

    let result = train(&mut model, &sets, "Ail", &FeatureExtractor::new(), &store);
    assert!(matches!(result, Err(Error::InsufficientData(_))));
    assert!(store.list_versions("Ail")?.is_empty());
    assert_eq!(model.state(), ModelState::Validated);
    Ok(())
}

#[test]
fn evaluation_zero_fills_an_unreadable_image_set() -> Result<()> {
    let dir = TempDir::new()?;
    let mut entries = fixtures::validation_entries(dir.path(), 6)?;
    entries[3].images.conforming[1] = dir.path().join("gone.png");
    let model = model(ArchitectureKind::ImageFusion, "Ail");

    let report = evaluate(&model, &entries, &FeatureExtractor::new())?;

    assert_eq!(report.samples, 6);
    assert_eq!(report.zero_filled, 1);
    assert!(report.metrics.mse.is_finite());
    assert!(report.metrics.mae.is_finite());
    assert!(report.metrics.r2.is_finite());
    Ok(())
}

#[test]
fn cross_validation_folds_are_reproducible() -> Result<()> {
    let dir = TempDir::new()?;
    let sets: Vec<TrainingSet> = fixtures::training_sets(dir.path(), "Ail", 7)?;
    let model = model(ArchitectureKind::Numeric, "Ail");
    let before = model.network().head.weight.val().into_data();

    let first = cross_validate(&model, &sets, "Ail", &FeatureExtractor::new())?;
    assert_eq!(first.folds.len(), 5);
    assert_eq!(first.examples_used, 7);
    assert!(first.mean.mse.is_finite());
    // The model under validation is never trained.
    assert_eq!(model.network().head.weight.val().into_data(), before);
    assert_eq!(model.state(), ModelState::Validated);

    let seed = model.config().cv_seed;
    assert_eq!(KFold::new(5, seed).split(7)?, KFold::new(5, seed).split(7)?);
    Ok(())
}

#[test]
fn cross_validation_needs_five_examples() -> Result<()> {
    let dir = TempDir::new()?;
    let sets = fixtures::training_sets(dir.path(), "Ail", 3)?;
    let model = model(ArchitectureKind::Numeric, "Ail");

    let result = cross_validate(&model, &sets, "Ail", &FeatureExtractor::new());
    assert!(matches!(result, Err(Error::InsufficientData(_))));
    Ok(())
}
