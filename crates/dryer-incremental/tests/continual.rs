//! Train, buffer live data, fine-tune and persist through one session.

use burn::backend::{Autodiff, NdArray};
use dryer_core::{ArchitectureKind, ModelConfig, Result};
use dryer_features::{fixtures, TrainingSetRegistry};
use dryer_incremental::{FineTuneMode, ModelSession, ProductionBuffer};
use dryer_training::{ArtifactStore, ModelState};
use tempfile::TempDir;

type TestBackend = Autodiff<NdArray>;

fn session(dir: &TempDir, architecture: ArchitectureKind) -> ModelSession<TestBackend> {
    let config = ModelConfig {
        architecture,
        n_epochs: 2,
        batch_size: 4,
        hidden_layers: "16".to_string(),
        cnn_filters: "4,8".to_string(),
        fine_tuning: true,
        fine_tuning_layers: 1,
        ..ModelConfig::new("continual")
    };
    ModelSession::new(
        config,
        ArtifactStore::new(dir.path().join("models")),
        Default::default(),
    )
}

fn registry(dir: &TempDir, count: usize) -> Result<TrainingSetRegistry> {
    Ok(fixtures::training_sets(dir.path(), "Ail", count)?
        .into_iter()
        .collect())
}

fn buffer(session: &ModelSession<TestBackend>, dir: &TempDir, count: usize) -> Result<ProductionBuffer> {
    let mut buffer = ProductionBuffer::new();
    for i in 0..count {
        let images = fixtures::image_pair(dir.path(), &format!("live_{i}"))?;
        buffer.collect(session.extractor(), &fixtures::record(10 + i), &images, false)?;
    }
    Ok(buffer)
}

#[test]
fn numeric_fine_tuning_degrades_to_a_plain_epoch() -> Result<()> {
    let dir = TempDir::new()?;
    let mut session = session(&dir, ArchitectureKind::Numeric);
    session.validate("numeric", "Ail")?;
    let mut live = buffer(&session, &dir, 3)?;

    let report = session.fine_tune(&mut live, FineTuneMode::Auto)?;

    assert!(report.fine_tuning_disabled);
    assert_eq!(report.epoch.epoch, 1);
    assert_eq!(report.examples_used, 3);
    assert!(!session.config().fine_tuning);
    assert_eq!(session.config().fine_tuning_layers, 0);
    assert_eq!(session.state(), ModelState::FineTuned);
    assert!(live.is_empty());
    Ok(())
}

#[test]
fn fusion_model_trains_then_adapts_and_versions() -> Result<()> {
    let dir = TempDir::new()?;
    let mut session = session(&dir, ArchitectureKind::ImageFusion);
    session.validate("fusion", "Ail")?;

    let trained = session.train(&registry(&dir, 6)?)?;
    assert_eq!(trained.examples_used, 6);
    assert!(session.config().fine_tuning);

    let mut live = buffer(&session, &dir, 2)?;
    let report = session.fine_tune(&mut live, FineTuneMode::RequireLayerFreezing)?;
    assert_eq!(report.plan.frozen.len(), 1);
    assert_eq!(report.plan.trainable.len(), 1);

    let adapted = session.save()?;
    assert_eq!(adapted.metadata.state, ModelState::FineTuned);
    assert_eq!(adapted.metadata.examples_used, 2);

    let versions = session.store().list_versions("Ail")?;
    assert_eq!(versions.len(), 2);
    assert_ne!(versions[0].metadata.name, versions[1].metadata.name);
    Ok(())
}
