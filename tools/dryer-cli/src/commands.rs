//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use dryer_core::{Error, ImagePair, ModelConfig, ProcessVector};
use dryer_features::{
    load_validation_entries, FeatureExtractor, RecordStore, TrainingSet, TrainingSetRegistry,
};
use dryer_incremental::{BackgroundRun, FineTuneMode, ModelHandle, ModelSession, ProductionBuffer};
use dryer_training::{backend_name, default_device, ArtifactStore, TrainingBackend};

use crate::settings::{log_import, WorkspaceSettings};

type Session = ModelSession<TrainingBackend>;

pub struct Context {
    settings: WorkspaceSettings,
    extractor: FeatureExtractor,
}

impl Context {
    pub fn new(settings: WorkspaceSettings) -> Self {
        let extractor = FeatureExtractor::new().with_image_side(settings.image_side);
        Self {
            settings,
            extractor,
        }
    }

    fn store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.settings.models_dir)
    }

    fn session(&self, config: ModelConfig) -> Session {
        ModelSession::new(config, self.store(), default_device())
            .with_extractor(self.extractor.clone())
    }

    /// A session holding a persisted model: `name`, or the latest for `product`.
    fn loaded_session(&self, product: &str, name: Option<&str>) -> Result<Session> {
        let store = self.store();
        let artifact = match name {
            Some(name) => store.find(name)?,
            None => store
                .latest(product)?
                .ok_or_else(|| Error::NotFound(format!("no trained model for '{product}'")))?,
        };
        let mut session = self.session(ModelConfig::default());
        session.load(&artifact)?;
        Ok(session)
    }

    fn registry(&self) -> Result<TrainingSetRegistry> {
        let path = &self.settings.sets;
        if !path.exists() {
            warn!(path = %path.display(), "no training-set registry yet");
            return Ok(TrainingSetRegistry::new());
        }
        TrainingSetRegistry::import(path)
            .with_context(|| format!("Failed to read training sets {}", path.display()))
    }

    fn records(&self) -> Result<RecordStore> {
        RecordStore::load(&self.settings.records).context("Failed to read the dryer log")
    }
}

fn wait_with_spinner<T>(run: BackgroundRun<T>) -> Result<T> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner().template("{spinner:.cyan} [{elapsed_precise}] {msg}")?,
    );
    spinner.set_message(format!("{} on {}", run.label(), backend_name()));
    spinner.enable_steady_tick(Duration::from_millis(120));
    while !run.is_finished() {
        thread::sleep(Duration::from_millis(100));
    }
    spinner.finish_and_clear();
    Ok(run.join()?)
}

fn image_pair(conforming: Vec<PathBuf>, observed: Vec<PathBuf>) -> ImagePair {
    ImagePair::new(conforming, observed)
}

fn heading(text: &str) {
    println!("\n{}", text.green().bold());
}

pub fn train(ctx: &Context, product: &str, name: &str, config: Option<&Path>) -> Result<()> {
    let config = ctx.settings.model_config(config)?;
    let sets = ctx.registry()?;
    let mut session = ctx.session(config);
    session.validate(name, product)?;

    let handle = ModelHandle::new(session);
    let outcome = wait_with_spinner(handle.spawn_train(sets)?)?;

    heading("Training complete");
    for epoch in &outcome.history.epochs {
        println!("  {epoch}");
    }
    println!(
        "  examples used: {}",
        outcome.examples_used.to_string().cyan()
    );
    for skipped in &outcome.skipped {
        println!("  {} {}: {}", "skipped".yellow(), skipped.name, skipped.reason);
    }
    println!(
        "  saved {} ({})",
        outcome.artifact.name().bold(),
        outcome.artifact.weights_path.display()
    );
    Ok(())
}

pub fn cross_validate(ctx: &Context, product: &str, config: Option<&Path>) -> Result<()> {
    let config = ctx.settings.model_config(config)?;
    let sets = ctx.registry()?;
    let mut session = ctx.session(config);
    session.validate("cross-validation", product)?;

    let handle = ModelHandle::new(session);
    let report = wait_with_spinner(handle.spawn_cross_validate(sets)?)?;

    heading(&format!(
        "Cross-validation over {} examples",
        report.examples_used
    ));
    for (index, fold) in report.folds.iter().enumerate() {
        println!("  fold {}: {fold}", index + 1);
    }
    println!("  {} {}", "mean:".bold(), report.mean.to_string().cyan());
    Ok(())
}

pub fn evaluate(ctx: &Context, product: &str, validation: &Path, model: Option<&str>) -> Result<()> {
    let entries = load_validation_entries(validation)
        .with_context(|| format!("Failed to read validation file {}", validation.display()))?;
    let mut session = ctx.loaded_session(product, model)?;
    let report = session.evaluate(product, &entries)?;

    heading("Evaluation");
    println!("  MSE: {:.4}", report.metrics.mse);
    println!("  MAE: {:.4}", report.metrics.mae);
    println!("  R²:  {:.4}", report.metrics.r2);
    println!("  samples: {}", report.samples);
    if report.zero_filled > 0 {
        println!(
            "  {} {} entries scored with zero-filled images",
            "note:".yellow(),
            report.zero_filled
        );
    }
    if report.skipped_incomplete > 0 {
        println!(
            "  {} {} incomplete entries skipped",
            "note:".yellow(),
            report.skipped_incomplete
        );
    }
    Ok(())
}

fn vector_rows(vector: &ProcessVector) -> Vec<(String, f32)> {
    let mut rows: Vec<(String, f32)> = vector
        .zone_temperatures()
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("zone {}", i + 1), *v))
        .collect();
    rows.push(("inlet air".to_string(), vector.inlet_air()));
    rows.push(("feed speed".to_string(), vector.feed_speed()));
    for (i, v) in vector.belt_speeds().iter().enumerate() {
        rows.push((format!("belt {}", i + 1), *v));
    }
    rows
}

pub fn predict(
    ctx: &Context,
    product: &str,
    conforming: Vec<PathBuf>,
    observed: Vec<PathBuf>,
    model: Option<&str>,
) -> Result<()> {
    let records = ctx.records()?;
    let record = records
        .latest()
        .ok_or_else(|| Error::NotFound("the dryer log has no record".to_string()))?;
    let images = image_pair(conforming, observed);
    let mut session = ctx.loaded_session(product, model)?;
    let prediction = session.predict(product, record, &images)?;

    heading("Prediction");
    let observed = prediction.observed.as_ref().map(vector_rows);
    for (index, (label, value)) in vector_rows(&prediction.predicted).into_iter().enumerate() {
        match observed.as_ref().and_then(|rows| rows.get(index)) {
            Some((_, actual)) => println!("  {label:<11} {value:>9.2}   (logged {actual:.2})"),
            None => println!("  {label:<11} {value:>9.2}"),
        }
    }
    if let Some(mse) = prediction.temperature_mse {
        println!("  temperature MSE: {}", format!("{mse:.4}").cyan());
    }
    if !prediction.coercions.is_clean() {
        println!(
            "  {} {} values coerced, {} defaulted",
            "note:".yellow(),
            prediction.coercions.coerced,
            prediction.coercions.defaulted
        );
    }
    Ok(())
}

pub fn fine_tune(
    ctx: &Context,
    product: &str,
    batch: &Path,
    model: Option<&str>,
    require_freezing: bool,
) -> Result<()> {
    let entries = load_validation_entries(batch)
        .with_context(|| format!("Failed to read production batch {}", batch.display()))?;
    let mut session = ctx.loaded_session(product, model)?;
    let augmentation = session.config().use_augmentation;

    let mut buffer = ProductionBuffer::new();
    for (index, entry) in entries.iter().enumerate() {
        if let Err(err) = buffer.collect(session.extractor(), &entry.record, &entry.images, augmentation) {
            warn!(entry = index, error = %err, "production entry rejected");
        }
    }
    if buffer.is_empty() {
        bail!("none of the {} production entries could be extracted", entries.len());
    }

    let mode = if require_freezing {
        FineTuneMode::RequireLayerFreezing
    } else {
        FineTuneMode::Auto
    };
    let report = session.fine_tune(&mut buffer, mode)?;
    let artifact = session.save()?;

    heading("Fine-tuning complete");
    println!("  {}", report.epoch);
    println!("  {}", report.plan);
    if report.fine_tuning_disabled {
        println!("  {} layer freezing not available, ran a plain update", "note:".yellow());
    }
    println!("  saved {}", artifact.name().bold());
    Ok(())
}

pub fn models(ctx: &Context, product: &str) -> Result<()> {
    let versions = ctx.store().list_versions(product)?;
    if versions.is_empty() {
        println!("No models for {}", product.bold());
        return Ok(());
    }

    heading(&format!("Models for {product}"));
    for artifact in versions {
        let meta = &artifact.metadata;
        let loss = meta
            .final_loss
            .map(|l| format!("{l:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<28} {:<12} {:<10} examples {:>4}  loss {:>9}  {}",
            meta.name.bold(),
            meta.architecture.to_string(),
            meta.state.to_string(),
            meta.examples_used,
            loss,
            meta.created_at.dimmed()
        );
    }
    Ok(())
}

pub fn summary(ctx: &Context, product: &str, model: Option<&str>, fresh: bool) -> Result<()> {
    let session = if fresh {
        let mut session = ctx.session(ctx.settings.model_config(None)?);
        session.validate("summary", product)?;
        session
    } else {
        ctx.loaded_session(product, model)?
    };
    heading("Model summary");
    println!("{}", session.summary()?);
    Ok(())
}

pub fn config_show(ctx: &Context) -> Result<()> {
    let config = ctx.settings.model_config(None)?;
    println!("{}", config.to_json()?);
    if let Err(err) = config.validate() {
        println!("{} {err}", "warning:".yellow());
    }
    Ok(())
}

pub fn config_export(ctx: &Context, path: &Path) -> Result<()> {
    let config = ctx.settings.model_config(None)?;
    config.save(path)?;
    println!("Config exported to {}", path.display().to_string().bold());
    Ok(())
}

pub fn config_import(ctx: &Context, path: &Path) -> Result<()> {
    let (config, report) = ModelConfig::load(path)
        .with_context(|| format!("Failed to import config {}", path.display()))?;
    log_import(path, &report);

    let destination = ctx
        .settings
        .model_config
        .clone()
        .unwrap_or_else(|| PathBuf::from("model_config.json"));
    config.sanitized().save(&destination)?;

    println!("Config imported into {}", destination.display().to_string().bold());
    if !report.unknown.is_empty() {
        println!("  kept unknown keys: {}", report.unknown.join(", ").yellow());
    }
    if !report.rejected.is_empty() {
        println!("  rejected values: {}", report.rejected.join(", ").red());
    }
    if ctx.settings.model_config.is_none() {
        println!("  set `model_config` in the settings file to use it");
    }
    Ok(())
}

pub fn sets_list(ctx: &Context, product: Option<&str>) -> Result<()> {
    let registry = ctx.registry()?;
    let sets: Vec<&TrainingSet> = registry
        .display_names()
        .into_iter()
        .filter_map(|name| registry.find(name))
        .filter(|set| product.map_or(true, |p| set.product_type == p))
        .collect();
    if sets.is_empty() {
        println!("No training sets");
        return Ok(());
    }

    heading("Training sets");
    for set in sets {
        println!(
            "  {:<16} {:<10} {}",
            set.name.bold(),
            set.product_type,
            set.record.timestamp.as_deref().unwrap_or("-").dimmed()
        );
    }
    Ok(())
}

pub fn sets_add(
    ctx: &Context,
    product: &str,
    name: Option<String>,
    conforming: Vec<PathBuf>,
    observed: Vec<PathBuf>,
) -> Result<()> {
    let records = ctx.records()?;
    let record = records
        .latest()
        .ok_or_else(|| Error::NotFound("the dryer log has no record".to_string()))?
        .clone();
    let images = image_pair(conforming, observed);
    ctx.extractor
        .extract(&record, &images, false)
        .context("The set would not be usable for training")?;

    let mut registry = ctx.registry()?;
    let name = name.unwrap_or_else(|| registry.next_default_name());
    registry.push(TrainingSet::new(name.clone(), product, record, images));
    registry.export(&ctx.settings.sets)?;
    println!("Added {} for {}", name.bold(), product);
    Ok(())
}

pub fn sets_export(ctx: &Context, path: &Path) -> Result<()> {
    let registry = ctx.registry()?;
    registry.export(path)?;
    println!("Exported {} sets to {}", registry.len(), path.display());
    Ok(())
}

pub fn sets_import(ctx: &Context, path: &Path) -> Result<()> {
    let registry = TrainingSetRegistry::import(path)
        .with_context(|| format!("Failed to import training sets {}", path.display()))?;
    registry.export(&ctx.settings.sets)?;
    println!("Imported {} sets", registry.len());
    Ok(())
}
