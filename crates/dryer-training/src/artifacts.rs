//! Versioned model artifacts.
//!
//! Each artifact is a pair of files in the store directory:
//! - `{name}.mpk`: network weights written by burn's `CompactRecorder`
//! - `{name}.json`: metadata, including the full config needed to rebuild the network
//!
//! Names are `{product_type}_{%Y%m%d_%H%M%S}`. Saving never replaces an
//! existing artifact; a clashing name gets a numeric suffix. A name is
//! claimed by creating its metadata file exclusively before any weights are
//! written, so concurrent saves for one product always end up distinct.

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use chrono::{Local, Utc};
use dryer_core::{ArchitectureKind, Error, ImageShape, ModelConfig, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{ModelState, TrainedModel};
use crate::network::DryerRegressor;

const WEIGHTS_EXTENSION: &str = "mpk";
const METADATA_EXTENSION: &str = "json";

/// Sidecar describing one persisted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Artifact name, `{product_type}_{timestamp}`
    pub name: String,
    /// Name the model was validated under
    pub model_name: String,
    pub product_type: String,
    pub created_at: String,
    pub architecture: ArchitectureKind,
    pub state: ModelState,
    pub image_shape: ImageShape,
    pub numeric_dim: usize,
    pub output_dim: usize,
    pub num_parameters: usize,
    pub examples_used: usize,
    pub final_loss: Option<f64>,
    pub config: ModelConfig,
}

/// A persisted artifact located on disk.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub metadata: ArtifactMetadata,
    pub weights_path: PathBuf,
    pub metadata_path: PathBuf,
    pub modified: SystemTime,
}

impl ArtifactInfo {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Directory of versioned model artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists `model` as a new version.
    pub fn save<B: AutodiffBackend>(
        &self,
        model: &TrainedModel<B>,
        examples_used: usize,
        final_loss: Option<f64>,
    ) -> Result<ArtifactInfo> {
        if model.product_type().is_empty() {
            return Err(Error::ModelState(format!(
                "model '{}' has no product type to version it under",
                model.name()
            )));
        }
        fs::create_dir_all(&self.dir)?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let (name, mut claim) = self.claim_name(&format!("{}_{timestamp}", model.product_type()))?;
        let stem = self.dir.join(&name);
        let metadata_path = stem.with_extension(METADATA_EXTENSION);

        if let Err(e) = model
            .network()
            .clone()
            .save_file(stem.clone(), &CompactRecorder::new())
        {
            drop(claim);
            let _ = fs::remove_file(&metadata_path);
            return Err(Error::Model(format!("Failed to save model {name}: {e:?}")));
        }

        let metadata = ArtifactMetadata {
            name: name.clone(),
            model_name: model.name().to_string(),
            product_type: model.product_type().to_string(),
            created_at: Utc::now().to_rfc3339(),
            architecture: model.kind(),
            state: model.state(),
            image_shape: model.image_shape(),
            numeric_dim: model.numeric_dim(),
            output_dim: model.output_dim(),
            num_parameters: model.network().num_params(),
            examples_used,
            final_loss,
            config: model.config().as_ref().clone(),
        };
        claim.write_all(serde_json::to_string_pretty(&metadata)?.as_bytes())?;
        claim.sync_all()?;

        let weights_path = stem.with_extension(WEIGHTS_EXTENSION);
        let modified = fs::metadata(&weights_path)?.modified()?;
        info!(artifact = %name, path = %weights_path.display(), "model saved");

        Ok(ArtifactInfo {
            metadata,
            weights_path,
            metadata_path,
            modified,
        })
    }

    /// Reserves the first free name derived from `base` by creating its
    /// metadata file with `create_new`.
    fn claim_name(&self, base: &str) -> Result<(String, File)> {
        let mut suffix = 0u32;
        loop {
            let name = match suffix {
                0 => base.to_string(),
                n => format!("{base}_{n}"),
            };
            suffix += 1;

            let stem = self.dir.join(&name);
            if stem.with_extension(WEIGHTS_EXTENSION).exists() {
                continue;
            }
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(stem.with_extension(METADATA_EXTENSION))
            {
                Ok(file) => return Ok((name, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// All versions for `product_type`, most recently modified first.
    pub fn list_versions(&self, product_type: &str) -> Result<Vec<ArtifactInfo>> {
        let mut versions: Vec<ArtifactInfo> = self
            .scan()?
            .into_iter()
            .filter(|a| a.metadata.product_type == product_type)
            .collect();
        versions.sort_by(|a, b| newest_first(a, b));
        Ok(versions)
    }

    pub fn latest(&self, product_type: &str) -> Result<Option<ArtifactInfo>> {
        Ok(self.list_versions(product_type)?.into_iter().next())
    }

    pub fn find(&self, name: &str) -> Result<ArtifactInfo> {
        self.scan()?
            .into_iter()
            .find(|a| a.metadata.name == name)
            .ok_or_else(|| Error::NotFound(format!("model artifact '{name}'")))
    }

    /// Rebuilds the network from the sidecar config and loads its weights.
    pub fn load<B: AutodiffBackend>(
        &self,
        artifact: &ArtifactInfo,
        device: &B::Device,
    ) -> Result<TrainedModel<B>> {
        let metadata = &artifact.metadata;
        let mut signature = metadata.config.architecture_signature();
        signature.kind = metadata.architecture;

        let network = DryerRegressor::<B>::new(
            metadata.image_shape,
            metadata.numeric_dim,
            metadata.output_dim,
            &signature,
            device,
        )
        .load_file(
            artifact.weights_path.with_extension(""),
            &CompactRecorder::new(),
            device,
        )
        .map_err(|e| Error::Model(format!("Failed to load model {}: {e:?}", metadata.name)))?;

        info!(artifact = %metadata.name, "model loaded");
        Ok(TrainedModel::from_parts(
            metadata.model_name.clone(),
            metadata.product_type.clone(),
            Arc::new(metadata.config.clone()),
            network,
            metadata.image_shape,
            metadata.numeric_dim,
            metadata.output_dim,
            metadata.state,
            device.clone(),
        ))
    }

    fn scan(&self) -> Result<Vec<ArtifactInfo>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let metadata_path = entry?.path();
            if metadata_path.extension().and_then(|e| e.to_str()) != Some(METADATA_EXTENSION) {
                continue;
            }
            // claimed by a save that is still writing
            if fs::metadata(&metadata_path).map(|m| m.len() == 0).unwrap_or(false) {
                debug!(path = %metadata_path.display(), "skipping artifact still being written");
                continue;
            }
            let metadata: ArtifactMetadata = match fs::read_to_string(&metadata_path)
                .map_err(Error::from)
                .and_then(|text| serde_json::from_str(&text).map_err(Error::from))
            {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %metadata_path.display(), error = %err, "ignoring unreadable artifact metadata");
                    continue;
                }
            };
            let weights_path = metadata_path.with_extension(WEIGHTS_EXTENSION);
            let Ok(modified) = fs::metadata(&weights_path).and_then(|m| m.modified()) else {
                warn!(artifact = %metadata.name, "metadata without weights, skipping");
                continue;
            };
            artifacts.push(ArtifactInfo {
                metadata,
                weights_path,
                metadata_path,
                modified,
            });
        }
        Ok(artifacts)
    }
}

/// Orders by weights mtime, then by timestamp and numeric clash suffix.
fn newest_first(a: &ArtifactInfo, b: &ArtifactInfo) -> Ordering {
    b.modified
        .cmp(&a.modified)
        .then_with(|| version_key(&b.metadata).cmp(&version_key(&a.metadata)))
}

/// `({date}_{time}, suffix)` parsed from `{product}_{date}_{time}[_{suffix}]`.
fn version_key(metadata: &ArtifactMetadata) -> (String, u32) {
    let rest = metadata
        .name
        .strip_prefix(metadata.product_type.as_str())
        .and_then(|r| r.strip_prefix('_'))
        .unwrap_or(&metadata.name);
    let mut parts = rest.splitn(3, '_');
    let date = parts.next().unwrap_or_default();
    let time = parts.next().unwrap_or_default();
    let suffix = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (format!("{date}_{time}"), suffix)
}
